//! All-or-nothing admission over every rule of one client.
//!
//! Quota rules are checked first, then rate rules, all without writing. The
//! first rule at or over its limit ends the call with nothing mutated. Rate
//! rules sum every segment still in the window: rejected calls create no
//! buckets, so a missing segment must not hide the ones before it. Only
//! when every rule passes are the buckets created (with their TTL) and
//! incremented, inside the same atomic execution, so a request is either
//! counted by every rule or by none.
//!
//! `KEYS`: one bucket prefix per rule, quota rules first.
//! `ARGV`: quota rule count, then `timestamp, ttl, limit` per rule.
//! Reply: `[1, (kind, ttl, limit, used) per rule]` when admitted,
//! `[0, kind, ttl, limit, used]` for the rejecting rule otherwise.

use super::keys::{bucket_prefix, segment_key};
use super::procedure::{int_at, key_at, Keyspace, Value};
use super::rules::{CheckResult, LimitKind, ResolvedRule};
use super::sliding_window::window_sum;
use crate::error::{Result, StoreResult, TollgateError};

pub(crate) const SCRIPT: &str = r#"
local quota_count = tonumber(ARGV[1])
local pending = {}
local result = {1}

for i, prefix in ipairs(KEYS) do
    local base = 2 + (i - 1) * 3
    local timestamp = tonumber(ARGV[base])
    local ttl = tonumber(ARGV[base + 1])
    local limit = tonumber(ARGV[base + 2])
    local kind = "quota"
    if i > quota_count then
        kind = "rate"
    end

    local bucket = string.format("%s%d", prefix, timestamp)
    local used = tonumber(redis.call("GET", bucket) or "0")
    if kind == "rate" then
        local segment = ttl * 1000 / 10
        for step = 1, 9 do
            local count = redis.call("GET", string.format("%s%d", prefix, timestamp - step * segment))
            if count then
                used = used + tonumber(count)
            end
        end
    end

    if used >= limit then
        return {0, kind, ttl, limit, used}
    end

    table.insert(pending, {bucket, ttl})
    table.insert(result, kind)
    table.insert(result, ttl)
    table.insert(result, limit)
    table.insert(result, used + 1)
end

for _, entry in ipairs(pending) do
    if redis.call("SETNX", entry[1], 0) == 1 then
        redis.call("EXPIRE", entry[1], entry[2])
    end
    redis.call("INCR", entry[1])
end

return result
"#;

const ADMITTED: i64 = 1;
const REJECTED: i64 = 0;
const FIELDS_PER_RULE: usize = 4;

pub(crate) fn execute(
    keyspace: &mut dyn Keyspace,
    keys: &[String],
    args: &[Value],
) -> StoreResult<Vec<Value>> {
    let quota_count = usize::try_from(int_at(args, 0)?).unwrap_or(0);
    let mut pending = Vec::with_capacity(keys.len());
    let mut result = vec![Value::Int(ADMITTED)];

    for index in 0..keys.len() {
        let prefix = key_at(keys, index)?;
        let base = 1 + index * 3;
        let timestamp = int_at(args, base)?;
        let ttl = int_at(args, base + 1)?;
        let limit = int_at(args, base + 2)?;
        let kind = if index < quota_count {
            LimitKind::Quota
        } else {
            LimitKind::Rate
        };

        let bucket = segment_key(prefix, timestamp);
        let used = match kind {
            LimitKind::Quota => keyspace.get(&bucket)?.unwrap_or(0),
            LimitKind::Rate => window_sum(keyspace, prefix, timestamp, ttl)?,
        };

        if used >= limit {
            return Ok(vec![
                Value::Int(REJECTED),
                Value::from(kind.as_str()),
                Value::Int(ttl),
                Value::Int(limit),
                Value::Int(used),
            ]);
        }

        pending.push((bucket, ttl));
        result.extend([
            Value::from(kind.as_str()),
            Value::Int(ttl),
            Value::Int(limit),
            Value::Int(used + 1),
        ]);
    }

    for (bucket, ttl) in &pending {
        if keyspace.set_nx(bucket, 0)? {
            keyspace.expire(bucket, *ttl)?;
        }
        keyspace.incr(bucket)?;
    }

    Ok(result)
}

/// `KEYS` and `ARGV` for one admission over `quota` then `rate` rules.
pub(crate) fn arguments(
    client: &str,
    quota: &[ResolvedRule],
    rate: &[ResolvedRule],
) -> (Vec<String>, Vec<Value>) {
    let rules = quota.iter().chain(rate);

    let keys = rules
        .clone()
        .map(|rule| bucket_prefix(client, rule.kind, rule.period))
        .collect();

    let mut args = Vec::with_capacity(1 + 3 * (quota.len() + rate.len()));
    args.push(Value::Int(quota.len() as i64));
    for rule in rules {
        args.extend([
            Value::Int(rule.window.timestamp_ms),
            Value::Int(rule.window.ttl_secs),
            Value::Int(rule.limit),
        ]);
    }

    (keys, args)
}

/// One rule's entry in a multi-counter reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuleUsage {
    /// Quota or rate
    pub kind: LimitKind,
    /// Window length in seconds
    pub window_length: i64,
    /// Limit the rule was checked against
    pub limit: i64,
    /// Consumption after the call (admitted) or at rejection (rejected)
    pub used: i64,
}

/// Decoded multi-counter reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MultiCounterReply {
    /// Every rule passed and was counted; one entry per rule in input order.
    Admitted(Vec<RuleUsage>),
    /// The named rule rejected the request and nothing was counted.
    Rejected(RuleUsage),
}

impl MultiCounterReply {
    /// Validate and decode a raw reply produced for `expected_rules` rules.
    pub fn decode(reply: &[Value], expected_rules: usize) -> Result<Self> {
        let (status, rest) = reply
            .split_first()
            .ok_or_else(|| TollgateError::Decode("empty multi-counter reply".to_string()))?;

        match status.as_int() {
            Some(ADMITTED) => {
                if rest.len() != expected_rules * FIELDS_PER_RULE {
                    return Err(TollgateError::Decode(format!(
                        "admitted reply has {} elements, expected {} for {} rules",
                        reply.len(),
                        1 + expected_rules * FIELDS_PER_RULE,
                        expected_rules
                    )));
                }
                rest.chunks_exact(FIELDS_PER_RULE)
                    .map(decode_usage)
                    .collect::<Result<Vec<_>>>()
                    .map(MultiCounterReply::Admitted)
            }
            Some(REJECTED) => {
                if rest.len() != FIELDS_PER_RULE {
                    return Err(TollgateError::Decode(format!(
                        "rejected reply has {} elements, expected {}",
                        reply.len(),
                        1 + FIELDS_PER_RULE
                    )));
                }
                decode_usage(rest).map(MultiCounterReply::Rejected)
            }
            _ => Err(TollgateError::Decode(format!(
                "unknown multi-counter status {:?}",
                status
            ))),
        }
    }

    /// Whether the request was admitted.
    pub fn is_admitted(&self) -> bool {
        matches!(self, MultiCounterReply::Admitted(_))
    }

    /// Map the reply onto per-rule results.
    pub fn into_results(self) -> Vec<CheckResult> {
        match self {
            MultiCounterReply::Admitted(rules) => rules
                .into_iter()
                .map(|r| CheckResult::admitted(r.kind, r.window_length, r.limit, r.used))
                .collect(),
            MultiCounterReply::Rejected(r) => {
                vec![CheckResult::rejected(r.kind, r.window_length, r.limit, r.used)]
            }
        }
    }
}

fn decode_usage(fields: &[Value]) -> Result<RuleUsage> {
    let [kind, ttl, limit, used] = fields else {
        return Err(TollgateError::Decode(format!(
            "rule entry has {} elements, expected {}",
            fields.len(),
            FIELDS_PER_RULE
        )));
    };

    let kind = kind
        .as_text()
        .ok_or_else(|| TollgateError::Decode("rule kind is not a string".to_string()))?
        .parse::<LimitKind>()
        .map_err(|e| TollgateError::Decode(e.to_string()))?;

    let int = |value: &Value, name: &str| {
        value
            .as_int()
            .ok_or_else(|| TollgateError::Decode(format!("rule {name} is not an integer")))
    };

    Ok(RuleUsage {
        kind,
        window_length: int(ttl, "ttl")?,
        limit: int(limit, "limit")?,
        used: int(used, "used")?,
    })
}
