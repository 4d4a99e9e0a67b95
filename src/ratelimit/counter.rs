//! Fixed-window counter: atomic check-and-increment for one quota rule.
//!
//! `KEYS`: rule hash, bucket prefix. `ARGV`: period, aligned timestamp (ms),
//! TTL (s). Reply: `[limit, used, admitted]`, where `limit` is 0 when the
//! rule is not configured and nothing was touched.

use super::keys::{bucket_prefix, config_key, segment_key};
use super::period::{Period, Window};
use super::procedure::{int_at, key_at, text_at, Keyspace, Value};
use super::rules::LimitKind;
use crate::error::{Result, StoreResult, TollgateError};

pub(crate) const SCRIPT: &str = r#"
local config_key = KEYS[1]
local bucket_prefix = KEYS[2]
local period = ARGV[1]
local timestamp = tonumber(ARGV[2])
local ttl = tonumber(ARGV[3])

local stored = redis.call("HGET", config_key, period)
if not stored then
    return {0, 0, 0}
end
local limit = tonumber(stored)
if not limit then
    return redis.error_reply("ERR value at key " .. config_key .. " is not an integer")
end

local bucket = string.format("%s%d", bucket_prefix, timestamp)
local created = redis.call("SETNX", bucket, 0)
if created == 1 then
    redis.call("EXPIRE", bucket, ttl)
end

local used = tonumber(redis.call("GET", bucket))
local admitted = 0
if used < limit then
    used = redis.call("INCR", bucket)
    admitted = 1
end

return {limit, used, admitted}
"#;

pub(crate) fn execute(
    keyspace: &mut dyn Keyspace,
    keys: &[String],
    args: &[Value],
) -> StoreResult<Vec<Value>> {
    let config_key = key_at(keys, 0)?;
    let prefix = key_at(keys, 1)?;
    let period = text_at(args, 0)?;
    let timestamp = int_at(args, 1)?;
    let ttl = int_at(args, 2)?;

    let Some(limit) = keyspace.hget(config_key, &period)? else {
        return Ok(CounterReply::unconfigured().into_values());
    };

    let bucket = segment_key(prefix, timestamp);
    if keyspace.set_nx(&bucket, 0)? {
        keyspace.expire(&bucket, ttl)?;
    }

    let mut used = keyspace.get(&bucket)?.unwrap_or(0);
    let admitted = used < limit;
    if admitted {
        used = keyspace.incr(&bucket)?;
    }

    Ok(CounterReply {
        limit,
        used,
        admitted,
    }
    .into_values())
}

/// `KEYS` and `ARGV` for a single-rule check of `kind`.
pub(crate) fn arguments(
    client: &str,
    kind: LimitKind,
    period: Period,
    window: Window,
) -> (Vec<String>, Vec<Value>) {
    let keys = vec![config_key(client, kind), bucket_prefix(client, kind, period)];
    let args = vec![
        Value::from(period.as_str()),
        Value::from(window.timestamp_ms),
        Value::from(window.ttl_secs),
    ];
    (keys, args)
}

/// Decoded reply of a single-rule procedure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterReply {
    /// Configured limit, 0 when unconfigured
    pub limit: i64,
    /// Consumption after this call
    pub used: i64,
    /// Whether this call was counted
    pub admitted: bool,
}

impl CounterReply {
    fn unconfigured() -> Self {
        Self {
            limit: 0,
            used: 0,
            admitted: false,
        }
    }

    /// Whether the rule exists.
    pub fn is_configured(&self) -> bool {
        self.limit > 0
    }

    fn into_values(self) -> Vec<Value> {
        vec![
            Value::Int(self.limit),
            Value::Int(self.used),
            Value::Int(i64::from(self.admitted)),
        ]
    }

    /// Validate and decode a raw reply.
    pub fn decode(reply: &[Value]) -> Result<Self> {
        let [limit, used, admitted] = reply else {
            return Err(TollgateError::Decode(format!(
                "counter reply has {} elements, expected 3",
                reply.len()
            )));
        };

        let int = |value: &Value, name: &str| {
            value.as_int().ok_or_else(|| {
                TollgateError::Decode(format!("counter reply field {name} is not an integer"))
            })
        };

        let admitted = match int(admitted, "admitted")? {
            0 => false,
            1 => true,
            other => {
                return Err(TollgateError::Decode(format!(
                    "counter reply admitted flag is {other}"
                )))
            }
        };

        Ok(Self {
            limit: int(limit, "limit")?,
            used: int(used, "used")?,
            admitted,
        })
    }
}
