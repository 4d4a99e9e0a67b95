//! Sliding-window counter: atomic check-and-increment for one rate rule.
//!
//! A rate window is split into [`RATE_SEGMENTS`] sub-segments, each with its
//! own bucket. Consumption is the sum of the current segment and the segments
//! before it, walking back until a segment is missing or the whole window is
//! covered. An admitted call is always counted in the current segment.
//!
//! `KEYS` and `ARGV` are laid out as for the fixed-window
//! [`counter`](super::counter), and so is the reply.

use super::keys::segment_key;
use super::period::{segment_millis, RATE_SEGMENTS};
use super::procedure::{int_at, key_at, text_at, Keyspace, Value};
use crate::error::StoreResult;

pub(crate) const SCRIPT: &str = r#"
local config_key = KEYS[1]
local bucket_prefix = KEYS[2]
local period = ARGV[1]
local timestamp = tonumber(ARGV[2])
local ttl = tonumber(ARGV[3])
local segment = ttl * 1000 / 10

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

local used = 0
for i = 0, 9 do
    local count = redis.call("GET", string.format("%s%d", bucket_prefix, timestamp - i * segment))
    if not count then
        break
    end
    used = used + tonumber(count)
end

local admitted = 0
if used < limit then
    redis.call("INCR", bucket)
    used = used + 1
    admitted = 1
end

if created == 1 then
    redis.call("EXPIRE", bucket, ttl)
end

return {limit, used, admitted}
"#;

/// Sum the current segment and up to `RATE_SEGMENTS - 1` earlier ones.
///
/// A missing current segment counts as zero; a missing earlier segment ends
/// the walk. The current segment always exists when this runs inside the
/// procedure, so a caller that keeps calling keeps the chain unbroken.
fn chained_sum(
    keyspace: &mut dyn Keyspace,
    prefix: &str,
    timestamp: i64,
    ttl_secs: i64,
) -> StoreResult<i64> {
    let segment = segment_millis(ttl_secs);
    let mut used = keyspace
        .get(&segment_key(prefix, timestamp))?
        .unwrap_or(0);

    for step in 1..RATE_SEGMENTS {
        match keyspace.get(&segment_key(prefix, timestamp - step * segment))? {
            Some(count) => used += count,
            None => break,
        }
    }

    Ok(used)
}

/// Sum every segment of the window ending at `timestamp`, skipping missing ones.
///
/// Used where rejected calls leave no bucket behind, so a gap does not mean
/// the window is empty before it.
pub(crate) fn window_sum(
    keyspace: &mut dyn Keyspace,
    prefix: &str,
    timestamp: i64,
    ttl_secs: i64,
) -> StoreResult<i64> {
    let segment = segment_millis(ttl_secs);
    let mut used = 0;
    for step in 0..RATE_SEGMENTS {
        used += keyspace
            .get(&segment_key(prefix, timestamp - step * segment))?
            .unwrap_or(0);
    }
    Ok(used)
}

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
        return Ok(vec![Value::Int(0), Value::Int(0), Value::Int(0)]);
    };

    let bucket = segment_key(prefix, timestamp);
    let created = keyspace.set_nx(&bucket, 0)?;

    let mut used = chained_sum(keyspace, prefix, timestamp, ttl)?;
    let admitted = used < limit;
    if admitted {
        keyspace.incr(&bucket)?;
        used += 1;
    }

    if created {
        keyspace.expire(&bucket, ttl)?;
    }

    Ok(vec![
        Value::Int(limit),
        Value::Int(used),
        Value::Int(i64::from(admitted)),
    ])
}
