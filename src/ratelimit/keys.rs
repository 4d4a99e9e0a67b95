//! Store key derivation.
//!
//! Rule mappings live in one hash per client and kind; counters live in
//! self-expiring buckets named after the window they count.

use std::fmt;

use super::period::Period;
use super::rules::LimitKind;

/// Key of the hash holding a client's rules of one kind: `{client}_{kind}`.
pub fn config_key(client: &str, kind: LimitKind) -> String {
    format!("{}_{}", client, kind)
}

/// Key of the bucket counting one window (or rate sub-segment).
///
/// Rendered as `{client}_{kind}_{period}_{timestamp_ms}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey {
    /// The client the bucket belongs to
    pub client: String,
    /// Quota or rate
    pub kind: LimitKind,
    /// The rule's period
    pub period: Period,
    /// Aligned window start in epoch milliseconds
    pub timestamp_ms: i64,
}

impl BucketKey {
    /// Create a new bucket key.
    pub fn new(client: &str, kind: LimitKind, period: Period, timestamp_ms: i64) -> Self {
        Self {
            client: client.to_string(),
            kind,
            period,
            timestamp_ms,
        }
    }

    /// Everything before the timestamp. Procedures append segment timestamps to it.
    pub fn prefix(&self) -> String {
        bucket_prefix(&self.client, self.kind, self.period)
    }
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.prefix(), self.timestamp_ms)
    }
}

/// `{client}_{kind}_{period}_`
pub fn bucket_prefix(client: &str, kind: LimitKind, period: Period) -> String {
    format!("{}_{}_{}_", client, kind, period)
}

/// Join a bucket prefix and a timestamp.
pub(crate) fn segment_key(prefix: &str, timestamp_ms: i64) -> String {
    format!("{}{}", prefix, timestamp_ms)
}
