//! Registry of the atomic procedures the limiter runs inside the store.
//!
//! Each procedure has a Lua body (what Redis executes) and a native body
//! (what [`MemoryStore`](crate::store::MemoryStore) executes). Both take the
//! same `KEYS`/`ARGV` layout and produce the same flat reply, so the facade
//! never knows which store it talks to. Procedures are addressed by the SHA-1
//! digest of their Lua body, which makes registration idempotent.

use std::fmt;

use crate::error::{StoreError, StoreResult};

use super::{counter, multi_counter, sliding_window};

/// Stable identifier for an atomic procedure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcedureId {
    /// Fixed-window check-and-increment
    Counter,
    /// Sliding-window check-and-increment
    SlidingWindow,
    /// All-or-nothing admission over many rules
    MultiCounter,
}

impl ProcedureId {
    /// Every procedure, in registration order.
    pub const ALL: [ProcedureId; 3] = [
        ProcedureId::Counter,
        ProcedureId::SlidingWindow,
        ProcedureId::MultiCounter,
    ];

    /// Human readable name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            ProcedureId::Counter => "counter",
            ProcedureId::SlidingWindow => "sliding_window",
            ProcedureId::MultiCounter => "multi_counter",
        }
    }

    fn body(&self) -> &'static str {
        match self {
            ProcedureId::Counter => counter::SCRIPT,
            ProcedureId::SlidingWindow => sliding_window::SCRIPT,
            ProcedureId::MultiCounter => multi_counter::SCRIPT,
        }
    }
}

impl fmt::Display for ProcedureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A scalar passed to or returned from a procedure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// Integer
    Int(i64),
    /// String
    Text(String),
}

impl Value {
    /// The integer, if this is one.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            Value::Text(_) => None,
        }
    }

    /// The string, if this is one.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Int(_) => None,
            Value::Text(s) => Some(s),
        }
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

/// Operations a native procedure body may perform on the keyspace.
///
/// Mirrors the subset of Redis commands the Lua bodies call.
pub trait Keyspace {
    /// `GET` parsed as an integer.
    fn get(&mut self, key: &str) -> StoreResult<Option<i64>>;
    /// `SETNX`. Returns `true` if the key was created.
    fn set_nx(&mut self, key: &str, value: i64) -> StoreResult<bool>;
    /// `EXPIRE` in seconds.
    fn expire(&mut self, key: &str, ttl_secs: i64) -> StoreResult<()>;
    /// `INCR`. Returns the value after incrementing.
    fn incr(&mut self, key: &str) -> StoreResult<i64>;
    /// `HGET` parsed as an integer.
    fn hget(&mut self, key: &str, field: &str) -> StoreResult<Option<i64>>;
}

type NativeBody = fn(&mut dyn Keyspace, &[String], &[Value]) -> StoreResult<Vec<Value>>;

/// An atomic procedure: identifier, Lua body and content digest.
#[derive(Debug, Clone)]
pub struct Procedure {
    id: ProcedureId,
    body: &'static str,
    digest: String,
}

impl Procedure {
    /// Build the procedure for `id`, computing its digest.
    pub fn new(id: ProcedureId) -> Self {
        let body = id.body();
        Self {
            id,
            body,
            digest: redis::Script::new(body).get_hash().to_string(),
        }
    }

    /// The procedure's identifier.
    pub fn id(&self) -> ProcedureId {
        self.id
    }

    /// Lua source.
    pub fn body(&self) -> &'static str {
        self.body
    }

    /// SHA-1 digest of the Lua source, hex encoded.
    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// Run the native body against `keyspace`.
    ///
    /// The caller is responsible for making the call atomic.
    pub fn run_native(
        &self,
        keyspace: &mut dyn Keyspace,
        keys: &[String],
        args: &[Value],
    ) -> StoreResult<Vec<Value>> {
        let body: NativeBody = match self.id {
            ProcedureId::Counter => counter::execute,
            ProcedureId::SlidingWindow => sliding_window::execute,
            ProcedureId::MultiCounter => multi_counter::execute,
        };
        body(keyspace, keys, args)
    }
}

/// Named set of procedures, one per [`ProcedureId`].
#[derive(Debug, Clone)]
pub struct ProcedureRegistry {
    procedures: [Procedure; 3],
}

impl ProcedureRegistry {
    /// Build the registry with every known procedure.
    pub fn new() -> Self {
        Self {
            procedures: ProcedureId::ALL.map(Procedure::new),
        }
    }

    /// Look up a procedure by identifier.
    pub fn get(&self, id: ProcedureId) -> &Procedure {
        // Discriminants follow the order of ProcedureId::ALL.
        &self.procedures[id as usize]
    }

    /// Look up a procedure by content digest.
    pub fn by_digest(&self, digest: &str) -> Option<&Procedure> {
        self.procedures.iter().find(|p| p.digest == digest)
    }

    /// Iterate over all procedures.
    pub fn iter(&self) -> impl Iterator<Item = &Procedure> {
        self.procedures.iter()
    }
}

impl Default for ProcedureRegistry {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn key_at<'a>(keys: &'a [String], index: usize) -> StoreResult<&'a str> {
    keys.get(index)
        .map(String::as_str)
        .ok_or_else(|| StoreError::Script(format!("missing KEYS[{}]", index + 1)))
}

pub(crate) fn int_at(args: &[Value], index: usize) -> StoreResult<i64> {
    match args.get(index) {
        Some(Value::Int(n)) => Ok(*n),
        Some(Value::Text(s)) => s
            .parse()
            .map_err(|_| StoreError::Script(format!("ARGV[{}] is not an integer", index + 1))),
        None => Err(StoreError::Script(format!("missing ARGV[{}]", index + 1))),
    }
}

pub(crate) fn text_at(args: &[Value], index: usize) -> StoreResult<String> {
    match args.get(index) {
        Some(Value::Text(s)) => Ok(s.clone()),
        Some(Value::Int(n)) => Ok(n.to_string()),
        None => Err(StoreError::Script(format!("missing ARGV[{}]", index + 1))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_has_every_procedure() {
        let registry = ProcedureRegistry::new();
        for id in ProcedureId::ALL {
            assert_eq!(registry.get(id).id(), id);
        }
        assert_eq!(registry.iter().count(), 3);
    }

    #[test]
    fn test_digests_are_stable_and_distinct() {
        let first = ProcedureRegistry::new();
        let second = ProcedureRegistry::new();

        for id in ProcedureId::ALL {
            let digest = first.get(id).digest();
            assert_eq!(digest.len(), 40);
            assert_eq!(digest, second.get(id).digest());
        }

        assert_ne!(
            first.get(ProcedureId::Counter).digest(),
            first.get(ProcedureId::MultiCounter).digest()
        );
    }

    #[test]
    fn test_lookup_by_digest() {
        let registry = ProcedureRegistry::new();
        let digest = registry.get(ProcedureId::SlidingWindow).digest().to_string();

        let found = registry.by_digest(&digest).map(Procedure::id);
        assert_eq!(found, Some(ProcedureId::SlidingWindow));
        assert!(registry.by_digest("0000").is_none());
    }

    #[test]
    fn test_argument_helpers() {
        let args = vec![Value::from("minute"), Value::from(60), Value::from("17")];

        assert_eq!(text_at(&args, 0).unwrap(), "minute");
        assert_eq!(int_at(&args, 1).unwrap(), 60);
        assert_eq!(int_at(&args, 2).unwrap(), 17);
        assert!(int_at(&args, 0).is_err());
        assert!(int_at(&args, 5).is_err());
        assert!(key_at(&[], 0).is_err());
    }
}
