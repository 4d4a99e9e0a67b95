//! In-process counter store.
//!
//! Emulates the parts of Redis the limiter relies on: integer keys with
//! expiry, hashes, and procedures that run with the whole keyspace locked so
//! they are atomic with respect to every other caller.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::CounterStore;
use crate::clock::{Clock, SystemClock};
use crate::error::{StoreError, StoreResult};
use crate::ratelimit::procedure::{Keyspace, Procedure, Value};

#[derive(Debug, Clone)]
enum Data {
    Int(i64),
    Hash(HashMap<String, String>),
}

#[derive(Debug, Clone)]
struct Entry {
    data: Data,
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    procedures: HashSet<String>,
}

impl Inner {
    /// The entry at `key`, dropping it first if it has expired.
    fn live(&mut self, key: &str, now: DateTime<Utc>) -> Option<&mut Entry> {
        let expired = self
            .entries
            .get(key)
            .and_then(|e| e.expires_at)
            .is_some_and(|at| at <= now);
        if expired {
            self.entries.remove(key);
        }
        self.entries.get_mut(key)
    }
}

/// A keyspace view pinned to one instant, like time inside a Redis script.
struct Session<'a> {
    inner: &'a mut Inner,
    now: DateTime<Utc>,
}

impl Keyspace for Session<'_> {
    fn get(&mut self, key: &str) -> StoreResult<Option<i64>> {
        match self.inner.live(key, self.now) {
            None => Ok(None),
            Some(Entry { data: Data::Int(n), .. }) => Ok(Some(*n)),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    fn set_nx(&mut self, key: &str, value: i64) -> StoreResult<bool> {
        if self.inner.live(key, self.now).is_some() {
            return Ok(false);
        }
        self.inner.entries.insert(
            key.to_string(),
            Entry {
                data: Data::Int(value),
                expires_at: None,
            },
        );
        Ok(true)
    }

    fn expire(&mut self, key: &str, ttl_secs: i64) -> StoreResult<()> {
        if ttl_secs <= 0 {
            self.inner.entries.remove(key);
            return Ok(());
        }
        let at = self.now + Duration::seconds(ttl_secs);
        if let Some(entry) = self.inner.live(key, self.now) {
            entry.expires_at = Some(at);
        }
        Ok(())
    }

    fn incr(&mut self, key: &str) -> StoreResult<i64> {
        match self.inner.live(key, self.now) {
            Some(Entry { data: Data::Int(n), .. }) => {
                *n += 1;
                Ok(*n)
            }
            Some(_) => Err(StoreError::WrongType(key.to_string())),
            None => {
                self.inner.entries.insert(
                    key.to_string(),
                    Entry {
                        data: Data::Int(1),
                        expires_at: None,
                    },
                );
                Ok(1)
            }
        }
    }

    fn hget(&mut self, key: &str, field: &str) -> StoreResult<Option<i64>> {
        match self.inner.live(key, self.now) {
            None => Ok(None),
            Some(Entry { data: Data::Hash(fields), .. }) => fields
                .get(field)
                .map(|v| v.parse().map_err(|_| StoreError::NotInteger(key.to_string())))
                .transpose(),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }
}

/// Counter store kept in process memory.
///
/// Every operation takes one lock over the whole keyspace, which is what makes
/// procedure execution atomic. Clones share the same keyspace.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("keys", &self.inner.lock().entries.len())
            .finish()
    }
}

impl MemoryStore {
    /// Create an empty store that expires keys by system time.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an empty store that expires keys by `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            clock,
        }
    }

    /// Current value of an integer key, if live.
    pub fn counter(&self, key: &str) -> Option<i64> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        match inner.live(key, now) {
            Some(Entry { data: Data::Int(n), .. }) => Some(*n),
            _ => None,
        }
    }

    /// Seconds until `key` expires. `None` if the key is missing or has no expiry.
    pub fn ttl(&self, key: &str) -> Option<i64> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        inner
            .live(key, now)
            .and_then(|e| e.expires_at)
            .map(|at| (at - now).num_seconds())
    }

    /// Overwrite an integer key without expiry.
    pub fn set_counter(&self, key: &str, value: i64) {
        self.inner.lock().entries.insert(
            key.to_string(),
            Entry {
                data: Data::Int(value),
                expires_at: None,
            },
        );
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        inner
            .entries
            .retain(|_, e| e.expires_at.map_or(true, |at| at > now));
        inner.entries.len()
    }

    /// Whether the store holds no live keys.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a procedure digest has been registered.
    pub fn is_registered(&self, digest: &str) -> bool {
        self.inner.lock().procedures.contains(digest)
    }

    /// Forget every registered procedure, as after a store restart.
    pub fn flush_procedures(&self) {
        self.inner.lock().procedures.clear();
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn procedure_exists(&self, digest: &str) -> StoreResult<bool> {
        Ok(self.is_registered(digest))
    }

    async fn load_procedure(&self, procedure: &Procedure) -> StoreResult<String> {
        let digest = procedure.digest().to_string();
        self.inner.lock().procedures.insert(digest.clone());
        Ok(digest)
    }

    async fn execute(
        &self,
        procedure: &Procedure,
        keys: &[String],
        args: &[Value],
    ) -> StoreResult<Vec<Value>> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();

        if inner.procedures.insert(procedure.digest().to_string()) {
            debug!(
                procedure = %procedure.id(),
                digest = procedure.digest(),
                "Procedure not registered, loaded on first use"
            );
        }

        let mut session = Session {
            inner: &mut *inner,
            now,
        };
        let reply = procedure.run_native(&mut session, keys, args)?;

        trace!(procedure = %procedure.id(), ?keys, ?args, ?reply, "Executed procedure");
        Ok(reply)
    }

    async fn hash_set(&self, key: &str, fields: &[(String, i64)]) -> StoreResult<()> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();

        if inner.live(key, now).is_none() {
            inner.entries.insert(
                key.to_string(),
                Entry {
                    data: Data::Hash(HashMap::new()),
                    expires_at: None,
                },
            );
        }

        match inner.entries.get_mut(key) {
            Some(Entry { data: Data::Hash(hash), .. }) => {
                for (field, value) in fields {
                    hash.insert(field.clone(), value.to_string());
                }
                Ok(())
            }
            _ => Err(StoreError::WrongType(key.to_string())),
        }
    }

    async fn hash_get_all(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        match inner.live(key, now) {
            None => Ok(HashMap::new()),
            Some(Entry { data: Data::Hash(hash), .. }) => Ok(hash.clone()),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    async fn hash_del(&self, key: &str, fields: &[String]) -> StoreResult<()> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        let now_empty = match inner.live(key, now) {
            None => return Ok(()),
            Some(Entry { data: Data::Hash(hash), .. }) => {
                for field in fields {
                    hash.remove(field);
                }
                hash.is_empty()
            }
            Some(_) => return Err(StoreError::WrongType(key.to_string())),
        };
        // Redis drops a hash once its last field is gone.
        if now_empty {
            inner.entries.remove(key);
        }
        Ok(())
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ratelimit::procedure::{ProcedureId, ProcedureRegistry};
    use crate::store::{conformance, register_procedures};

    impl MemoryStore {
        fn set_hash_field(&self, key: &str, field: &str, value: &str) {
            let mut fields = HashMap::new();
            fields.insert(field.to_string(), value.to_string());
            self.inner.lock().entries.insert(
                key.to_string(),
                Entry {
                    data: Data::Hash(fields),
                    expires_at: None,
                },
            );
        }
    }

    fn store_at(millis: i64) -> (MemoryStore, ManualClock) {
        let clock = ManualClock::from_millis(millis);
        (MemoryStore::with_clock(Arc::new(clock.clone())), clock)
    }

    #[test]
    fn test_keys_expire_by_clock() {
        let (store, clock) = store_at(0);
        {
            let mut inner = store.inner.lock();
            let mut session = Session {
                inner: &mut *inner,
                now: clock.now(),
            };
            assert!(session.set_nx("bucket", 0).unwrap());
            assert!(!session.set_nx("bucket", 5).unwrap());
            session.expire("bucket", 60).unwrap();
            assert_eq!(session.incr("bucket").unwrap(), 1);
        }

        assert_eq!(store.ttl("bucket"), Some(60));
        clock.advance(Duration::seconds(59));
        assert_eq!(store.counter("bucket"), Some(1));

        clock.advance(Duration::seconds(1));
        assert_eq!(store.counter("bucket"), None);
        assert!(store.is_empty());
    }

    #[test]
    fn test_wrong_type() {
        let (store, clock) = store_at(0);
        store.set_counter("n", 3);

        let mut inner = store.inner.lock();
        let mut session = Session {
            inner: &mut *inner,
            now: clock.now(),
        };
        assert!(matches!(session.hget("n", "f"), Err(StoreError::WrongType(_))));
    }

    #[tokio::test]
    async fn test_hash_round_trip() {
        let store = MemoryStore::new();

        store
            .hash_set("c_quota", &[("minute".to_string(), 10), ("day".to_string(), 100)])
            .await
            .unwrap();
        store.hash_set("c_quota", &[("minute".to_string(), 20)]).await.unwrap();

        let all = store.hash_get_all("c_quota").await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all["minute"], "20");
        assert_eq!(all["day"], "100");

        store.hash_del("c_quota", &["minute".to_string()]).await.unwrap();
        let all = store.hash_get_all("c_quota").await.unwrap();
        assert_eq!(all.len(), 1);

        store.hash_del("c_quota", &["day".to_string()]).await.unwrap();
        assert!(store.is_empty());
        assert!(store.hash_get_all("missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_registration_is_idempotent() {
        let store = MemoryStore::new();
        let registry = ProcedureRegistry::new();

        assert_eq!(register_procedures(&store, &registry).await.unwrap(), 3);
        assert_eq!(register_procedures(&store, &registry).await.unwrap(), 0);

        for procedure in registry.iter() {
            assert!(store.is_registered(procedure.digest()));
        }
    }

    #[tokio::test]
    async fn test_execute_registers_on_miss() {
        let store = MemoryStore::new();
        let registry = ProcedureRegistry::new();
        let procedure = registry.get(ProcedureId::Counter);

        assert!(!store.is_registered(procedure.digest()));

        let keys = vec!["c_quota".to_string(), "c_quota_minute_".to_string()];
        let args = vec![Value::from("minute"), Value::from(0), Value::from(60)];
        store.execute(procedure, &keys, &args).await.unwrap();

        assert!(store.is_registered(procedure.digest()));
    }

    #[tokio::test]
    async fn test_concurrent_registration() {
        let store = MemoryStore::new();
        let registry = ProcedureRegistry::new();

        let (a, b) = tokio::join!(
            register_procedures(&store, &registry),
            register_procedures(&store, &registry)
        );
        assert!(a.is_ok());
        assert!(b.is_ok());

        for procedure in registry.iter() {
            assert!(store.is_registered(procedure.digest()));
        }
    }

    #[tokio::test]
    async fn test_restarted_store_reloads_on_execute() {
        let store = MemoryStore::new();
        let registry = ProcedureRegistry::new();
        register_procedures(&store, &registry).await.unwrap();

        store.flush_procedures();
        let procedure = registry.get(ProcedureId::MultiCounter);
        assert!(!store.is_registered(procedure.digest()));

        let keys = vec!["c_quota_minute_".to_string()];
        let args = vec![Value::from(1), Value::from(0), Value::from(60), Value::from(5)];
        let reply = store.execute(procedure, &keys, &args).await.unwrap();

        assert_eq!(reply[0], Value::Int(1));
        assert!(store.is_registered(procedure.digest()));
        assert_eq!(store.counter("c_quota_minute_0"), Some(1));
    }

    #[tokio::test]
    async fn test_shared_behaviour() {
        let store = MemoryStore::new();
        conformance::counter_counts_to_limit(&store, "counter").await;
        conformance::unconfigured_rule_reports_zero(&store, "nobody").await;
        conformance::sliding_window_walk_stops_at_gap(&store, "sliding").await;
        conformance::multi_counter_sums_across_gaps(&store, "gaps").await;
        conformance::multi_counter_is_all_or_nothing(&store, "joint").await;
    }

    #[tokio::test]
    async fn test_non_integer_limit_is_an_error() {
        let store = MemoryStore::new();
        for key in ["bad_quota", "bad_rate"] {
            store.set_hash_field(key, "minute", "lots");
        }

        conformance::non_integer_limit_fails(&store, "bad").await;
    }
}
