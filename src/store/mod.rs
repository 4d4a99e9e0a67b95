//! Counter store abstraction.
//!
//! The limiter needs a store that can run a multi-step procedure atomically,
//! keep self-expiring integer counters, and hold small hashes of rules.
//! [`RedisStore`] is the production implementation; [`MemoryStore`] emulates
//! the same contract in process.

use std::collections::HashMap;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::error::StoreResult;
use crate::ratelimit::procedure::{Procedure, ProcedureRegistry, Value};

#[cfg(test)]
pub(crate) mod conformance;
mod memory;
mod redis_store;

pub use self::memory::MemoryStore;
pub use self::redis_store::RedisStore;

/// Trait for counter store implementations.
///
/// Implementations must execute a procedure as one indivisible step: no other
/// caller may observe the keyspace halfway through it.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Whether a procedure with this digest is registered.
    async fn procedure_exists(&self, digest: &str) -> StoreResult<bool>;

    /// Register a procedure body. Returns the digest the store assigned.
    async fn load_procedure(&self, procedure: &Procedure) -> StoreResult<String>;

    /// Execute a procedure by digest, registering its body first if the
    /// store does not know the digest.
    async fn execute(
        &self,
        procedure: &Procedure,
        keys: &[String],
        args: &[Value],
    ) -> StoreResult<Vec<Value>>;

    /// Set several integer fields of a hash.
    async fn hash_set(&self, key: &str, fields: &[(String, i64)]) -> StoreResult<()>;

    /// Read every field of a hash. A missing hash reads as empty.
    async fn hash_get_all(&self, key: &str) -> StoreResult<HashMap<String, String>>;

    /// Delete fields from a hash.
    async fn hash_del(&self, key: &str, fields: &[String]) -> StoreResult<()>;

    /// Connectivity probe.
    async fn ping(&self) -> StoreResult<()>;
}

/// Register every procedure in `registry` that the store does not know yet.
///
/// Safe to call repeatedly and from several instances at once: loading a body
/// twice yields the same digest. Returns how many procedures were loaded.
pub async fn register_procedures<S>(store: &S, registry: &ProcedureRegistry) -> StoreResult<usize>
where
    S: CounterStore + ?Sized,
{
    let mut loaded = 0;

    for procedure in registry.iter() {
        if store.procedure_exists(procedure.digest()).await? {
            debug!(
                procedure = %procedure.id(),
                digest = procedure.digest(),
                "Procedure already registered"
            );
            continue;
        }

        let digest = store.load_procedure(procedure).await?;
        info!(procedure = %procedure.id(), digest = %digest, "Registered procedure");
        loaded += 1;
    }

    Ok(loaded)
}
