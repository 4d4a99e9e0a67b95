//! Redis-backed counter store.

use std::collections::HashMap;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, ErrorKind, RedisError};
use tracing::{info, trace};

use super::CounterStore;
use crate::config::StoreConfig;
use crate::error::StoreResult;
use crate::ratelimit::procedure::{Procedure, Value};

/// Counter store talking to a Redis server.
///
/// Procedures run as Lua scripts, which Redis executes one at a time; that is
/// the atomicity the limiter depends on. The connection manager reconnects on
/// its own and is cheap to clone per call.
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect using the store settings.
    pub async fn connect(config: &StoreConfig) -> StoreResult<Self> {
        info!(
            host = %config.host,
            port = config.port,
            database = config.database,
            "Connecting to Redis"
        );

        let client = redis::Client::open(config.url())?;
        let connection = ConnectionManager::new(client).await?;
        Ok(Self { connection })
    }
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn procedure_exists(&self, digest: &str) -> StoreResult<bool> {
        let mut conn = self.connection.clone();
        let exists: Vec<bool> = redis::cmd("SCRIPT")
            .arg("EXISTS")
            .arg(digest)
            .query_async(&mut conn)
            .await?;
        Ok(exists.first().copied().unwrap_or(false))
    }

    async fn load_procedure(&self, procedure: &Procedure) -> StoreResult<String> {
        let mut conn = self.connection.clone();
        let digest: String = redis::cmd("SCRIPT")
            .arg("LOAD")
            .arg(procedure.body())
            .query_async(&mut conn)
            .await?;
        Ok(digest)
    }

    async fn execute(
        &self,
        procedure: &Procedure,
        keys: &[String],
        args: &[Value],
    ) -> StoreResult<Vec<Value>> {
        let script = redis::Script::new(procedure.body());
        let mut invocation = script.prepare_invoke();
        for key in keys {
            invocation.key(key.as_str());
        }
        for arg in args {
            match arg {
                Value::Int(n) => invocation.arg(*n),
                Value::Text(s) => invocation.arg(s.as_str()),
            };
        }

        // EVALSHA, falling back to SCRIPT LOAD when the server answers NOSCRIPT.
        let mut conn = self.connection.clone();
        let reply: redis::Value = invocation.invoke_async(&mut conn).await?;

        trace!(procedure = %procedure.id(), ?keys, ?args, ?reply, "Executed procedure");
        flatten_reply(reply)
    }

    async fn hash_set(&self, key: &str, fields: &[(String, i64)]) -> StoreResult<()> {
        let mut conn = self.connection.clone();
        let _: () = conn.hset_multiple(key, fields).await?;
        Ok(())
    }

    async fn hash_get_all(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        let mut conn = self.connection.clone();
        let fields: HashMap<String, String> = conn.hgetall(key).await?;
        Ok(fields)
    }

    async fn hash_del(&self, key: &str, fields: &[String]) -> StoreResult<()> {
        let mut conn = self.connection.clone();
        let _: () = conn.hdel(key, fields).await?;
        Ok(())
    }

    async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.connection.clone();
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        if !pong.eq_ignore_ascii_case("pong") {
            return Err(RedisError::from((
                ErrorKind::ResponseError,
                "unexpected ping response",
                pong,
            ))
            .into());
        }
        Ok(())
    }
}

/// Turn a script reply into a flat list of integers and strings.
fn flatten_reply(reply: redis::Value) -> StoreResult<Vec<Value>> {
    let items = match reply {
        redis::Value::Array(items) => items,
        other => return Err(unexpected_reply(&other)),
    };

    items
        .into_iter()
        .map(|item| match item {
            redis::Value::Int(n) => Ok(Value::Int(n)),
            redis::Value::BulkString(bytes) => Ok(Value::Text(
                String::from_utf8_lossy(&bytes).into_owned(),
            )),
            redis::Value::SimpleString(s) => Ok(Value::Text(s)),
            other => Err(unexpected_reply(&other)),
        })
        .collect()
}

fn unexpected_reply(value: &redis::Value) -> crate::error::StoreError {
    RedisError::from((
        ErrorKind::TypeError,
        "unexpected procedure reply",
        format!("{:?}", value),
    ))
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TollgateConfig;
    use crate::ratelimit::keys::config_key;
    use crate::ratelimit::rules::LimitKind;
    use crate::store::conformance;

    /// Store from the usual settings sources (`TOLLGATE__STORE__HOST`, ...).
    async fn live_store() -> RedisStore {
        let config = TollgateConfig::load(None).unwrap();
        RedisStore::connect(&config.store).await.unwrap()
    }

    /// Client name no earlier run has used.
    fn fresh_client(name: &str) -> String {
        format!(
            "tollgate-test-{}-{}-{}",
            name,
            std::process::id(),
            chrono::Utc::now().timestamp_micros()
        )
    }

    async fn forget(store: &RedisStore, client: &str) {
        let mut conn = store.connection.clone();
        let keys: Vec<String> = LimitKind::ALL.iter().map(|k| config_key(client, *k)).collect();
        let _: () = conn.del(keys).await.unwrap();
    }

    #[test]
    fn test_flatten_reply() {
        let reply = redis::Value::Array(vec![
            redis::Value::Int(1),
            redis::Value::BulkString(b"quota".to_vec()),
            redis::Value::Int(60),
        ]);

        let flat = flatten_reply(reply).unwrap();
        assert_eq!(
            flat,
            vec![Value::Int(1), Value::Text("quota".to_string()), Value::Int(60)]
        );
    }

    #[test]
    fn test_flatten_reply_rejects_nested() {
        let reply = redis::Value::Array(vec![redis::Value::Array(vec![])]);
        assert!(flatten_reply(reply).is_err());
        assert!(flatten_reply(redis::Value::Nil).is_err());
    }

    #[tokio::test]
    #[ignore = "requires a Redis server"]
    async fn test_scripts_match_shared_behaviour() {
        let store = live_store().await;
        let clients: Vec<String> = ["counter", "nobody", "sliding", "gaps", "joint"]
            .into_iter()
            .map(fresh_client)
            .collect();

        conformance::counter_counts_to_limit(&store, &clients[0]).await;
        conformance::unconfigured_rule_reports_zero(&store, &clients[1]).await;
        conformance::sliding_window_walk_stops_at_gap(&store, &clients[2]).await;
        conformance::multi_counter_sums_across_gaps(&store, &clients[3]).await;
        conformance::multi_counter_is_all_or_nothing(&store, &clients[4]).await;

        for client in &clients {
            forget(&store, client).await;
        }
    }

    #[tokio::test]
    #[ignore = "requires a Redis server"]
    async fn test_scripts_reject_non_integer_limit() {
        let store = live_store().await;
        let client = fresh_client("bad");

        let mut conn = store.connection.clone();
        for kind in LimitKind::ALL {
            let _: () = conn
                .hset(config_key(&client, kind), "minute", "lots")
                .await
                .unwrap();
        }

        conformance::non_integer_limit_fails(&store, &client).await;
        forget(&store, &client).await;
    }

    #[tokio::test]
    #[ignore = "requires a Redis server"]
    async fn test_registration_against_server() {
        let store = live_store().await;
        let registry = crate::ratelimit::procedure::ProcedureRegistry::new();

        crate::store::register_procedures(&store, &registry).await.unwrap();
        for procedure in registry.iter() {
            assert!(store.procedure_exists(procedure.digest()).await.unwrap());
        }
        assert_eq!(crate::store::register_procedures(&store, &registry).await.unwrap(), 0);
        store.ping().await.unwrap();
    }
}
