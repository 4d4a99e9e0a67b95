//! Behaviour every [`CounterStore`] must share.
//!
//! Each scenario drives the procedures through the store's own `execute`, so
//! the Lua bodies (on Redis) and the native bodies (in memory) are held to the
//! same expectations. Windows are fixed; callers pass a client name that is
//! unique to the run.

use super::CounterStore;
use crate::ratelimit::counter::{self, CounterReply};
use crate::ratelimit::keys::config_key;
use crate::ratelimit::multi_counter::{self, MultiCounterReply};
use crate::ratelimit::period::{Period, Window};
use crate::ratelimit::procedure::{ProcedureId, ProcedureRegistry};
use crate::ratelimit::rules::{LimitKind, ResolvedRule};

const T0: i64 = 1_704_067_200_000;
const MINUTE_SEGMENT: i64 = 6_000;

fn minute(timestamp_ms: i64) -> Window {
    Window {
        timestamp_ms,
        ttl_secs: 60,
    }
}

async fn configure<S: CounterStore + ?Sized>(store: &S, client: &str, kind: LimitKind, limit: i64) {
    store
        .hash_set(&config_key(client, kind), &[("minute".to_string(), limit)])
        .await
        .unwrap();
}

async fn single<S: CounterStore + ?Sized>(
    store: &S,
    client: &str,
    kind: LimitKind,
    timestamp_ms: i64,
) -> CounterReply {
    let registry = ProcedureRegistry::new();
    let id = match kind {
        LimitKind::Quota => ProcedureId::Counter,
        LimitKind::Rate => ProcedureId::SlidingWindow,
    };
    let (keys, args) = counter::arguments(client, kind, Period::Minute, minute(timestamp_ms));
    let reply = store.execute(registry.get(id), &keys, &args).await.unwrap();
    CounterReply::decode(&reply).unwrap()
}

async fn multi<S: CounterStore + ?Sized>(
    store: &S,
    client: &str,
    rules: &[(LimitKind, i64, i64)],
) -> MultiCounterReply {
    let resolve = |kind: LimitKind| -> Vec<ResolvedRule> {
        rules
            .iter()
            .filter(|(k, _, _)| *k == kind)
            .map(|&(kind, timestamp_ms, limit)| ResolvedRule {
                kind,
                period: Period::Minute,
                window: minute(timestamp_ms),
                limit,
            })
            .collect()
    };
    let quota = resolve(LimitKind::Quota);
    let rate = resolve(LimitKind::Rate);

    let registry = ProcedureRegistry::new();
    let (keys, args) = multi_counter::arguments(client, &quota, &rate);
    let reply = store
        .execute(registry.get(ProcedureId::MultiCounter), &keys, &args)
        .await
        .unwrap();
    MultiCounterReply::decode(&reply, quota.len() + rate.len()).unwrap()
}

fn used(reply: &MultiCounterReply) -> Vec<i64> {
    match reply {
        MultiCounterReply::Admitted(rules) => rules.iter().map(|r| r.used).collect(),
        MultiCounterReply::Rejected(rule) => vec![rule.used],
    }
}

pub(crate) async fn counter_counts_to_limit<S: CounterStore + ?Sized>(store: &S, client: &str) {
    configure(store, client, LimitKind::Quota, 3).await;

    for expected in 1..=3 {
        let reply = single(store, client, LimitKind::Quota, T0).await;
        assert_eq!((reply.limit, reply.used, reply.admitted), (3, expected, true));
    }
    let reply = single(store, client, LimitKind::Quota, T0).await;
    assert_eq!((reply.limit, reply.used, reply.admitted), (3, 3, false));

    let next = single(store, client, LimitKind::Quota, T0 + 60_000).await;
    assert_eq!((next.used, next.admitted), (1, true));
}

pub(crate) async fn unconfigured_rule_reports_zero<S: CounterStore + ?Sized>(
    store: &S,
    client: &str,
) {
    for kind in LimitKind::ALL {
        let reply = single(store, client, kind, T0).await;
        assert_eq!((reply.limit, reply.used, reply.admitted), (0, 0, false));
    }
}

/// Expects the caller to have stored a non-numeric minute limit for both kinds.
pub(crate) async fn non_integer_limit_fails<S: CounterStore + ?Sized>(store: &S, client: &str) {
    let registry = ProcedureRegistry::new();
    for (kind, id) in [
        (LimitKind::Quota, ProcedureId::Counter),
        (LimitKind::Rate, ProcedureId::SlidingWindow),
    ] {
        let (keys, args) = counter::arguments(client, kind, Period::Minute, minute(T0));
        assert!(store.execute(registry.get(id), &keys, &args).await.is_err());
    }
}

pub(crate) async fn sliding_window_walk_stops_at_gap<S: CounterStore + ?Sized>(
    store: &S,
    client: &str,
) {
    configure(store, client, LimitKind::Rate, 10).await;

    single(store, client, LimitKind::Rate, T0).await;
    single(store, client, LimitKind::Rate, T0).await;
    let chained = single(store, client, LimitKind::Rate, T0 + MINUTE_SEGMENT).await;
    assert_eq!(chained.used, 3);

    // T0 + 2 segments is never visited, breaking the chain behind T0 + 3.
    let reply = single(store, client, LimitKind::Rate, T0 + 3 * MINUTE_SEGMENT).await;
    assert_eq!(reply.used, 1);
}

pub(crate) async fn multi_counter_sums_across_gaps<S: CounterStore + ?Sized>(
    store: &S,
    client: &str,
) {
    for _ in 0..5 {
        assert!(multi(store, client, &[(LimitKind::Rate, T0, 5)]).await.is_admitted());
    }

    // Rejections leave later segments empty; the first one still counts.
    for step in 1..10 {
        let reply = multi(store, client, &[(LimitKind::Rate, T0 + step * MINUTE_SEGMENT, 5)]).await;
        assert!(!reply.is_admitted());
        assert_eq!(used(&reply), vec![5]);
    }

    let reopened = multi(store, client, &[(LimitKind::Rate, T0 + 10 * MINUTE_SEGMENT, 5)]).await;
    assert_eq!(used(&reopened), vec![1]);
}

pub(crate) async fn multi_counter_is_all_or_nothing<S: CounterStore + ?Sized>(
    store: &S,
    client: &str,
) {
    let rules = [(LimitKind::Quota, T0, 1), (LimitKind::Rate, T0, 10)];

    let first = multi(store, client, &rules).await;
    assert!(first.is_admitted());
    assert_eq!(used(&first), vec![1, 1]);

    let second = multi(store, client, &rules).await;
    assert!(!second.is_admitted());
    assert_eq!(second.into_results()[0].classify, LimitKind::Quota);

    // The rejected call did not reach the rate bucket.
    let rate_only = multi(store, client, &[(LimitKind::Rate, T0, 10)]).await;
    assert_eq!(used(&rate_only), vec![2]);
}
