//! Limiter facade: rule management and admission checks for clients.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, trace};

use super::counter::{self, CounterReply};
use super::keys::config_key;
use super::multi_counter::{self, MultiCounterReply};
use super::period::Period;
use super::procedure::{ProcedureId, ProcedureRegistry};
use super::rules::{
    parse_rule_map, validate_limits, CheckResult, LimitKind, ResolvedRule, RuleMap, RulesFile,
};
use crate::clock::{Clock, SystemClock};
use crate::error::{Result, TollgateError};
use crate::store::{register_procedures, CounterStore};

/// Admission control for many clients over a shared counter store.
///
/// Build one at startup with [`Limiter::connect`] and share it behind an
/// `Arc`. The limiter holds no locks of its own; every admission decision is
/// a single atomic procedure run by the store.
pub struct Limiter<S: CounterStore + ?Sized> {
    store: Arc<S>,
    registry: ProcedureRegistry,
    clock: Arc<dyn Clock>,
}

impl<S: CounterStore + ?Sized> std::fmt::Debug for Limiter<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Limiter")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl<S: CounterStore + ?Sized> Limiter<S> {
    /// Register the limiter's procedures with `store` and return a ready limiter.
    ///
    /// Fails if registration fails; a limiter is never handed out without
    /// its procedures in place.
    pub async fn connect(store: Arc<S>) -> Result<Self> {
        Self::with_clock(store, Arc::new(SystemClock)).await
    }

    /// Like [`Limiter::connect`], reading time from `clock`.
    pub async fn with_clock(store: Arc<S>, clock: Arc<dyn Clock>) -> Result<Self> {
        let registry = ProcedureRegistry::new();

        let loaded = register_procedures(store.as_ref(), &registry)
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to register limiter procedures");
                TollgateError::from(e)
            })?;

        info!(loaded, "Limiter procedures registered");

        Ok(Self {
            store,
            registry,
            clock,
        })
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Insert or update rules of `kind` for `client`.
    pub async fn put_config(&self, client: &str, kind: LimitKind, rules: &RuleMap) -> Result<()> {
        validate_limits(rules)?;
        if rules.is_empty() {
            return Ok(());
        }

        let fields: Vec<(String, i64)> = rules
            .iter()
            .map(|(period, limit)| (period.to_string(), *limit))
            .collect();

        self.store
            .hash_set(&config_key(client, kind), &fields)
            .await?;

        info!(client = %client, kind = %kind, rules = ?rules, "Stored limit rules");
        Ok(())
    }

    /// Current rules of `kind` for `client`, ordered by period.
    pub async fn get_config(&self, client: &str, kind: LimitKind) -> Result<RuleMap> {
        let raw = self.store.hash_get_all(&config_key(client, kind)).await?;
        let rules = parse_rule_map(raw)?;

        debug!(client = %client, kind = %kind, rules = ?rules, "Loaded limit rules");
        Ok(rules)
    }

    /// Remove the rules for `periods`; other periods are kept.
    pub async fn del_config(&self, client: &str, kind: LimitKind, periods: &[Period]) -> Result<()> {
        if periods.is_empty() {
            return Ok(());
        }

        let fields: Vec<String> = periods.iter().map(Period::to_string).collect();
        self.store
            .hash_del(&config_key(client, kind), &fields)
            .await?;

        info!(client = %client, kind = %kind, periods = ?periods, "Deleted limit rules");
        Ok(())
    }

    /// Store every rule in a rules document. Returns the number of clients written.
    pub async fn apply_rules(&self, document: &RulesFile) -> Result<usize> {
        for (client, rules) in &document.clients {
            for kind in LimitKind::ALL {
                self.put_config(client, kind, rules.get(kind)).await?;
            }
        }
        Ok(document.clients.len())
    }

    /// Fixed-window check of one quota rule, counting the call if admitted.
    pub async fn check_quota(&self, client: &str, period: Period) -> Result<CheckResult> {
        self.check_single(client, LimitKind::Quota, period).await
    }

    /// Sliding-window check of one rate rule, counting the call if admitted.
    pub async fn check_rate(&self, client: &str, period: Period) -> Result<CheckResult> {
        self.check_single(client, LimitKind::Rate, period).await
    }

    async fn check_single(
        &self,
        client: &str,
        kind: LimitKind,
        period: Period,
    ) -> Result<CheckResult> {
        let window = kind.window(period, self.clock.now());
        let procedure = match kind {
            LimitKind::Quota => self.registry.get(ProcedureId::Counter),
            LimitKind::Rate => self.registry.get(ProcedureId::SlidingWindow),
        };

        let (keys, args) = counter::arguments(client, kind, period, window);
        trace!(client = %client, ?keys, ?args, "Running single-rule check");

        let raw = self.store.execute(procedure, &keys, &args).await?;
        let reply = CounterReply::decode(&raw)?;

        if !reply.is_configured() {
            return Err(TollgateError::EmptyConfig(client.to_string()));
        }

        let result = if reply.admitted {
            CheckResult::admitted(kind, window.ttl_secs, reply.limit, reply.used)
        } else {
            debug!(client = %client, kind = %kind, period = %period, limit = reply.limit, "Limit exceeded");
            CheckResult::rejected(kind, window.ttl_secs, reply.limit, reply.used)
        };
        Ok(result)
    }

    /// Check every rule configured for `client` in one all-or-nothing step.
    ///
    /// When admitted, returns one result per rule, quota rules first, each in
    /// period order. When rejected, returns the single rule that rejected.
    pub async fn check(&self, client: &str) -> Result<Vec<CheckResult>> {
        let now = self.clock.now();
        let quota = self.resolve(client, LimitKind::Quota, now).await?;
        let rate = self.resolve(client, LimitKind::Rate, now).await?;

        if quota.is_empty() && rate.is_empty() {
            return Err(TollgateError::EmptyConfig(client.to_string()));
        }

        let (keys, args) = multi_counter::arguments(client, &quota, &rate);
        trace!(client = %client, ?keys, ?args, "Running admission");

        let raw = self
            .store
            .execute(self.registry.get(ProcedureId::MultiCounter), &keys, &args)
            .await?;
        let reply = MultiCounterReply::decode(&raw, quota.len() + rate.len())?;

        if reply.is_admitted() {
            debug!(client = %client, rules = quota.len() + rate.len(), "Request admitted");
        } else {
            debug!(client = %client, reply = ?reply, "Request rejected");
        }

        Ok(reply.into_results())
    }

    /// Load the rules of `kind` and align each to `now`.
    async fn resolve(
        &self,
        client: &str,
        kind: LimitKind,
        now: DateTime<Utc>,
    ) -> Result<Vec<ResolvedRule>> {
        let rules = self.get_config(client, kind).await?;
        Ok(rules
            .into_iter()
            .map(|(period, limit)| ResolvedRule {
                kind,
                period,
                window: kind.window(period, now),
                limit,
            })
            .collect())
    }
}
