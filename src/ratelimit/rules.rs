//! Limit rules and admission results.
//!
//! Rules are stored per client as two period → limit mappings, one for quota
//! (fixed window) limits and one for rate (sliding window) limits. This module
//! also handles bulk loading of rules from YAML documents.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::info;

use super::period::{Period, Window};
use crate::error::{Result, TollgateError};

/// Which algorithm a rule is enforced with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LimitKind {
    /// Fixed window aligned to calendar boundaries
    Quota,
    /// Sliding window approximated over sub-segments
    Rate,
}

impl LimitKind {
    /// Both kinds, in evaluation order.
    pub const ALL: [LimitKind; 2] = [LimitKind::Quota, LimitKind::Rate];

    /// Lowercase name used in keys and replies.
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitKind::Quota => "quota",
            LimitKind::Rate => "rate",
        }
    }

    /// Align `now` for a rule of this kind.
    pub fn window(&self, period: Period, now: chrono::DateTime<chrono::Utc>) -> Window {
        match self {
            LimitKind::Quota => period.quota_window(now),
            LimitKind::Rate => period.rate_window(now),
        }
    }
}

impl fmt::Display for LimitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LimitKind {
    type Err = TollgateError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "quota" => Ok(LimitKind::Quota),
            "rate" => Ok(LimitKind::Rate),
            other => Err(TollgateError::Config(format!(
                "unknown limit kind {other:?}, expected quota or rate"
            ))),
        }
    }
}

/// A client's rules of one kind, ordered by period.
pub type RuleMap = BTreeMap<Period, i64>;

/// Reject limits that are not strictly positive.
///
/// A zero limit is how procedures report an unconfigured rule, so it cannot
/// be stored.
pub fn validate_limits(rules: &RuleMap) -> Result<()> {
    for (period, limit) in rules {
        if *limit <= 0 {
            return Err(TollgateError::InvalidLimit {
                period: period.to_string(),
                limit: *limit,
            });
        }
    }
    Ok(())
}

/// Parse a raw field → value mapping read from the store.
pub fn parse_rule_map(raw: HashMap<String, String>) -> Result<RuleMap> {
    raw.into_iter()
        .map(|(field, value)| {
            let period: Period = field.parse()?;
            let limit = value.parse::<i64>().map_err(|e| {
                TollgateError::Decode(format!("limit for {field} is not an integer: {e}"))
            })?;
            Ok((period, limit))
        })
        .collect()
}

/// A rule bound to the window it applies to right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedRule {
    /// Quota or rate
    pub kind: LimitKind,
    /// The configured period
    pub period: Period,
    /// Aligned timestamp and TTL
    pub window: Window,
    /// Configured limit
    pub limit: i64,
}

/// Outcome of one rule's evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResult {
    /// Whether the request was rejected by this rule
    pub over_limit: bool,
    /// Which kind of rule produced this result
    pub classify: LimitKind,
    /// Consumption after this request
    pub used: i64,
    /// Configured limit
    pub limit: i64,
    /// Capacity left in the window, zero when over limit
    pub remaining: i64,
    /// Window length in seconds
    pub window_length: i64,
}

impl CheckResult {
    /// Result for a rule that admitted the request.
    pub fn admitted(classify: LimitKind, window_length: i64, limit: i64, used: i64) -> Self {
        Self {
            over_limit: false,
            classify,
            used,
            limit,
            remaining: (limit - used).max(0),
            window_length,
        }
    }

    /// Result for a rule that rejected the request.
    pub fn rejected(classify: LimitKind, window_length: i64, limit: i64, used: i64) -> Self {
        Self {
            over_limit: true,
            classify,
            used,
            limit,
            remaining: 0,
            window_length,
        }
    }

    /// The period whose window length this result reports.
    pub fn period(&self) -> Option<Period> {
        Period::from_window_secs(self.window_length)
    }
}

/// Rules for one client, as written in a rules document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRules {
    /// Fixed-window limits
    #[serde(default)]
    pub quota: RuleMap,
    /// Sliding-window limits
    #[serde(default)]
    pub rate: RuleMap,
}

impl ClientRules {
    /// The mapping for `kind`.
    pub fn get(&self, kind: LimitKind) -> &RuleMap {
        match kind {
            LimitKind::Quota => &self.quota,
            LimitKind::Rate => &self.rate,
        }
    }

    /// Whether no rule of either kind is present.
    pub fn is_empty(&self) -> bool {
        self.quota.is_empty() && self.rate.is_empty()
    }
}

/// A rules document covering many clients.
///
/// ```yaml
/// clients:
///   tenant-a:
///     quota:
///       day: 10000
///     rate:
///       second: 20
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RulesFile {
    /// Map of client key to its rules
    #[serde(default)]
    pub clients: BTreeMap<String, ClientRules>,
}

impl RulesFile {
    /// Load a rules document from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rules document");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load a rules document from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let rules: RulesFile = serde_yaml::from_str(yaml)
            .map_err(|e| TollgateError::Config(format!("Failed to parse rules document: {}", e)))?;

        for client in rules.clients.values() {
            validate_limits(&client.quota)?;
            validate_limits(&client.rate)?;
        }
        Ok(rules)
    }
}
