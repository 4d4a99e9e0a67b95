//! Rate limiting logic: periods, rules, atomic procedures and the limiter facade.

pub mod counter;
pub mod keepalive;
pub mod keys;
mod limiter;
pub mod multi_counter;
pub mod period;
pub mod procedure;
pub mod rules;
pub mod sliding_window;

pub use keepalive::Keepalive;
pub use limiter::Limiter;
pub use period::{Period, Window};
pub use procedure::{ProcedureId, ProcedureRegistry, Value};
pub use rules::{CheckResult, ClientRules, LimitKind, RuleMap, RulesFile};
