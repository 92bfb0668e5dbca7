//! Service layer: the engine, the settlement state machine, and their
//! collaborators.

pub mod audit;
pub mod currency;
pub mod database;
pub mod engine;
pub mod forms;
pub mod metrics;
pub mod notify;
pub mod providers;
pub mod risk;
pub mod rules;
pub mod settlement;
pub mod store;
pub mod sweep;

pub use currency::CurrencyService;
pub use database::Database;
pub use forms::FormService;
pub use metrics::{get_metrics, init_metrics};
pub use rules::RuleService;
pub use settlement::{SettlementService, SettlementSettings};
pub use sweep::RetrySweep;
