pub mod alerts;
pub mod approval;
pub mod audit;
pub mod briefing;
pub mod claim;
pub mod classifier;
pub mod config;
pub mod error;
pub mod executor;
pub mod ledger;
pub mod lock;
pub mod metrics;
pub mod orchestrator;
pub mod planner;
pub mod reasoning;
pub mod retry;
pub mod scheduler;
pub mod supervisor;
pub mod vault;
pub mod watcher;
