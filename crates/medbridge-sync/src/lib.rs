//! Reconciliation between the clinic database and the CRM: matching,
//! funnel routing, field mapping, the sync engine, and its scheduler.

pub mod engine;
pub mod funnel;
pub mod mapper;
pub mod matcher;
pub mod scheduler;

pub use engine::{PassReport, SyncEngine, SyncStatistics};
pub use funnel::FunnelRoute;
pub use matcher::Matcher;
pub use scheduler::Scheduler;
