//! RAMS Common - Shared domain model and engines for the rescue service
//!
//! Holds the SQLite-backed store, the service request ledger, the dispatch
//! assignment engine, the team registry, and the audit/notification side
//! channels shared by ramsd and ramsctl.

pub mod audit;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod ledger;
pub mod model;
pub mod notify;
pub mod status;
pub mod store;
pub mod teams;

pub use audit::{AuditEvent, AuditLogger};
pub use config::RamsConfig;
pub use dispatch::DispatchEngine;
pub use error::EngineError;
pub use ledger::ServiceRequestLedger;
pub use model::*;
pub use notify::Notifier;
pub use status::{AnimalStatus, SrStatus};
pub use store::RamsStore;
pub use teams::TeamRegistry;
