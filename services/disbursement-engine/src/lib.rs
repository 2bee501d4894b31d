//! Fund disbursement service
//!
//! Accounts authenticate with bearer tokens, administrators allocate funds,
//! and users submit disbursements that are reserved against a fund in the
//! ledger, settled through an external gateway, then committed or released.
//! Every security-relevant action lands in the audit log.

pub mod audit;
pub mod blockchain_handlers;
pub mod config;
pub mod database;
pub mod errors;
pub mod gateway;
pub mod handlers;
pub mod identity;
pub mod metrics;
pub mod middleware;
pub mod models;
pub mod orchestrator;
pub mod state;

pub use config::Config;
pub use errors::{EngineError, Result};
pub use state::{AppState, Stores};
