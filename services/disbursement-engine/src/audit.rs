//! Append-only audit trail
//!
//! Writes are best-effort: a failed append is logged and counted, and the
//! business operation that triggered it still succeeds.

use crate::errors::Result;
use crate::metrics;
use crate::models::{AuditLogEntry, NewAuditEntry, RequestOrigin};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::error;
use uuid::Uuid;

pub const DEFAULT_LIMIT: i64 = 100;
pub const MAX_LIMIT: i64 = 500;

/// Action labels
pub mod actions {
    pub const USER_REGISTRATION: &str = "User Registration";
    pub const USER_LOGIN: &str = "User Login";
    pub const PROFILE_UPDATE: &str = "Profile Update";
    pub const PASSWORD_CHANGE: &str = "Password Change";
    pub const USER_UPDATE: &str = "User Update";
    pub const FUND_CREATED: &str = "Fund Created";
    pub const FUND_UPDATED: &str = "Fund Updated";
    pub const TRANSACTION_COMPLETED: &str = "Transaction Completed";
    pub const TRANSACTION_FAILED: &str = "Transaction Failed";
    pub const SETTLEMENT_UNRECONCILED: &str = "Settlement Unreconciled";
    pub const TRANSACTION_RECONCILED: &str = "Transaction Reconciled";
}

#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn append(&self, entry: NewAuditEntry) -> Result<AuditLogEntry>;

    /// Newest first
    async fn list(&self, user_id: Option<Uuid>, limit: i64) -> Result<Vec<AuditLogEntry>>;
}

#[derive(Default)]
pub struct MemoryAuditStore {
    entries: RwLock<Vec<AuditLogEntry>>,
}

impl MemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AuditStore for MemoryAuditStore {
    async fn append(&self, entry: NewAuditEntry) -> Result<AuditLogEntry> {
        let entry = AuditLogEntry {
            id: Uuid::new_v4(),
            user_id: entry.user_id,
            action: entry.action,
            details: entry.details,
            ip_address: entry.origin.ip_address,
            user_agent: entry.origin.user_agent,
            created_at: Utc::now(),
        };
        self.entries.write().push(entry.clone());
        Ok(entry)
    }

    async fn list(&self, user_id: Option<Uuid>, limit: i64) -> Result<Vec<AuditLogEntry>> {
        let entries = self.entries.read();
        Ok(entries
            .iter()
            .rev()
            .filter(|e| user_id.map_or(true, |id| e.user_id == Some(id)))
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }
}

#[derive(Clone)]
pub struct AuditLog {
    store: Arc<dyn AuditStore>,
}

impl AuditLog {
    pub fn new(store: Arc<dyn AuditStore>) -> Self {
        Self { store }
    }

    /// Record an action; failures never propagate
    pub async fn record(
        &self,
        user_id: Option<Uuid>,
        action: &str,
        details: impl Into<String>,
        origin: &RequestOrigin,
    ) {
        let entry = NewAuditEntry {
            user_id,
            action: action.to_string(),
            details: Some(details.into()),
            origin: origin.clone(),
        };

        if let Err(e) = self.store.append(entry).await {
            metrics::AUDIT_WRITE_FAILURES.inc();
            error!(action = action, user_id = ?user_id, "Failed to write audit entry: {}", e);
        }
    }

    pub async fn list(&self, user_id: Option<Uuid>, limit: Option<i64>) -> Result<Vec<AuditLogEntry>> {
        let limit = limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
        self.store.list(user_id, limit).await
    }
}
