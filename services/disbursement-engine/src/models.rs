use crate::errors::EngineError;
use chrono::{DateTime, Utc};
use ledger_core::{
    FundStatus, FundUpdate, LedgerStats, Resolution, Settlement, TransactionStatus,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;
use validator::Validate;

/// User role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Admin,
    Auditor,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Admin => "admin",
            Role::Auditor => "auditor",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "admin" => Ok(Role::Admin),
            "auditor" => Ok(Role::Auditor),
            other => Err(EngineError::Validation(format!("Unknown role: {}", other))),
        }
    }
}

/// Registered account
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    #[serde(skip_serializing, default)]
    pub password_hash: String,
    pub role: Role,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    /// Admins and auditors may read every record
    pub fn can_read_all(&self) -> bool {
        matches!(self.role, Role::Admin | Role::Auditor)
    }

    /// Auditors are read-only
    pub fn can_submit_transactions(&self) -> bool {
        matches!(self.role, Role::User | Role::Admin)
    }

    pub fn require_admin(&self) -> Result<(), EngineError> {
        if self.is_admin() {
            Ok(())
        } else {
            Err(EngineError::Forbidden("Admin role required".to_string()))
        }
    }

    pub fn require_read_all(&self) -> Result<(), EngineError> {
        if self.can_read_all() {
            Ok(())
        } else {
            Err(EngineError::Forbidden("Admin or auditor role required".to_string()))
        }
    }
}

/// User row to insert
#[derive(Debug, Clone)]
pub struct NewUser {
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub role: Role,
}

/// Owner-editable profile fields
#[derive(Debug, Clone, Default, Deserialize, Serialize, Validate)]
pub struct ProfileUpdate {
    #[validate(length(min = 3, max = 50))]
    pub username: Option<String>,
    #[validate(email, length(max = 100))]
    pub email: Option<String>,
}

impl ProfileUpdate {
    pub fn is_empty(&self) -> bool {
        self.username.is_none() && self.email.is_none()
    }
}

/// Admin-only account fields
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AdminUserUpdate {
    pub role: Option<Role>,
    pub is_active: Option<bool>,
}

/// Where a request came from, recorded on audit entries
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestOrigin {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

/// Append-only record of a security-relevant action
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub id: Uuid,
    pub user_id: Option<Uuid>,
    pub action: String,
    pub details: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Audit entry to append
#[derive(Debug, Clone)]
pub struct NewAuditEntry {
    pub user_id: Option<Uuid>,
    pub action: String,
    pub details: Option<String>,
    pub origin: RequestOrigin,
}

/// Registration request
#[derive(Debug, Deserialize, Serialize, Validate)]
pub struct RegisterRequest {
    #[validate(length(min = 3, max = 50))]
    pub username: String,
    #[validate(email, length(max = 100))]
    pub email: String,
    #[validate(length(min = 6))]
    pub password: String,
}

/// Login request
#[derive(Debug, Deserialize, Serialize, Validate)]
pub struct LoginRequest {
    #[validate(email)]
    pub email: String,
    #[validate(length(min = 1))]
    pub password: String,
}

/// Issued bearer token
#[derive(Debug, Serialize, Deserialize)]
pub struct LoginResponse {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: i64,
    pub user: User,
}

/// Password change request
#[derive(Debug, Deserialize, Serialize, Validate)]
pub struct ChangePasswordRequest {
    #[validate(length(min = 1))]
    pub current_password: String,
    #[validate(length(min = 6))]
    pub new_password: String,
}

/// Fund creation request
#[derive(Debug, Deserialize, Serialize, Validate)]
pub struct CreateFundRequest {
    #[validate(length(min = 1, max = 100))]
    pub name: String,
    #[validate(length(max = 1000))]
    pub description: Option<String>,
    pub total_amount: Decimal,
}

/// Fund update request
#[derive(Debug, Default, Deserialize, Serialize, Validate)]
pub struct UpdateFundRequest {
    #[validate(length(min = 1, max = 100))]
    pub name: Option<String>,
    #[validate(length(max = 1000))]
    pub description: Option<String>,
    pub status: Option<FundStatus>,
}

impl From<UpdateFundRequest> for FundUpdate {
    fn from(req: UpdateFundRequest) -> Self {
        FundUpdate {
            name: req.name,
            description: req.description,
            status: req.status,
        }
    }
}

/// Transaction submission request
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct SubmitTransactionRequest {
    pub fund_id: Uuid,
    #[validate(length(equal = 42))]
    pub recipient_address: String,
    pub amount: Decimal,
}

/// How an administrator settles a transaction stuck in `pending`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReconcileOutcome {
    Completed,
    Failed,
}

/// Reconciliation request; `completed` needs the on-chain receipt hash
#[derive(Debug, Deserialize, Serialize, Validate)]
pub struct ReconcileTransactionRequest {
    pub outcome: ReconcileOutcome,
    pub transaction_hash: Option<String>,
    pub block_number: Option<i64>,
    pub gas_used: Option<i64>,
    #[validate(length(min = 1, max = 500))]
    pub reason: Option<String>,
}

impl ReconcileTransactionRequest {
    pub fn into_resolution(self) -> Result<Resolution, EngineError> {
        match self.outcome {
            ReconcileOutcome::Completed => {
                let hash = self.transaction_hash.ok_or_else(|| {
                    EngineError::Validation(
                        "transaction_hash is required for a completed outcome".to_string(),
                    )
                })?;
                if !is_valid_transaction_hash(&hash) {
                    return Err(EngineError::Validation(format!(
                        "Invalid transaction hash: {}",
                        hash
                    )));
                }
                Ok(Resolution::Completed(Settlement {
                    transaction_hash: hash,
                    block_number: self.block_number,
                    gas_used: self.gas_used,
                }))
            }
            ReconcileOutcome::Failed => Ok(Resolution::Failed {
                reason: self
                    .reason
                    .unwrap_or_else(|| "Resolved by administrator".to_string()),
            }),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct TransactionQuery {
    pub fund_id: Option<Uuid>,
    pub status: Option<TransactionStatus>,
    pub limit: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct AuditQuery {
    pub user_id: Option<Uuid>,
    pub limit: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct EventsQuery {
    pub from_block: Option<u64>,
    /// Inclusive upper bound; latest block when absent
    pub to_block: Option<u64>,
}

/// Dashboard totals
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DashboardStats {
    pub total_funds: i64,
    pub active_funds: i64,
    pub total_allocated: Decimal,
    pub total_remaining: Decimal,
    pub total_disbursed: Decimal,
    pub total_transactions: i64,
    pub pending_transactions: i64,
    pub completed_transactions: i64,
    pub failed_transactions: i64,
    /// `None` when the settlement gateway cannot be reached
    pub blockchain_balance: Option<Decimal>,
}

impl DashboardStats {
    pub fn new(stats: LedgerStats, blockchain_balance: Option<Decimal>) -> Self {
        Self {
            total_funds: stats.total_funds,
            active_funds: stats.active_funds,
            total_allocated: stats.total_allocated,
            total_remaining: stats.total_remaining,
            total_disbursed: stats.total_disbursed,
            total_transactions: stats.total_transactions,
            pending_transactions: stats.pending_transactions,
            completed_transactions: stats.completed_transactions,
            failed_transactions: stats.failed_transactions,
            blockchain_balance,
        }
    }
}

/// Response envelope
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    pub fn ok(message: impl Into<String>, data: T) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: Some(data),
        }
    }

    pub fn with_outcome(success: bool, message: impl Into<String>, data: T) -> Self {
        Self {
            success,
            message: message.into(),
            data: Some(data),
        }
    }
}

impl ApiResponse<()> {
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: None,
        }
    }
}

/// `0x` followed by 40 hex digits
pub fn is_valid_address(address: &str) -> bool {
    address.len() == 42
        && address.starts_with("0x")
        && address[2..].chars().all(|c| c.is_ascii_hexdigit())
}

/// `0x` followed by 64 hex digits
pub fn is_valid_transaction_hash(hash: &str) -> bool {
    hash.len() == 66
        && hash.starts_with("0x")
        && hash[2..].chars().all(|c| c.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_format() {
        assert!(is_valid_address("0x1234567890abcdefABCDEF1234567890abcdef12"));
        assert!(!is_valid_address("1234567890abcdefABCDEF1234567890abcdef1234"));
        assert!(!is_valid_address("0x1234"));
        assert!(!is_valid_address("0xZZ34567890abcdefABCDEF1234567890abcdef12"));
    }

    #[test]
    fn test_transaction_hash_format() {
        let hash = format!("0x{}", "ab".repeat(32));
        assert!(is_valid_transaction_hash(&hash));
        assert!(!is_valid_transaction_hash("0x1234"));
        assert!(!is_valid_transaction_hash(&"ab".repeat(33)));
    }

    #[test]
    fn test_reconcile_request_resolution() {
        let completed = ReconcileTransactionRequest {
            outcome: ReconcileOutcome::Completed,
            transaction_hash: Some(format!("0x{}", "cd".repeat(32))),
            block_number: Some(12),
            gas_used: None,
            reason: None,
        };
        assert!(matches!(
            completed.into_resolution(),
            Ok(Resolution::Completed(Settlement { block_number: Some(12), .. }))
        ));

        let missing_hash = ReconcileTransactionRequest {
            outcome: ReconcileOutcome::Completed,
            transaction_hash: None,
            block_number: None,
            gas_used: None,
            reason: None,
        };
        assert!(matches!(
            missing_hash.into_resolution(),
            Err(EngineError::Validation(_))
        ));

        let failed = ReconcileTransactionRequest {
            outcome: ReconcileOutcome::Failed,
            transaction_hash: None,
            block_number: None,
            gas_used: None,
            reason: Some("never broadcast".to_string()),
        };
        assert_eq!(
            failed.into_resolution().unwrap(),
            Resolution::Failed {
                reason: "never broadcast".to_string()
            }
        );
    }

    #[test]
    fn test_register_validation() {
        let ok = RegisterRequest {
            username: "alice".to_string(),
            email: "alice@example.com".to_string(),
            password: "secret1".to_string(),
        };
        assert!(ok.validate().is_ok());

        let short_name = RegisterRequest {
            username: "al".to_string(),
            ..ok
        };
        assert!(short_name.validate().is_err());

        let bad_email = RegisterRequest {
            username: "alice".to_string(),
            email: "not-an-email".to_string(),
            password: "secret1".to_string(),
        };
        assert!(bad_email.validate().is_err());
    }

    #[test]
    fn test_password_hash_never_serialized() {
        let user = User {
            id: Uuid::new_v4(),
            username: "alice".to_string(),
            email: "alice@example.com".to_string(),
            password_hash: "$argon2id$v=19$secret".to_string(),
            role: Role::User,
            is_active: true,
            created_at: Utc::now(),
        };
        let json = serde_json::to_value(&user).unwrap();
        assert!(json.get("password_hash").is_none());
        assert_eq!(json["role"], "user");
    }

    #[test]
    fn test_role_permissions() {
        assert_eq!("auditor".parse::<Role>().unwrap(), Role::Auditor);
        assert!("root".parse::<Role>().is_err());

        let mut user = User {
            id: Uuid::new_v4(),
            username: "carol".to_string(),
            email: "carol@example.com".to_string(),
            password_hash: String::new(),
            role: Role::Auditor,
            is_active: true,
            created_at: Utc::now(),
        };
        assert!(user.can_read_all());
        assert!(!user.can_submit_transactions());
        assert!(user.require_admin().is_err());

        user.role = Role::User;
        assert!(user.can_submit_transactions());
        assert!(user.require_read_all().is_err());
    }
}
