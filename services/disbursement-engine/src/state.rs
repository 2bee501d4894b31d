use crate::audit::{AuditLog, AuditStore, MemoryAuditStore};
use crate::config::{AuthConfig, Config};
use crate::database::{Database, PgAuditStore, PgIdentityStore};
use crate::errors::{EngineError, Result};
use crate::gateway::{build_gateway, SettlementGateway};
use crate::identity::{CredentialHasher, IdentityService, IdentityStore, MemoryIdentityStore, TokenIssuer};
use crate::orchestrator::TransactionOrchestrator;
use ledger_core::{LedgerStore, MemoryLedger, PgLedgerStore};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Storage handles, either all PostgreSQL or all in-memory
#[derive(Clone)]
pub struct Stores {
    pub identity: Arc<dyn IdentityStore>,
    pub audit: Arc<dyn AuditStore>,
    pub ledger: Arc<dyn LedgerStore>,
}

impl Stores {
    pub fn in_memory() -> Self {
        Self {
            identity: Arc::new(MemoryIdentityStore::new()),
            audit: Arc::new(MemoryAuditStore::new()),
            ledger: Arc::new(MemoryLedger::new()),
        }
    }

    pub fn postgres(db: &Database) -> Self {
        let pool = db.pool().clone();
        Self {
            identity: Arc::new(PgIdentityStore::new(pool.clone())),
            audit: Arc::new(PgAuditStore::new(pool.clone())),
            ledger: Arc::new(PgLedgerStore::new(pool)),
        }
    }
}

/// Everything a handler needs, built once at startup
#[derive(Clone)]
pub struct AppState {
    pub identity: Arc<IdentityService>,
    pub ledger: Arc<dyn LedgerStore>,
    pub gateway: Arc<dyn SettlementGateway>,
    pub audit: AuditLog,
    pub orchestrator: TransactionOrchestrator,
}

impl AppState {
    pub fn new(
        stores: Stores,
        gateway: Arc<dyn SettlementGateway>,
        auth: &AuthConfig,
        settlement_timeout: Duration,
    ) -> Result<Self> {
        let audit = AuditLog::new(stores.audit);
        let hasher = CredentialHasher::new(
            auth.argon2_memory_kib,
            auth.argon2_iterations,
            auth.argon2_parallelism,
        )?;
        let tokens = TokenIssuer::new(
            &auth.jwt_secret,
            auth.token_ttl_seconds,
            auth.clock_skew_grace_seconds,
        );

        let identity = Arc::new(IdentityService::new(
            stores.identity,
            hasher,
            tokens,
            audit.clone(),
        ));
        let orchestrator = TransactionOrchestrator::new(
            Arc::clone(&stores.ledger),
            Arc::clone(&gateway),
            audit.clone(),
            settlement_timeout,
        );

        Ok(Self {
            identity,
            ledger: stores.ledger,
            gateway,
            audit,
            orchestrator,
        })
    }

    /// Connect storage and the gateway as configured, then bootstrap the admin
    pub async fn from_config(config: &Config) -> Result<Self> {
        let stores = if config.database.is_memory() {
            info!("Using in-memory stores; data is lost on restart");
            Stores::in_memory()
        } else {
            let db = Database::new(
                &config.database.url,
                config.database.max_connections,
                Duration::from_secs(config.database.acquire_timeout_seconds),
            )
            .await?;
            db.apply_schema().await?;
            info!("Connected to PostgreSQL");
            Stores::postgres(&db)
        };

        let gateway = build_gateway(&config.gateway).map_err(EngineError::Internal)?;
        info!("Settlement gateway mode: {:?}", config.gateway.mode);

        let state = Self::new(
            stores,
            gateway,
            &config.auth,
            Duration::from_secs(config.gateway.settlement_timeout_seconds),
        )?;

        if let Some((username, email, password)) = config.bootstrap.admin() {
            state.identity.ensure_admin(username, email, password).await?;
        }

        Ok(state)
    }
}
