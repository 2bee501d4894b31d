//! Identity Store: accounts, credentials and bearer tokens

pub mod password;
pub mod store;
pub mod token;

pub use password::CredentialHasher;
pub use store::{IdentityStore, MemoryIdentityStore};
pub use token::{Claims, TokenIssuer};

use crate::audit::{actions, AuditLog};
use crate::errors::{EngineError, Result};
use crate::models::{
    AdminUserUpdate, ChangePasswordRequest, LoginRequest, LoginResponse, NewUser, ProfileUpdate,
    RegisterRequest, RequestOrigin, Role, User,
};
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;
use validator::Validate;

/// Accounts, credentials and tokens; every successful change is audited
pub struct IdentityService {
    store: Arc<dyn IdentityStore>,
    hasher: CredentialHasher,
    tokens: TokenIssuer,
    audit: AuditLog,
}

impl IdentityService {
    pub fn new(
        store: Arc<dyn IdentityStore>,
        hasher: CredentialHasher,
        tokens: TokenIssuer,
        audit: AuditLog,
    ) -> Self {
        Self {
            store,
            hasher,
            tokens,
            audit,
        }
    }

    /// Argon2 is CPU-bound; keep it off the async workers
    async fn hash_password(&self, password: &str) -> Result<String> {
        let hasher = self.hasher.clone();
        let password = password.to_string();
        tokio::task::spawn_blocking(move || hasher.hash(&password))
            .await
            .map_err(|e| EngineError::Internal(format!("Password hashing task failed: {}", e)))?
    }

    async fn verify_password(&self, password: &str, hash: &str) -> Result<bool> {
        let hasher = self.hasher.clone();
        let password = password.to_string();
        let hash = hash.to_string();
        tokio::task::spawn_blocking(move || hasher.verify(&password, &hash))
            .await
            .map_err(|e| EngineError::Internal(format!("Password check task failed: {}", e)))?
    }

    /// Length rules apply to the trimmed username
    pub async fn register(&self, request: RegisterRequest, origin: &RequestOrigin) -> Result<User> {
        let request = RegisterRequest {
            username: request.username.trim().to_string(),
            email: request.email.trim().to_lowercase(),
            password: request.password,
        };
        request.validate()?;

        let password_hash = self.hash_password(&request.password).await?;
        let user = self
            .store
            .insert_user(NewUser {
                username: request.username,
                email: request.email,
                password_hash,
                role: Role::User,
            })
            .await?;

        info!("Registered user {} ({})", user.username, user.id);
        self.audit
            .record(
                Some(user.id),
                actions::USER_REGISTRATION,
                format!("User {} registered", user.username),
                origin,
            )
            .await;

        Ok(user)
    }

    pub async fn authenticate(
        &self,
        request: LoginRequest,
        origin: &RequestOrigin,
    ) -> Result<LoginResponse> {
        request.validate()?;

        let user = match self.store.find_by_email(request.email.trim()).await? {
            Some(user) if user.is_active => user,
            _ => return Err(EngineError::InvalidCredentials),
        };

        if !self.verify_password(&request.password, &user.password_hash).await? {
            warn!("Failed login for user {}", user.id);
            return Err(EngineError::InvalidCredentials);
        }

        let access_token = self.tokens.issue_at(&user, Utc::now().timestamp())?;

        self.audit
            .record(
                Some(user.id),
                actions::USER_LOGIN,
                format!("User {} logged in", user.username),
                origin,
            )
            .await;

        Ok(LoginResponse {
            access_token,
            token_type: "Bearer".to_string(),
            expires_in: self.tokens.ttl_seconds(),
            user,
        })
    }

    pub async fn verify_token(&self, token: &str) -> Result<User> {
        self.verify_token_at(token, Utc::now().timestamp()).await
    }

    /// Resolve a token to its current, active user
    pub async fn verify_token_at(&self, token: &str, now: i64) -> Result<User> {
        let claims = self.tokens.verify_at(token, now)?;
        let user_id = claims.user_id()?;

        match self.store.find_by_id(user_id).await? {
            Some(user) if user.is_active => Ok(user),
            _ => Err(EngineError::UserInactive),
        }
    }

    pub async fn update_profile(
        &self,
        user: &User,
        update: ProfileUpdate,
        origin: &RequestOrigin,
    ) -> Result<User> {
        let update = ProfileUpdate {
            username: update.username.map(|u| u.trim().to_string()),
            email: update.email.map(|e| e.trim().to_lowercase()),
        };
        update.validate()?;
        if update.is_empty() {
            return Err(EngineError::Validation("Nothing to update".to_string()));
        }

        let changed: Vec<&str> = [
            update.username.as_ref().map(|_| "username"),
            update.email.as_ref().map(|_| "email"),
        ]
        .into_iter()
        .flatten()
        .collect();

        let updated = self.store.update_profile(user.id, update).await?;

        self.audit
            .record(
                Some(user.id),
                actions::PROFILE_UPDATE,
                format!("Updated {}", changed.join(", ")),
                origin,
            )
            .await;

        Ok(updated)
    }

    pub async fn change_password(
        &self,
        user: &User,
        request: ChangePasswordRequest,
        origin: &RequestOrigin,
    ) -> Result<()> {
        request.validate()?;

        if !self
            .verify_password(&request.current_password, &user.password_hash)
            .await?
        {
            return Err(EngineError::InvalidCredentials);
        }

        let password_hash = self.hash_password(&request.new_password).await?;
        self.store.set_password_hash(user.id, password_hash).await?;

        self.audit
            .record(
                Some(user.id),
                actions::PASSWORD_CHANGE,
                "Password changed",
                origin,
            )
            .await;

        Ok(())
    }

    pub async fn admin_update(
        &self,
        admin: &User,
        user_id: Uuid,
        update: AdminUserUpdate,
        origin: &RequestOrigin,
    ) -> Result<User> {
        admin.require_admin()?;
        if admin.id == user_id && (update.role.is_some() || update.is_active == Some(false)) {
            return Err(EngineError::Validation(
                "Admins cannot demote or deactivate themselves".to_string(),
            ));
        }

        let details = format!(
            "Set role={:?} is_active={:?} on user {}",
            update.role, update.is_active, user_id
        );
        let updated = self.store.admin_update(user_id, update).await?;

        self.audit
            .record(Some(admin.id), actions::USER_UPDATE, details, origin)
            .await;

        Ok(updated)
    }

    /// Create the bootstrap admin unless the email is already registered
    pub async fn ensure_admin(&self, username: &str, email: &str, password: &str) -> Result<User> {
        let email = email.trim().to_lowercase();
        if let Some(existing) = self.store.find_by_email(&email).await? {
            if existing.role != Role::Admin {
                warn!("Bootstrap admin email {} belongs to a non-admin account", email);
            }
            return Ok(existing);
        }

        let password_hash = self.hash_password(password).await?;
        let admin = self
            .store
            .insert_user(NewUser {
                username: username.to_string(),
                email,
                password_hash,
                role: Role::Admin,
            })
            .await?;

        info!("Created bootstrap admin {} ({})", admin.username, admin.id);
        Ok(admin)
    }
}
