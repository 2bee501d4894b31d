use crate::errors::{EngineError, Result};
use crate::models::{AdminUserUpdate, NewUser, ProfileUpdate, User};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;
use uuid::Uuid;

/// User persistence; username and email are unique
#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// `Conflict` when the username or email is taken
    async fn insert_user(&self, user: NewUser) -> Result<User>;

    async fn find_by_id(&self, user_id: Uuid) -> Result<Option<User>>;

    async fn find_by_email(&self, email: &str) -> Result<Option<User>>;

    async fn update_profile(&self, user_id: Uuid, update: ProfileUpdate) -> Result<User>;

    async fn set_password_hash(&self, user_id: Uuid, password_hash: String) -> Result<()>;

    async fn admin_update(&self, user_id: Uuid, update: AdminUserUpdate) -> Result<User>;
}

/// Users held in process memory
///
/// One write lock covers the uniqueness check and the write.
#[derive(Default)]
pub struct MemoryIdentityStore {
    users: RwLock<HashMap<Uuid, User>>,
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn check_unique(
        users: &HashMap<Uuid, User>,
        except: Option<Uuid>,
        username: Option<&str>,
        email: Option<&str>,
    ) -> Result<()> {
        for user in users.values().filter(|u| Some(u.id) != except) {
            if username.map_or(false, |name| user.username == name) {
                return Err(EngineError::Conflict("Username already exists".to_string()));
            }
            if email.map_or(false, |mail| user.email.eq_ignore_ascii_case(mail)) {
                return Err(EngineError::Conflict("Email already exists".to_string()));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl IdentityStore for MemoryIdentityStore {
    async fn insert_user(&self, new_user: NewUser) -> Result<User> {
        let mut users = self.users.write();
        Self::check_unique(
            &users,
            None,
            Some(&new_user.username),
            Some(&new_user.email),
        )?;

        let user = User {
            id: Uuid::new_v4(),
            username: new_user.username,
            email: new_user.email,
            password_hash: new_user.password_hash,
            role: new_user.role,
            is_active: true,
            created_at: Utc::now(),
        };
        users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn find_by_id(&self, user_id: Uuid) -> Result<Option<User>> {
        Ok(self.users.read().get(&user_id).cloned())
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<User>> {
        Ok(self
            .users
            .read()
            .values()
            .find(|u| u.email.eq_ignore_ascii_case(email))
            .cloned())
    }

    async fn update_profile(&self, user_id: Uuid, update: ProfileUpdate) -> Result<User> {
        let mut users = self.users.write();
        Self::check_unique(
            &users,
            Some(user_id),
            update.username.as_deref(),
            update.email.as_deref(),
        )?;

        let user = users
            .get_mut(&user_id)
            .ok_or_else(|| EngineError::NotFound(format!("User {}", user_id)))?;
        if let Some(username) = update.username {
            user.username = username;
        }
        if let Some(email) = update.email {
            user.email = email;
        }
        Ok(user.clone())
    }

    async fn set_password_hash(&self, user_id: Uuid, password_hash: String) -> Result<()> {
        let mut users = self.users.write();
        let user = users
            .get_mut(&user_id)
            .ok_or_else(|| EngineError::NotFound(format!("User {}", user_id)))?;
        user.password_hash = password_hash;
        Ok(())
    }

    async fn admin_update(&self, user_id: Uuid, update: AdminUserUpdate) -> Result<User> {
        let mut users = self.users.write();
        let user = users
            .get_mut(&user_id)
            .ok_or_else(|| EngineError::NotFound(format!("User {}", user_id)))?;
        if let Some(role) = update.role {
            user.role = role;
        }
        if let Some(is_active) = update.is_active {
            user.is_active = is_active;
        }
        Ok(user.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Role;

    fn new_user(username: &str, email: &str) -> NewUser {
        NewUser {
            username: username.to_string(),
            email: email.to_string(),
            password_hash: "$argon2id$placeholder".to_string(),
            role: Role::User,
        }
    }

    #[tokio::test]
    async fn test_duplicate_email_rejected_and_row_unchanged() {
        let store = MemoryIdentityStore::new();
        let original = store.insert_user(new_user("alice", "alice@example.com")).await.unwrap();

        let dup = store.insert_user(new_user("alice2", "ALICE@example.com")).await;
        assert!(matches!(dup, Err(EngineError::Conflict(_))));

        let stored = store.find_by_id(original.id).await.unwrap().unwrap();
        assert_eq!(stored.username, "alice");
        assert_eq!(stored.password_hash, original.password_hash);
    }

    #[tokio::test]
    async fn test_profile_update_enforces_uniqueness() {
        let store = MemoryIdentityStore::new();
        let alice = store.insert_user(new_user("alice", "alice@example.com")).await.unwrap();
        store.insert_user(new_user("bob", "bob@example.com")).await.unwrap();

        let taken = ProfileUpdate {
            username: Some("bob".to_string()),
            email: None,
        };
        assert!(matches!(
            store.update_profile(alice.id, taken).await,
            Err(EngineError::Conflict(_))
        ));

        // Keeping one's own email is not a conflict
        let same = ProfileUpdate {
            username: Some("alice_w".to_string()),
            email: Some("alice@example.com".to_string()),
        };
        let updated = store.update_profile(alice.id, same).await.unwrap();
        assert_eq!(updated.username, "alice_w");
    }

    #[tokio::test]
    async fn test_admin_update() {
        let store = MemoryIdentityStore::new();
        let user = store.insert_user(new_user("dave", "dave@example.com")).await.unwrap();

        let updated = store
            .admin_update(
                user.id,
                AdminUserUpdate {
                    role: Some(Role::Auditor),
                    is_active: Some(false),
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.role, Role::Auditor);
        assert!(!updated.is_active);

        assert!(matches!(
            store.admin_update(Uuid::new_v4(), AdminUserUpdate::default()).await,
            Err(EngineError::NotFound(_))
        ));
    }
}
