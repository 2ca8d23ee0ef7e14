use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::info;
use uuid::Uuid;

use crate::{Database, StoreError};

pub const MIN_PASSWORD_LEN: usize = 5;

/// How long a password reset token stays usable.
pub const RESET_TOKEN_TTL_HOURS: i64 = 72;

const USER_COLUMNS: &str = "id, email, username, first_name, last_name, is_staff, date_joined";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct User {
    pub id: i64,
    pub email: String,
    pub username: String,
    pub first_name: String,
    pub last_name: String,
    pub is_staff: bool,
    pub date_joined: DateTime<Utc>,
}

impl User {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
}

/// One-per-user profile holding an image reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Profile {
    pub id: i64,
    pub user_id: i64,
    pub image: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub email: String,
    pub password: String,
    pub username: String,
    pub first_name: String,
    pub last_name: String,
}

#[derive(Debug, Clone, Default)]
pub struct UserUpdate {
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub password: Option<String>,
}

/// Lower-cases the domain part only; the local part is case-sensitive.
pub fn normalize_email(email: &str) -> String {
    let email = email.trim();
    match email.rsplit_once('@') {
        Some((local, domain)) => format!("{local}@{}", domain.to_ascii_lowercase()),
        None => email.to_string(),
    }
}

fn validate_email(email: &str) -> Result<(), StoreError> {
    match email.rsplit_once('@') {
        Some((local, domain)) if !local.is_empty() && domain.contains('.') => Ok(()),
        _ => Err(StoreError::Validation("Enter a valid email address.".into())),
    }
}

fn validate_password(password: &str) -> Result<(), StoreError> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(StoreError::Validation(format!(
            "Ensure the password has at least {MIN_PASSWORD_LEN} characters."
        )));
    }
    Ok(())
}

/// Argon2id PHC string with a fresh random salt.
fn hash_password(password: &str) -> Result<String, StoreError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| StoreError::PasswordHash(e.to_string()))
}

fn verify_password(password: &str, stored: &str) -> Result<bool, StoreError> {
    let parsed =
        PasswordHash::new(stored).map_err(|e| StoreError::Corrupt(format!("password hash: {e}")))?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok())
}

/// Reset tokens are stored as digests; the raw value only leaves in the link.
fn reset_token_digest(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Accounts, opaque auth tokens, password resets and profiles.
#[derive(Debug, Clone)]
pub struct UserStore {
    db: Database,
}

impl UserStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn create_user(&self, new: NewUser) -> Result<User, StoreError> {
        let email = normalize_email(&new.email);
        validate_email(&email)?;
        validate_password(&new.password)?;
        if new.username.trim().is_empty() {
            return Err(StoreError::Validation("Username is required.".into()));
        }

        let hash = hash_password(&new.password)?;
        let date_joined = Utc::now();

        let result = sqlx::query(
            r#"
            INSERT INTO users
                (email, username, first_name, last_name, is_staff, password_hash, date_joined)
            VALUES (?, ?, ?, ?, 0, ?, ?)
            "#,
        )
        .bind(&email)
        .bind(new.username.trim())
        .bind(&new.first_name)
        .bind(&new.last_name)
        .bind(&hash)
        .bind(date_joined)
        .execute(self.db.pool())
        .await;

        let result = match result {
            Ok(result) => result,
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                return Err(StoreError::Conflict(
                    "User with this email address already exists.".into(),
                ));
            }
            Err(err) => return Err(err.into()),
        };

        let id = result.last_insert_rowid();
        info!(user_id = id, "user registered");
        self.get(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("user {id}")))
    }

    pub async fn get(&self, id: i64) -> Result<Option<User>, StoreError> {
        let row = sqlx::query(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?"))
            .bind(id)
            .fetch_optional(self.db.pool())
            .await?;
        row.as_ref().map(user_from_row).transpose()
    }

    pub async fn find_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        let row = sqlx::query(&format!("SELECT {USER_COLUMNS} FROM users WHERE email = ?"))
            .bind(normalize_email(email))
            .fetch_optional(self.db.pool())
            .await?;
        row.as_ref().map(user_from_row).transpose()
    }

    /// `None` for unknown e-mail or wrong password alike.
    pub async fn authenticate(&self, email: &str, password: &str) -> Result<Option<User>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {USER_COLUMNS}, password_hash FROM users WHERE email = ?"
        ))
        .bind(normalize_email(email))
        .fetch_optional(self.db.pool())
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };

        let stored: String = row.try_get("password_hash")?;
        if !verify_password(password, &stored)? {
            return Ok(None);
        }
        user_from_row(&row).map(Some)
    }

    /// Returns the user's token, creating one on first login. Concurrent
    /// logins converge on whichever insert won.
    pub async fn issue_token(&self, user_id: i64) -> Result<String, StoreError> {
        sqlx::query(
            r#"
            INSERT INTO auth_tokens (key, user_id, created_at)
            VALUES (?, ?, ?)
            ON CONFLICT(user_id) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4().simple().to_string())
        .bind(user_id)
        .bind(Utc::now())
        .execute(self.db.pool())
        .await?;

        let row = sqlx::query("SELECT key FROM auth_tokens WHERE user_id = ?")
            .bind(user_id)
            .fetch_one(self.db.pool())
            .await?;
        Ok(row.try_get("key")?)
    }

    pub async fn revoke_token(&self, key: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM auth_tokens WHERE key = ?")
            .bind(key)
            .execute(self.db.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn user_for_token(&self, key: &str) -> Result<Option<User>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT u.id, u.email, u.username, u.first_name, u.last_name, u.is_staff, u.date_joined
              FROM auth_tokens t
              JOIN users u ON u.id = t.user_id
             WHERE t.key = ?
            "#,
        )
        .bind(key)
        .fetch_optional(self.db.pool())
        .await?;
        row.as_ref().map(user_from_row).transpose()
    }

    pub async fn update(&self, id: i64, update: UserUpdate) -> Result<User, StoreError> {
        if let Some(password) = &update.password {
            self.set_password(id, password).await?;
        }

        sqlx::query(
            r#"
            UPDATE users
               SET username = COALESCE(?, username),
                   first_name = COALESCE(?, first_name),
                   last_name = COALESCE(?, last_name)
             WHERE id = ?
            "#,
        )
        .bind(update.username.as_deref())
        .bind(update.first_name.as_deref())
        .bind(update.last_name.as_deref())
        .bind(id)
        .execute(self.db.pool())
        .await?;

        self.get(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("user {id}")))
    }

    /// Any password change voids outstanding reset tokens.
    async fn set_password(&self, id: i64, password: &str) -> Result<(), StoreError> {
        validate_password(password)?;
        let hash = hash_password(password)?;

        let mut tx = self.db.pool().begin().await?;
        sqlx::query("UPDATE users SET password_hash = ? WHERE id = ?")
            .bind(&hash)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM password_reset_tokens WHERE user_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Issues a single-use reset token for the account behind `email`.
    /// Delivering it to the user is the caller's job.
    pub async fn issue_reset_token(&self, email: &str) -> Result<(User, String), StoreError> {
        let user = self
            .find_by_email(email)
            .await?
            .ok_or_else(|| StoreError::NotFound("user with this email".into()))?;

        let token = Uuid::new_v4().simple().to_string();
        sqlx::query(
            "INSERT INTO password_reset_tokens (token_digest, user_id, created_at) VALUES (?, ?, ?)",
        )
        .bind(reset_token_digest(&token))
        .bind(user.id)
        .bind(Utc::now())
        .execute(self.db.pool())
        .await?;

        info!(user_id = user.id, "password reset issued");
        Ok((user, token))
    }

    /// Sets a new password if `token` is a live reset token for `user_id`.
    /// Unknown users and bad or expired tokens are reported alike.
    pub async fn confirm_password_reset(
        &self,
        user_id: i64,
        token: &str,
        new_password: &str,
    ) -> Result<User, StoreError> {
        let invalid = || StoreError::Validation("Invalid UID or token.".into());
        validate_password(new_password)?;

        let row = sqlx::query(
            "SELECT created_at FROM password_reset_tokens WHERE token_digest = ? AND user_id = ?",
        )
        .bind(reset_token_digest(token))
        .bind(user_id)
        .fetch_optional(self.db.pool())
        .await?;
        let Some(row) = row else {
            return Err(invalid());
        };
        let created_at: DateTime<Utc> = row.try_get("created_at")?;
        if Utc::now() - created_at > Duration::hours(RESET_TOKEN_TTL_HOURS) {
            return Err(invalid());
        }

        self.set_password(user_id, new_password).await?;
        info!(user_id, "password reset completed");
        self.get(user_id).await?.ok_or_else(invalid)
    }

    pub async fn profile_for(&self, user_id: i64) -> Result<Option<Profile>, StoreError> {
        let row = sqlx::query("SELECT id, user_id, image FROM profiles WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(self.db.pool())
            .await?;
        row.as_ref().map(profile_from_row).transpose()
    }

    pub async fn create_profile(&self, user_id: i64, image: &str) -> Result<Profile, StoreError> {
        let result = sqlx::query("INSERT INTO profiles (user_id, image) VALUES (?, ?)")
            .bind(user_id)
            .bind(image)
            .execute(self.db.pool())
            .await;
        match result {
            Ok(result) => Ok(Profile {
                id: result.last_insert_rowid(),
                user_id,
                image: Some(image.to_string()),
            }),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                Err(StoreError::Conflict("Your image already exists".into()))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Only the owner's own profile can be addressed; any other id is not found.
    pub async fn update_profile(
        &self,
        user_id: i64,
        profile_id: i64,
        image: &str,
    ) -> Result<Profile, StoreError> {
        let result = sqlx::query("UPDATE profiles SET image = ? WHERE id = ? AND user_id = ?")
            .bind(image)
            .bind(profile_id)
            .bind(user_id)
            .execute(self.db.pool())
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("profile {profile_id}")));
        }
        Ok(Profile {
            id: profile_id,
            user_id,
            image: Some(image.to_string()),
        })
    }
}

fn user_from_row(row: &SqliteRow) -> Result<User, StoreError> {
    Ok(User {
        id: row.try_get("id")?,
        email: row.try_get("email")?,
        username: row.try_get("username")?,
        first_name: row.try_get("first_name")?,
        last_name: row.try_get("last_name")?,
        is_staff: row.try_get("is_staff")?,
        date_joined: row.try_get("date_joined")?,
    })
}

fn profile_from_row(row: &SqliteRow) -> Result<Profile, StoreError> {
    Ok(Profile {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        image: row.try_get("image")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> UserStore {
        let db = Database::in_memory().await.unwrap();
        db.migrate().await.unwrap();
        UserStore::new(db)
    }

    fn new_user(email: &str) -> NewUser {
        NewUser {
            email: email.into(),
            password: "admin12345".into(),
            username: "Admin".into(),
            first_name: "Ada".into(),
            last_name: "Lovelace".into(),
        }
    }

    #[tokio::test]
    async fn email_domain_is_normalized() {
        let users = store().await;
        let user = users.create_user(new_user("Admin@User.COM")).await.unwrap();
        assert_eq!(user.email, "Admin@user.com");
        assert_eq!(user.full_name(), "Ada Lovelace");
        assert!(!user.is_staff);
    }

    #[tokio::test]
    async fn duplicate_email_is_a_conflict() {
        let users = store().await;
        users.create_user(new_user("a@b.io")).await.unwrap();
        let err = users.create_user(new_user("a@B.io")).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn short_password_is_rejected() {
        let users = store().await;
        let mut user = new_user("a@b.io");
        user.password = "1234".into();
        assert!(matches!(
            users.create_user(user).await.unwrap_err(),
            StoreError::Validation(_)
        ));
    }

    #[tokio::test]
    async fn passwords_are_stored_as_argon2_phc_strings() {
        let users = store().await;
        let user = users.create_user(new_user("a@b.io")).await.unwrap();
        let row = sqlx::query("SELECT password_hash FROM users WHERE id = ?")
            .bind(user.id)
            .fetch_one(users.db.pool())
            .await
            .unwrap();
        let stored: String = row.try_get("password_hash").unwrap();
        assert!(stored.starts_with("$argon2"), "{stored}");
        assert!(!stored.contains("admin12345"));
    }

    #[tokio::test]
    async fn authenticate_checks_the_password() {
        let users = store().await;
        let created = users.create_user(new_user("a@b.io")).await.unwrap();
        assert_eq!(
            users.authenticate("a@b.io", "admin12345").await.unwrap(),
            Some(created)
        );
        assert!(users.authenticate("a@b.io", "wrong").await.unwrap().is_none());
        assert!(users.authenticate("x@b.io", "admin12345").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn token_lifecycle() {
        let users = store().await;
        let user = users.create_user(new_user("a@b.io")).await.unwrap();
        let token = users.issue_token(user.id).await.unwrap();
        assert_eq!(users.issue_token(user.id).await.unwrap(), token);
        assert_eq!(users.user_for_token(&token).await.unwrap().unwrap().id, user.id);

        assert!(users.revoke_token(&token).await.unwrap());
        assert!(users.user_for_token(&token).await.unwrap().is_none());
        assert_ne!(users.issue_token(user.id).await.unwrap(), token);
    }

    #[tokio::test]
    async fn concurrent_logins_share_one_token() {
        let users = store().await;
        let user = users.create_user(new_user("a@b.io")).await.unwrap();
        let (first, second) = tokio::join!(users.issue_token(user.id), users.issue_token(user.id));
        assert_eq!(first.unwrap(), second.unwrap());

        let row = sqlx::query("SELECT COUNT(*) AS n FROM auth_tokens WHERE user_id = ?")
            .bind(user.id)
            .fetch_one(users.db.pool())
            .await
            .unwrap();
        assert_eq!(row.try_get::<i64, _>("n").unwrap(), 1);
    }

    #[tokio::test]
    async fn password_change_takes_effect() {
        let users = store().await;
        let user = users.create_user(new_user("a@b.io")).await.unwrap();
        let updated = users
            .update(
                user.id,
                UserUpdate {
                    first_name: Some("Grace".into()),
                    password: Some("newpass1".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.first_name, "Grace");
        assert!(users.authenticate("a@b.io", "admin12345").await.unwrap().is_none());
        assert!(users.authenticate("a@b.io", "newpass1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn reset_token_sets_the_password_once() {
        let users = store().await;
        let created = users.create_user(new_user("a@b.io")).await.unwrap();
        let (user, token) = users.issue_reset_token("a@B.io").await.unwrap();
        assert_eq!(user.id, created.id);

        users
            .confirm_password_reset(user.id, &token, "fresh-pass")
            .await
            .unwrap();
        assert!(users.authenticate("a@b.io", "fresh-pass").await.unwrap().is_some());

        let err = users
            .confirm_password_reset(user.id, &token, "again-pass")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Validation(msg) if msg == "Invalid UID or token."));
    }

    #[tokio::test]
    async fn password_update_voids_pending_reset_tokens() {
        let users = store().await;
        let user = users.create_user(new_user("a@b.io")).await.unwrap();
        let (_, token) = users.issue_reset_token("a@b.io").await.unwrap();
        users
            .update(
                user.id,
                UserUpdate {
                    password: Some("changed1".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert!(users
            .confirm_password_reset(user.id, &token, "hijacked")
            .await
            .is_err());
        assert!(users.authenticate("a@b.io", "changed1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn reset_token_is_bound_to_its_user() {
        let users = store().await;
        users.create_user(new_user("a@b.io")).await.unwrap();
        let other = users.create_user(new_user("c@d.io")).await.unwrap();
        let (_, token) = users.issue_reset_token("a@b.io").await.unwrap();

        assert!(users
            .confirm_password_reset(other.id, &token, "stolen1")
            .await
            .is_err());
        assert!(matches!(
            users.issue_reset_token("nobody@b.io").await.unwrap_err(),
            StoreError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn one_profile_per_user_and_only_the_owner_updates_it() {
        let users = store().await;
        let owner = users.create_user(new_user("a@b.io")).await.unwrap();
        let other = users.create_user(new_user("c@d.io")).await.unwrap();
        assert!(users.profile_for(owner.id).await.unwrap().is_none());

        let profile = users
            .create_profile(owner.id, "uploads/profiles/admin-1.png")
            .await
            .unwrap();
        assert!(matches!(
            users.create_profile(owner.id, "x.png").await.unwrap_err(),
            StoreError::Conflict(_)
        ));

        assert!(matches!(
            users.update_profile(other.id, profile.id, "y.png").await.unwrap_err(),
            StoreError::NotFound(_)
        ));
        users
            .update_profile(owner.id, profile.id, "uploads/profiles/admin-2.png")
            .await
            .unwrap();
        assert_eq!(
            users.profile_for(owner.id).await.unwrap().unwrap().image.as_deref(),
            Some("uploads/profiles/admin-2.png")
        );
    }
}
