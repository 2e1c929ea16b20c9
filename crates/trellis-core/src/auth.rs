//! Authentication facade: admin table, bearer tokens, password grant.
//!
//! Basic credentials are checked against a pre-hashed admin table and yield
//! context-free (admin) execution. Bearer tokens resolve through the token
//! model to a user context projected onto the configured user fields. The
//! password grant mints a fresh 32-byte token.

use crate::context::Context;
use crate::password;
use crate::query::QueryErrors;
use crate::storage::Storage;
use base64::engine::general_purpose::{STANDARD as BASE64, URL_SAFE_NO_PAD as BASE64_URL};
use base64::Engine;
use chrono::Utc;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

const TOKEN_BYTES: usize = 32;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("invalid grant: {0}")]
    InvalidGrant(String),
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("storage failure: {0}")]
    Storage(String),
}

impl From<QueryErrors> for AuthError {
    fn from(errors: QueryErrors) -> Self {
        AuthError::Storage(errors.to_string())
    }
}

/// How an authenticated request executes.
#[derive(Debug, Clone)]
pub enum AuthOutcome {
    /// Context-free mode: no access checks apply.
    Admin,
    /// A user context carrying the projected user object.
    User(Context),
}

#[derive(Debug, Clone, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub user_entity: String,
    pub username_field: String,
    pub password_field: String,
    /// Fields projected onto the bearer context's user object; `id` is
    /// always included.
    pub user_fields: Vec<String>,
    pub token_entity: String,
    /// Tokens older than this fail bearer lookup. `None` disables expiry.
    pub token_ttl: Option<Duration>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            user_entity: "User".to_string(),
            username_field: "mail".to_string(),
            password_field: "password".to_string(),
            user_fields: vec!["id".to_string(), "name".to_string(), "mail".to_string()],
            token_entity: "AuthnToken".to_string(),
            token_ttl: Some(Duration::from_secs(30 * 24 * 60 * 60)),
        }
    }
}

pub struct Authenticator {
    storage: Arc<dyn Storage>,
    admins: HashMap<String, String>,
    config: AuthConfig,
}

impl Authenticator {
    /// `admins` maps admin names to pre-hashed passwords.
    pub fn new(
        storage: Arc<dyn Storage>,
        admins: HashMap<String, String>,
        config: AuthConfig,
    ) -> Self {
        Self {
            storage,
            admins,
            config,
        }
    }

    /// Map an `Authorization` header value to an execution mode.
    pub fn authenticate_header(&self, header: &str) -> Result<AuthOutcome, AuthError> {
        let header = header.trim();
        if let Some(encoded) = strip_scheme(header, "Basic") {
            let decoded = BASE64
                .decode(encoded.trim())
                .map_err(|_| AuthError::InvalidCredentials)?;
            let decoded = String::from_utf8(decoded).map_err(|_| AuthError::InvalidCredentials)?;
            let (user, pass) = decoded
                .split_once(':')
                .ok_or(AuthError::InvalidCredentials)?;
            return self.authenticate_basic(user, pass);
        }
        if let Some(token) = strip_scheme(header, "Bearer") {
            return self.authenticate_bearer(token.trim());
        }
        Err(AuthError::InvalidCredentials)
    }

    /// Admin table lookup. Matching credentials switch to context-free mode.
    pub fn authenticate_basic(&self, user: &str, pass: &str) -> Result<AuthOutcome, AuthError> {
        let encoded = self
            .admins
            .get(user)
            .ok_or(AuthError::InvalidCredentials)?;
        if password::is_valid(encoded, pass) {
            Ok(AuthOutcome::Admin)
        } else {
            Err(AuthError::InvalidCredentials)
        }
    }

    /// Token lookup with TTL enforcement, then user projection.
    pub fn authenticate_bearer(&self, token: &str) -> Result<AuthOutcome, AuthError> {
        let query = format!("{{t: list{}(token: $token)}}", self.config.token_entity);
        let response = self
            .storage
            .query(&query, None, Some(&json!({"token": token})))?;
        let row = response["t"]
            .as_array()
            .and_then(|rows| rows.first())
            .cloned()
            .ok_or(AuthError::InvalidCredentials)?;

        if let Some(ttl) = self.config.token_ttl {
            let issued_at = row
                .get("issuedAt")
                .and_then(Value::as_i64)
                .ok_or(AuthError::InvalidCredentials)?;
            let age = Utc::now().timestamp().saturating_sub(issued_at);
            if age < 0 || age as u64 > ttl.as_secs() {
                return Err(AuthError::InvalidCredentials);
            }
        }

        let user_id = row
            .get("userId")
            .cloned()
            .ok_or(AuthError::InvalidCredentials)?;
        let user = self.read_user(&user_id)?;
        Ok(AuthOutcome::User(Context::new(user)))
    }

    /// `POST /token` body handler: the password grant.
    pub fn password_grant(
        &self,
        grant_type: &str,
        username: &str,
        plaintext: &str,
    ) -> Result<TokenResponse, AuthError> {
        if grant_type != "password" {
            return Err(AuthError::InvalidGrant(format!(
                "unsupported grant_type '{grant_type}'"
            )));
        }
        let query = format!(
            "{{u: list{}({}: $username)}}",
            self.config.user_entity, self.config.username_field
        );
        let response = self
            .storage
            .query(&query, None, Some(&json!({"username": username})))?;
        let user = response["u"]
            .as_array()
            .and_then(|rows| rows.first())
            .cloned()
            .ok_or(AuthError::InvalidCredentials)?;
        let encoded = user
            .get(&self.config.password_field)
            .and_then(Value::as_str)
            .ok_or(AuthError::InvalidCredentials)?;
        if !password::is_valid(encoded, plaintext) {
            return Err(AuthError::InvalidCredentials);
        }
        let user_id = user.get("id").cloned().ok_or(AuthError::InvalidCredentials)?;

        let token = mint_token();
        let create = format!(
            "{{t: create{}(token: $token, userId: $userId, issuedAt: $issuedAt)}}",
            self.config.token_entity
        );
        self.storage.query(
            &create,
            None,
            Some(&json!({
                "token": token,
                "userId": user_id,
                "issuedAt": Utc::now().timestamp(),
            })),
        )?;
        tracing::info!(username, "issued bearer token");
        Ok(TokenResponse {
            access_token: token,
            token_type: "bearer".to_string(),
        })
    }

    fn read_user(&self, id: &Value) -> Result<Value, AuthError> {
        let mut fields = self.config.user_fields.clone();
        if !fields.iter().any(|f| f == "id") {
            fields.insert(0, "id".to_string());
        }
        let query = format!(
            "{{u: read{}(id: $id) {{{}}}}}",
            self.config.user_entity,
            fields.join(" ")
        );
        let response = self.storage.query(&query, None, Some(&json!({"id": id})))?;
        let user = response["u"].clone();
        if user.is_null() {
            return Err(AuthError::InvalidCredentials);
        }
        Ok(user)
    }
}

fn strip_scheme<'a>(header: &'a str, scheme: &str) -> Option<&'a str> {
    let (head, rest) = header.split_once(' ')?;
    if head.eq_ignore_ascii_case(scheme) {
        Some(rest)
    } else {
        None
    }
}

fn mint_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    BASE64_URL.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::Dispatcher;
    use crate::storage::MemoryModel;

    fn setup() -> (Arc<Dispatcher>, Authenticator) {
        let users = MemoryModel::new(
            "User",
            json!({
                "properties": {
                    "id": {"type": "string"},
                    "name": {"type": "string"},
                    "mail": {"type": "string"},
                    "password": {"type": "string", "format": "password"}
                }
            }),
        );
        let tokens = MemoryModel::new(
            "AuthnToken",
            json!({
                "properties": {
                    "id": {"type": "string"},
                    "token": {"type": "string"},
                    "userId": {"type": "string", "references": "User"},
                    "issuedAt": {"type": "integer"}
                }
            }),
        );
        let mut dispatcher = Dispatcher::new();
        dispatcher.register_model(Arc::new(users));
        dispatcher.register_model(Arc::new(tokens));
        let dispatcher = dispatcher.into_shared();
        dispatcher
            .execute(
                r#"{createUser(id: "u1", name: "Alice", mail: "alice@example.com", password: "Welcome!")}"#,
                None,
                None,
            )
            .unwrap();

        let mut admins = HashMap::new();
        admins.insert("admin".to_string(), password::hash("secret"));
        let storage = Arc::clone(&dispatcher) as Arc<dyn Storage>;
        let auth = Authenticator::new(storage, admins, AuthConfig::default());
        (dispatcher, auth)
    }

    #[test]
    fn password_grant_then_bearer() {
        let (_dispatcher, auth) = setup();
        let issued = auth
            .password_grant("password", "alice@example.com", "Welcome!")
            .unwrap();
        assert_eq!(issued.token_type, "bearer");

        let outcome = auth
            .authenticate_header(&format!("Bearer {}", issued.access_token))
            .unwrap();
        let AuthOutcome::User(context) = outcome else {
            panic!("bearer token should yield a user context");
        };
        let user = context.user().unwrap();
        assert_eq!(user["id"], json!("u1"));
        assert_eq!(user["mail"], json!("alice@example.com"));
        assert!(user.get("password").is_none(), "password is not projected");
    }

    #[test]
    fn wrong_password_and_unknown_user() {
        let (_dispatcher, auth) = setup();
        assert!(matches!(
            auth.password_grant("password", "alice@example.com", "nope"),
            Err(AuthError::InvalidCredentials)
        ));
        assert!(matches!(
            auth.password_grant("password", "ghost@example.com", "x"),
            Err(AuthError::InvalidCredentials)
        ));
        assert!(matches!(
            auth.password_grant("client_credentials", "alice@example.com", "x"),
            Err(AuthError::InvalidGrant(_))
        ));
    }

    #[test]
    fn random_token_does_not_authenticate() {
        let (_dispatcher, auth) = setup();
        let err = auth
            .authenticate_header(&format!("Bearer {}", mint_token()))
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidCredentials));
    }

    #[test]
    fn expired_token_rejected() {
        let (dispatcher, auth) = setup();
        dispatcher
            .execute(
                "{createAuthnToken(token: $token, userId: $id, issuedAt: $at)}",
                None,
                Some(&json!({
                    "token": "stale",
                    "id": "u1",
                    "at": Utc::now().timestamp() - 60 * 24 * 60 * 60,
                })),
            )
            .unwrap();
        assert!(matches!(
            auth.authenticate_bearer("stale"),
            Err(AuthError::InvalidCredentials)
        ));
    }

    #[test]
    fn basic_admin_auth() {
        let (_dispatcher, auth) = setup();
        let header = format!("Basic {}", BASE64.encode("admin:secret"));
        assert!(matches!(
            auth.authenticate_header(&header).unwrap(),
            AuthOutcome::Admin
        ));

        let bad = format!("Basic {}", BASE64.encode("admin:wrong"));
        assert!(matches!(
            auth.authenticate_header(&bad),
            Err(AuthError::InvalidCredentials)
        ));
    }
}
