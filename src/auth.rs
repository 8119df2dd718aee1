use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::{PgWireError, PgWireResult};

use crate::observability::AUTH_FAILURES_TOTAL;

/// Who may connect: per-user passwords, plus an optional shared password for
/// anyone not listed.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    users: HashMap<String, String>,
    shared: Option<String>,
}

impl Credentials {
    pub fn shared(password: String) -> Self {
        Self {
            users: HashMap::new(),
            shared: Some(password),
        }
    }

    pub fn new(users: HashMap<String, String>, shared: Option<String>) -> Self {
        Self { users, shared }
    }

    /// Parse a users file: a JSON object mapping user name to password.
    pub fn parse_users(json: &str) -> Result<HashMap<String, String>, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn password_for(&self, user: &str) -> Option<&str> {
        self.users.get(user).or(self.shared.as_ref()).map(String::as_str)
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }
}

#[derive(Debug)]
pub struct VivatAuthSource {
    credentials: Arc<Credentials>,
}

impl VivatAuthSource {
    pub fn new(credentials: Arc<Credentials>) -> Self {
        Self { credentials }
    }
}

#[async_trait]
impl AuthSource for VivatAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        let user = login.user().unwrap_or_default();
        match self.credentials.password_for(user) {
            Some(password) => Ok(Password::new(None, password.as_bytes().to_vec())),
            None => {
                metrics::counter!(AUTH_FAILURES_TOTAL).increment(1);
                tracing::warn!("login rejected for unknown user {user:?}");
                Err(PgWireError::InvalidPassword(user.to_string()))
            }
        }
    }
}
