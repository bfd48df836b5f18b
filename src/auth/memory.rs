use std::collections::HashMap;
use std::sync::Mutex;
use async_trait::async_trait;
use tokio::sync::watch;

use crate::auth::{AuthProvider, AuthSession, Credentials};
use crate::error::AuthError;

struct Account {
    user_id: String,
    password: String,
}

/// An [`AuthProvider`] that keeps accounts in memory. Used offline and in tests.
pub struct InMemoryAuthProvider {
    accounts: Mutex<HashMap<String, Account>>,
    session: watch::Sender<Option<AuthSession>>,
}

impl Default for InMemoryAuthProvider {
    fn default() -> Self {
        InMemoryAuthProvider::new()
    }
}

impl InMemoryAuthProvider {
    pub fn new() -> Self {
        let (session, _) = watch::channel(None);
        InMemoryAuthProvider {
            accounts: Mutex::new(HashMap::new()),
            session,
        }
    }

    fn normalize(email: &str) -> String {
        email.trim().to_lowercase()
    }

    fn start_session(&self, session: AuthSession) -> AuthSession {
        self.session.send_replace(Some(session.clone()));
        session
    }
}

#[async_trait]
impl AuthProvider for InMemoryAuthProvider {
    async fn sign_in(&self, credentials: &Credentials) -> Result<AuthSession, AuthError> {
        let email = Self::normalize(&credentials.email);
        let session = {
            let accounts = self.accounts.lock().expect("Failed to lock accounts");
            match accounts.get(&email) {
                Some(account) if account.password == credentials.password => AuthSession {
                    user_id: account.user_id.clone(),
                    email,
                },
                _ => return Err(AuthError::InvalidCredentials),
            }
        };

        Ok(self.start_session(session))
    }

    async fn sign_up(&self, credentials: &Credentials) -> Result<AuthSession, AuthError> {
        let email = Self::normalize(&credentials.email);
        let session = {
            let mut accounts = self.accounts.lock().expect("Failed to lock accounts");
            if accounts.contains_key(&email) {
                return Err(AuthError::AccountExists(email));
            }

            let user_id = format!("user-{}", accounts.len() + 1);
            accounts.insert(email.clone(), Account { user_id: user_id.clone(), password: credentials.password.clone() });
            AuthSession { user_id, email }
        };

        Ok(self.start_session(session))
    }

    fn on_session_change(&self) -> watch::Receiver<Option<AuthSession>> {
        self.session.subscribe()
    }

    async fn sign_out(&self) -> Result<(), AuthError> {
        if self.session.borrow().is_none() {
            return Err(AuthError::NotSignedIn);
        }
        self.session.send_replace(None);
        Ok(())
    }
}
