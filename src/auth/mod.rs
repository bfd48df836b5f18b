//! The account service the application signs in with.
//!
//! The service itself lives elsewhere; this module only describes what the application needs
//! from it and applies the form rules before credentials leave the device.

use std::sync::Arc;
use async_trait::async_trait;
use log::info;
use tokio::sync::watch;

use crate::error::AuthError;

pub mod memory;
pub mod validation;

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

// keep passwords out of logs
impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials").field("email", &self.email).finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSession {
    pub user_id: String,
    pub email: String,
}

#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn sign_in(&self, credentials: &Credentials) -> Result<AuthSession, AuthError>;

    /// Creates the account and signs it in.
    async fn sign_up(&self, credentials: &Credentials) -> Result<AuthSession, AuthError>;

    /// The current session; changes whenever the user signs in or out.
    fn on_session_change(&self) -> watch::Receiver<Option<AuthSession>>;

    async fn sign_out(&self) -> Result<(), AuthError>;
}

/// Validates form input, talks to the provider, and answers whether device features may be used.
pub struct AuthGate<P: AuthProvider> {
    provider: Arc<P>,
    session: watch::Receiver<Option<AuthSession>>,
}

impl<P: AuthProvider> AuthGate<P> {
    pub fn new(provider: Arc<P>) -> Self {
        let session = provider.on_session_change();
        AuthGate { provider, session }
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<AuthSession, AuthError> {
        let credentials = validation::validate_sign_in(email, password)?;
        let session = self.provider.sign_in(&credentials).await?;
        info!("Logged in with: {}", session.email);
        Ok(session)
    }

    pub async fn register(&self, email: &str, password: &str, confirmation: &str) -> Result<AuthSession, AuthError> {
        let credentials = validation::validate_sign_up(email, password, confirmation)?;
        let session = self.provider.sign_up(&credentials).await?;
        info!("Registered with: {}", session.email);
        Ok(session)
    }

    pub async fn logout(&self) -> Result<(), AuthError> {
        self.provider.sign_out().await
    }

    pub fn current(&self) -> Option<AuthSession> {
        self.session.borrow().clone()
    }

    /// Fails with [`AuthError::NotSignedIn`] unless someone is signed in.
    pub fn require_session(&self) -> Result<AuthSession, AuthError> {
        self.current().ok_or(AuthError::NotSignedIn)
    }

    /// Waits for the next sign-in or sign-out.
    pub async fn changed(&mut self) -> Option<AuthSession> {
        if self.session.changed().await.is_err() {
            return None;
        }
        self.session.borrow_and_update().clone()
    }
}
