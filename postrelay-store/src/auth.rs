//! Credential authentication for SMTP sessions.
//!
//! Verifies a submitted (username, password) pair against the hashed
//! credential record, then checks the owning user. The password comparison
//! goes through bcrypt, which is constant-time with respect to the
//! submitted password, so there is no timing oracle on near-miss inputs.

use postrelay_common::models::{SmtpCredential, User, UserStatus};
use thiserror::Error;
use tracing::warn;

use crate::error::StoreError;
use crate::store::Store;

#[derive(Debug, Error)]
pub enum AuthError {
    /// No active credential with that username.
    #[error("credential not found")]
    CredentialNotFound,

    /// The password hash did not match.
    #[error("bad password")]
    BadPassword,

    /// The credential exists but its owning user is not active.
    #[error("user disabled")]
    UserDisabled,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("password hash error: {0}")]
    Hash(#[from] bcrypt::BcryptError),
}

impl AuthError {
    /// Store outages map to a temporary SMTP reply; everything else is a
    /// permanent authentication failure.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Store(_))
    }
}

/// Authenticator over the credential store.
#[derive(Clone)]
pub struct Authenticator {
    store: Store,
}

impl Authenticator {
    #[must_use]
    pub const fn new(store: Store) -> Self {
        Self { store }
    }

    /// Authenticate an SMTP login.
    ///
    /// On success the credential's last-used stamp and usage counter are
    /// updated on a background task; a failure there is logged and does not
    /// fail the authentication.
    ///
    /// # Errors
    /// Returns a variant describing why the login was refused.
    pub async fn authenticate(
        &self,
        username: &str,
        password: &str,
    ) -> Result<(SmtpCredential, User), AuthError> {
        let credential = self
            .store
            .find_credential_by_username(username)
            .await?
            .ok_or(AuthError::CredentialNotFound)?;

        if !bcrypt::verify(password, &credential.password_hash)? {
            return Err(AuthError::BadPassword);
        }

        let user = self
            .store
            .get_user(credential.user_id)
            .await?
            .filter(|user| user.status == UserStatus::Active)
            .ok_or(AuthError::UserDisabled)?;

        let store = self.store.clone();
        let credential_id = credential.id;
        tokio::spawn(async move {
            if let Err(err) = store.increment_credential_usage(credential_id).await {
                warn!(credential_id, %err, "failed to record credential usage");
            }
        });

        Ok((credential, user))
    }
}
