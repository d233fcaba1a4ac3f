//! Challenge/signature authentication.
//!
//! The handshake is two ordinary calls:
//!
//! 1. `generateAuthChallenge` with no params returns an opaque challenge string
//! 2. `authenticateWithAddress` with `{address, signature}` returns the user
//!    record, or a falsy value if the signature was rejected
//!
//! Key handling and signing are delegated to a [`Signer`]. The server drops
//! connections that do not authenticate promptly, so call
//! [`Connection::authenticate`] right after connecting.

use serde_json::{json, Value};
use tracing::{debug, info};

use crate::connection::Connection;
use crate::error::{ClientError, Result};

/// Remote method returning a fresh login challenge.
pub const CHALLENGE_METHOD: &str = "generateAuthChallenge";

/// Remote method verifying an address/signature pair.
pub const AUTHENTICATE_METHOD: &str = "authenticateWithAddress";

/// Holder of a private credential.
///
/// Implementations wrap whatever key material and signature scheme the
/// server expects. The client forwards their output verbatim.
pub trait Signer: Send + Sync {
    /// Public identifier derived from the credential.
    fn derive_address(&self) -> anyhow::Result<String>;

    /// Signature over `challenge`.
    fn sign(&self, challenge: &str) -> anyhow::Result<String>;
}

/// Authenticated user record as returned by the server.
#[derive(Debug, Clone, PartialEq)]
pub struct User {
    record: Value,
}

impl User {
    pub fn record(&self) -> &Value {
        &self.record
    }

    /// Field of the user record, if it is an object.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.record.get(key)
    }

    pub fn into_inner(self) -> Value {
        self.record
    }
}

/// `null` and `false` reject; anything else is a user record.
fn is_truthy(value: &Value) -> bool {
    !matches!(value, Value::Null | Value::Bool(false))
}

impl Connection {
    /// Prove ownership of `signer`'s credential and return the user record.
    ///
    /// # Errors
    ///
    /// - `ClientError::AuthenticationFailed` if signing fails, the challenge
    ///   is not a string, or the server returns a falsy result
    /// - any error `call` can return
    pub async fn authenticate<S>(&self, signer: &S) -> Result<User>
    where
        S: Signer + ?Sized,
    {
        let challenge = self.call(CHALLENGE_METHOD, None).await?;
        let challenge = challenge.as_str().ok_or_else(|| {
            ClientError::AuthenticationFailed(format!(
                "Challenge is not a string: {}",
                challenge
            ))
        })?;
        debug!("Received authentication challenge");

        let address = signer
            .derive_address()
            .map_err(|e| ClientError::AuthenticationFailed(format!("Invalid credential: {:#}", e)))?;
        let signature = signer
            .sign(challenge)
            .map_err(|e| ClientError::AuthenticationFailed(format!("Signing failed: {:#}", e)))?;

        let result = self
            .call(
                AUTHENTICATE_METHOD,
                Some(json!({"address": address, "signature": signature})),
            )
            .await?;

        if !is_truthy(&result) {
            return Err(ClientError::AuthenticationFailed(format!(
                "Server rejected signature for {}",
                address
            )));
        }

        info!(%address, "Authenticated");
        Ok(User { record: result })
    }
}
