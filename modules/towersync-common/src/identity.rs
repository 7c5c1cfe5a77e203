// Decoder for the x-rh-identity header: a base64-encoded JSON envelope
// describing the calling account. Only the fields we log are modelled; the
// raw header is forwarded untouched on status callbacks.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("Invalid base64 encoding: {0}")]
    Encoding(#[from] base64::DecodeError),

    #[error("Invalid identity payload: {0}")]
    Payload(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Deserialize)]
pub struct XrhIdentity {
    pub identity: Identity,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Identity {
    #[serde(default)]
    pub account_number: String,
    #[serde(default)]
    pub internal: Internal,
    #[serde(default)]
    pub user: Option<User>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Internal {
    #[serde(default)]
    pub org_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct User {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub is_org_admin: bool,
}

impl XrhIdentity {
    /// Decode the raw header value.
    pub fn decode(header: &str) -> Result<Self, IdentityError> {
        let data = STANDARD.decode(header)?;
        Ok(serde_json::from_slice(&data)?)
    }
}
