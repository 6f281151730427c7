//! Message signing capability
//!
//! The egress adapter signs every envelope before publishing it. Which
//! [`Signer`] it uses is decided once at startup by [`select_signer`]: with a
//! signature token configured messages are signed with HMAC-SHA256, without
//! one they go out with the [`UNSIGNED`] sentinel instead of failing.

use std::sync::Arc;

use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::info;

use crate::config::SigningSettings;
use crate::envelope::Envelope;
use crate::error::AgentResult;

type HmacSha256 = Hmac<Sha256>;

/// Signature value used when no signing capability is available
pub const UNSIGNED: &str = "SecurityLibNotInstalled";

pub trait Signer: Send + Sync {
    /// Signature over `message` for the given credentials
    fn sign(&self, message: &[u8], credentials: &SigningSettings) -> String;

    fn is_available(&self) -> bool {
        true
    }
}

/// HMAC-SHA256 signer with a per-session key
///
/// The session key is derived from username, token and expiry, so a key
/// leaked from one session does not sign for another expiry window.
#[derive(Debug, Default, Clone, Copy)]
pub struct HmacSigner;

impl HmacSigner {
    fn session_key(credentials: &SigningSettings) -> Vec<u8> {
        let mut mac = HmacSha256::new_from_slice(credentials.token.as_bytes())
            .expect("HMAC accepts keys of any length");
        mac.update(credentials.username.as_bytes());
        mac.update(b":");
        mac.update(credentials.expires_seconds.to_string().as_bytes());
        mac.finalize().into_bytes().to_vec()
    }
}

impl Signer for HmacSigner {
    fn sign(&self, message: &[u8], credentials: &SigningSettings) -> String {
        let key = Self::session_key(credentials);
        let mut mac = HmacSha256::new_from_slice(&key).expect("HMAC accepts keys of any length");
        mac.update(credentials.username.as_bytes());
        mac.update(message);
        hex::encode(mac.finalize().into_bytes())
    }
}

/// Stand-in used when signing is not possible; delivery proceeds unsigned
#[derive(Debug, Default, Clone, Copy)]
pub struct UnsignedSigner;

impl Signer for UnsignedSigner {
    fn sign(&self, _message: &[u8], _credentials: &SigningSettings) -> String {
        UNSIGNED.to_string()
    }

    fn is_available(&self) -> bool {
        false
    }
}

pub fn select_signer(settings: &SigningSettings) -> Arc<dyn Signer> {
    if settings.token.is_empty() {
        info!("no signature token configured, egress messages will not be authenticated");
        Arc::new(UnsignedSigner)
    } else {
        Arc::new(HmacSigner)
    }
}

/// Stamp signer identity, issue time and signature onto an envelope
pub fn sign_envelope(
    envelope: &mut Envelope,
    signer: &dyn Signer,
    credentials: &SigningSettings,
) -> AgentResult<()> {
    envelope.security.username = credentials.username.clone();
    envelope.security.expires = credentials.expires_seconds;
    envelope.security.time = Utc::now().format("%Y-%m-%d %H:%M:%S%.6f").to_string();

    let message = envelope.message_bytes()?;
    envelope.security.signature = signer.sign(&message, credentials);
    Ok(())
}
