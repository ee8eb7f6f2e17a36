//! RealIP handshake rewriting.
//!
//! Backends behind the proxy normally see the proxy's address. RealIP
//! smuggles the true client address through the handshake's ServerAddress
//! field instead of (or in addition to) the PROXY protocol. Two dialects
//! exist in the wild: the legacy v2.4 form `host///addr` and the signed
//! v2.5 form `host///addr///timestamp///signature` where the signature is
//! an ECDSA P-256 signature over the preceding fields.

use std::net::SocketAddr;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use p256::ecdsa::{signature::Signer, Signature, SigningKey};
use p256::pkcs8::DecodePrivateKey;
use p256::SecretKey;

use crate::config::ConfigError;
use crate::mc::packets::ServerBoundHandshake;

/// In-place handshake rewrite, applied once per proxied request after
/// admission and before the handshake is forwarded upstream.
pub trait HandshakeModifier: Send {
    fn modify(&self, handshake: &mut ServerBoundHandshake, client_addr: SocketAddr);
}

/// Which rewrite a backend is configured for. Resolved from config; the
/// signed variant carries its pre-loaded key.
#[derive(Debug, Clone)]
pub enum RealIpMode {
    None,
    Legacy,
    Signed(SigningKey),
}

impl RealIpMode {
    /// Build the modifier for a backend worker, if any.
    pub fn into_modifier(self) -> Option<Box<dyn HandshakeModifier + Send>> {
        match self {
            RealIpMode::None => None,
            RealIpMode::Legacy => Some(Box::new(RealIpLegacy)),
            RealIpMode::Signed(key) => Some(Box::new(RealIpSigned { key })),
        }
    }
}

/// RealIP v2.4: append the client address.
pub struct RealIpLegacy;

impl HandshakeModifier for RealIpLegacy {
    fn modify(&self, handshake: &mut ServerBoundHandshake, client_addr: SocketAddr) {
        handshake.server_address = format!("{}///{}", handshake.server_address, client_addr);
    }
}

/// RealIP v2.5: append the client address, a unix timestamp, and an ECDSA
/// signature over all three fields.
pub struct RealIpSigned {
    key: SigningKey,
}

impl HandshakeModifier for RealIpSigned {
    fn modify(&self, handshake: &mut ServerBoundHandshake, client_addr: SocketAddr) {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        let payload = format!(
            "{}///{}///{}",
            handshake.server_address, client_addr, timestamp
        );
        let signature: Signature = self.key.sign(payload.as_bytes());
        handshake.server_address =
            format!("{payload}///{}", BASE64.encode(signature.to_der().as_bytes()));
    }
}

/// Load an ECDSA P-256 private key from a PEM file, accepting both SEC1
/// (`EC PRIVATE KEY`) and PKCS#8 (`PRIVATE KEY`) encodings.
pub fn load_signing_key(path: &Path) -> Result<SigningKey, ConfigError> {
    let pem = std::fs::read_to_string(path).map_err(|err| ConfigError::UnreadableKey {
        path: path.to_path_buf(),
        reason: err.to_string(),
    })?;

    let secret = SecretKey::from_sec1_pem(&pem)
        .or_else(|_| SecretKey::from_pkcs8_pem(&pem))
        .map_err(|err| ConfigError::UnreadableKey {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })?;
    Ok(SigningKey::from(secret))
}
