//! HMAC-SHA256 message signing with the connection-file key.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::KeyError;

type HmacSha256 = Hmac<Sha256>;

/// Signs and verifies the four JSON parts of a multipart message.
///
/// An empty key disables signing: signatures are empty and any signature is
/// accepted, matching kernels launched without a key.
#[derive(Clone)]
pub struct Signer {
    /// Keyed once; each signature starts from a clone.
    mac: Option<HmacSha256>,
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signer")
            .field("enabled", &self.mac.is_some())
            .finish()
    }
}

impl Signer {
    pub fn new(key: &str) -> Result<Self, KeyError> {
        if key.is_empty() {
            return Ok(Self::disabled());
        }
        let mac = HmacSha256::new_from_slice(key.as_bytes())
            .map_err(|e| KeyError(e.to_string()))?;
        Ok(Self { mac: Some(mac) })
    }

    pub fn disabled() -> Self {
        Self { mac: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.mac.is_some()
    }

    fn digest(keyed: &HmacSha256, parts: &[&[u8]]) -> HmacSha256 {
        let mut mac = keyed.clone();
        for part in parts {
            mac.update(part);
        }
        mac
    }

    /// Lowercase hex signature, or an empty string when signing is disabled.
    pub fn sign(&self, parts: &[&[u8]]) -> String {
        match &self.mac {
            Some(keyed) => hex::encode(Self::digest(keyed, parts).finalize().into_bytes()),
            None => String::new(),
        }
    }

    pub fn verify(&self, signature: &[u8], parts: &[&[u8]]) -> bool {
        let Some(keyed) = &self.mac else {
            return true;
        };
        let expected = match hex::decode(signature) {
            Ok(bytes) => bytes,
            Err(_) => return false,
        };
        // Constant-time comparison
        Self::digest(keyed, parts).verify_slice(&expected).is_ok()
    }
}
