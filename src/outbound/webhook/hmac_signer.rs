use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

const SIGNATURE_PREFIX: &str = "sha256=";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignatureError {
    #[error("invalid signature header format: {0}")]
    InvalidHeader(String),

    #[error("signature is not valid hex")]
    InvalidHex,

    #[error("signature mismatch")]
    Mismatch,
}

/// HMAC-SHA256 signer over the exact body bytes of a delivery
pub struct HmacSigner {
    secret: String,
}

impl HmacSigner {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// Hex-encoded signature of `body`
    pub fn sign(&self, body: &[u8]) -> String {
        hex::encode(self.mac(body).finalize().into_bytes())
    }

    /// Constant-time check of a hex signature against `body`
    pub fn verify(&self, body: &[u8], signature_hex: &str) -> Result<(), SignatureError> {
        let expected = hex::decode(signature_hex).map_err(|_| SignatureError::InvalidHex)?;
        self.mac(body)
            .verify_slice(&expected)
            .map_err(|_| SignatureError::Mismatch)
    }

    fn mac(&self, body: &[u8]) -> HmacSha256 {
        let mut mac = match HmacSha256::new_from_slice(self.secret.as_bytes()) {
            Ok(mac) => mac,
            Err(_) => unreachable!("HMAC key can be of any size, as per crate documentation"),
        };
        mac.update(body);
        mac
    }
}

/// Helper function to format signature for HTTP header
pub fn format_signature_header(signature: &str) -> String {
    format!("{SIGNATURE_PREFIX}{signature}")
}

/// Helper function to parse signature from HTTP header
pub fn parse_signature_header(header: &str) -> Result<&str, SignatureError> {
    header
        .strip_prefix(SIGNATURE_PREFIX)
        .ok_or_else(|| SignatureError::InvalidHeader(header.to_string()))
}

/// Receiver-side check of an `X-Signature` header value.
pub fn verify_signature(secret: &str, body: &[u8], header: &str) -> Result<(), SignatureError> {
    let signature = parse_signature_header(header.trim())?;
    HmacSigner::new(secret).verify(body, signature)
}
