//! HS256 tokens for the broker
//!
//! Format: `base64url(header).base64url(payload).base64url(signature)`, no padding.
//! - header: `{"typ":"JWT","alg":"HS256"}`
//! - payload: `{"sub":..}` for connections, `{"sub":..,"channel":..}` for subscriptions
//! - signature: HMAC-SHA256(secret, "<header>.<payload>")

use crate::auth::policy::IssuePolicy;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// The only algorithm issued and accepted
pub const ALGORITHM: &str = "HS256";

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("invalid token format")]
    InvalidFormat,

    #[error("invalid token signature")]
    InvalidSignature,

    #[error("token decode error: {0}")]
    DecodeError(String),

    #[error("token encode error: {0}")]
    EncodeError(String),

    #[error("unsupported token algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("invalid signing key")]
    InvalidKey,

    #[error("not authorized: {0}")]
    Unauthorized(String),
}

#[derive(Debug, Serialize, Deserialize)]
struct Header {
    typ: String,
    alg: String,
}

impl Header {
    fn hs256() -> Self {
        Self {
            typ: "JWT".to_string(),
            alg: ALGORITHM.to_string(),
        }
    }
}

/// Payload carried by a token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Subject identity
    pub sub: String,
    /// Channel a subscription token is scoped to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
}

fn mac(secret: &[u8]) -> Result<HmacSha256, TokenError> {
    HmacSha256::new_from_slice(secret).map_err(|_| TokenError::InvalidKey)
}

fn encode_segment<T: Serialize>(value: &T) -> Result<String, TokenError> {
    let json = serde_json::to_vec(value).map_err(|e| TokenError::EncodeError(e.to_string()))?;
    Ok(URL_SAFE_NO_PAD.encode(json))
}

fn decode_segment<T: for<'de> Deserialize<'de>>(segment: &str) -> Result<T, TokenError> {
    let json = URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|e| TokenError::DecodeError(e.to_string()))?;
    serde_json::from_slice(&json).map_err(|e| TokenError::DecodeError(e.to_string()))
}

/// Sign `claims` with `secret`; deterministic for identical inputs
pub fn sign(secret: &[u8], claims: &Claims) -> Result<String, TokenError> {
    let signing_input = format!(
        "{}.{}",
        encode_segment(&Header::hs256())?,
        encode_segment(claims)?
    );

    let mut mac = mac(secret)?;
    mac.update(signing_input.as_bytes());
    let signature = mac.finalize().into_bytes();

    Ok(format!(
        "{}.{}",
        signing_input,
        URL_SAFE_NO_PAD.encode(signature)
    ))
}

/// Signs connection and subscription tokens, subject to an issuing policy
#[derive(Clone)]
pub struct TokenIssuer {
    secret: Vec<u8>,
    policy: IssuePolicy,
}

impl TokenIssuer {
    pub fn new(secret: impl Into<Vec<u8>>, policy: IssuePolicy) -> Self {
        Self {
            secret: secret.into(),
            policy,
        }
    }

    /// Token authorizing `subject` to connect
    pub fn issue_client_token(&self, subject: &str) -> Result<String, TokenError> {
        self.policy.check_subject(subject)?;
        sign(
            &self.secret,
            &Claims {
                sub: subject.to_string(),
                channel: None,
            },
        )
    }

    /// Token authorizing `subject` to subscribe to `channel`
    ///
    /// An empty channel is left out of the payload.
    pub fn issue_subscription_token(
        &self,
        subject: &str,
        channel: &str,
    ) -> Result<String, TokenError> {
        self.policy.check_subscription(subject, channel)?;
        sign(
            &self.secret,
            &Claims {
                sub: subject.to_string(),
                channel: (!channel.is_empty()).then(|| channel.to_string()),
            },
        )
    }

    /// Verifier holding the same secret
    pub fn verifier(&self) -> TokenVerifier {
        TokenVerifier::new(self.secret.clone())
    }

    pub fn policy(&self) -> &IssuePolicy {
        &self.policy
    }
}

impl fmt::Debug for TokenIssuer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenIssuer")
            .field("secret", &"[REDACTED]")
            .field("policy", &self.policy)
            .finish()
    }
}

/// Checks token signatures and decodes their claims
#[derive(Clone)]
pub struct TokenVerifier {
    secret: Vec<u8>,
}

impl TokenVerifier {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// Verify the signature, then decode header and claims
    pub fn verify(&self, token: &str) -> Result<Claims, TokenError> {
        let mut parts = token.split('.');
        let (Some(header_b64), Some(payload_b64), Some(signature_b64), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(TokenError::InvalidFormat);
        };

        let signature = URL_SAFE_NO_PAD
            .decode(signature_b64)
            .map_err(|_| TokenError::InvalidSignature)?;

        // Constant-time comparison
        let mut mac = mac(&self.secret)?;
        mac.update(header_b64.as_bytes());
        mac.update(b".");
        mac.update(payload_b64.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| TokenError::InvalidSignature)?;

        let header: Header = decode_segment(header_b64)?;
        if header.alg != ALGORITHM {
            return Err(TokenError::UnsupportedAlgorithm(header.alg));
        }

        decode_segment(payload_b64)
    }
}

impl fmt::Debug for TokenVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TokenVerifier([REDACTED])")
    }
}
