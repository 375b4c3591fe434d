//! Authentication for the broker
//!
//! - `TokenIssuer` signs connection tokens (`{sub}`) and subscription tokens
//!   (`{sub, channel}`) with a shared HS256 secret, gated by an `IssuePolicy`
//! - `TokenVerifier` is the broker side of the same secret
//! - `IssuerTokens` hands tokens to the relay client on demand

mod policy;
mod tokens;

pub use policy::IssuePolicy;
pub use tokens::{sign, Claims, TokenError, TokenIssuer, TokenVerifier, ALGORITHM};

use async_trait::async_trait;
use std::sync::Arc;
use trainrelay_client::TokenSource;

/// Mints tokens for one fixed subject
#[derive(Debug, Clone)]
pub struct IssuerTokens {
    issuer: Arc<TokenIssuer>,
    subject: String,
}

impl IssuerTokens {
    pub fn new(issuer: Arc<TokenIssuer>, subject: impl Into<String>) -> Self {
        Self {
            issuer,
            subject: subject.into(),
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }
}

#[async_trait]
impl TokenSource for IssuerTokens {
    async fn connection_token(&self) -> Result<String, String> {
        self.issuer
            .issue_client_token(&self.subject)
            .map_err(|e| e.to_string())
    }

    async fn subscription_token(&self, channel: &str) -> Result<String, String> {
        self.issuer
            .issue_subscription_token(&self.subject, channel)
            .map_err(|e| e.to_string())
    }
}
