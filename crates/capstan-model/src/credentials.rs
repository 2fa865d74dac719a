// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Credential seam for the transport client.
//!
//! The OAuth credential file reader/refresher lives outside this crate; the
//! transport only needs a current bearer token and the ability to force one
//! refresh after a 401.

use async_trait::async_trait;

#[async_trait]
pub trait CredentialSource: Send + Sync {
    /// Current bearer token.
    async fn access_token(&self) -> anyhow::Result<String>;

    /// Force a refresh and return the new token.  The transport calls this
    /// exactly once after an authentication failure before giving up.
    async fn refresh(&self) -> anyhow::Result<String>;
}

/// A fixed token — API keys and tests.  `refresh` returns the same token.
pub struct StaticCredential {
    token: String,
}

impl StaticCredential {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl CredentialSource for StaticCredential {
    async fn access_token(&self) -> anyhow::Result<String> {
        Ok(self.token.clone())
    }

    async fn refresh(&self) -> anyhow::Result<String> {
        Ok(self.token.clone())
    }
}
