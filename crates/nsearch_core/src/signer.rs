/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - NSEARCH Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{bail, Result};
use async_trait::async_trait;

/// External identity capability. Key custody and event signing live outside
/// this engine; all it ever asks is "who is the current user".
#[async_trait]
pub trait Signer: Send + Sync {
    /// Hex-encoded public key of the current user.
    async fn pubkey(&self) -> Result<String>;
}

/// Fixed-key signer for development binaries and tests.
pub struct StaticSigner {
    pubkey: String,
}

impl StaticSigner {
    pub fn new(pubkey: impl Into<String>) -> Self {
        Self {
            pubkey: pubkey.into(),
        }
    }
}

#[async_trait]
impl Signer for StaticSigner {
    async fn pubkey(&self) -> Result<String> {
        if self.pubkey.is_empty() {
            bail!("no identity configured");
        }
        Ok(self.pubkey.clone())
    }
}
