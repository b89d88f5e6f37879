use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const DEFAULT_VERIFY_TIMEOUT_MS: u64 = 3_000;

/// Which credential-verification strategy to run. Selected once from
/// configuration; absent means verification is disabled.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum VerifyMode {
    LocalSignature,
    RemoteEndpoint,
}

impl VerifyMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerifyMode::LocalSignature => "local-signature",
            VerifyMode::RemoteEndpoint => "remote-endpoint",
        }
    }
}

impl fmt::Display for VerifyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VerifyMode {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "local-signature" | "local_signature" | "local" => Ok(VerifyMode::LocalSignature),
            "remote-endpoint" | "remote_endpoint" | "remote" => Ok(VerifyMode::RemoteEndpoint),
            other => Err(format!("Unknown verify mode: {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct VerifierConfig {
    pub mode: Option<VerifyMode>,
    /// Shared secret for the local-signature strategy.
    pub secret: Option<String>,
    /// Verification URL for the remote-endpoint strategy.
    pub endpoint_url: Option<String>,
    pub issuer: Option<String>,
    pub audience: Option<String>,
    pub timeout_ms: u64,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            mode: None,
            secret: None,
            endpoint_url: None,
            issuer: None,
            audience: None,
            timeout_ms: DEFAULT_VERIFY_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct GateConfig {
    /// Withhold the scope block until the identity carries a verified
    /// external id.
    pub require_verified: bool,
    /// Optional notice rendered inside a gated block.
    pub gating_notice: Option<String>,
}
