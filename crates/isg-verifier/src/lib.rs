use isg_core::{VerifiedIdentity, VerifierConfig, VerifyMode};
use std::time::Duration;
use thiserror::Error;

mod local;
mod remote;

pub use local::LocalVerifier;
pub use remote::RemoteVerifier;

/// Configuration faults only. Invalid credentials are never an error: both
/// strategies report them as a plain `None`.
#[derive(Debug, Error)]
pub enum VerifierSetupError {
    #[error("local-signature mode requires a shared secret")]
    MissingSecret,
    #[error("remote-endpoint mode requires a verification url")]
    MissingEndpoint,
    #[error("failed to build http client: {0}")]
    HttpClient(String),
}

/// Closed enumeration of credential-verification strategies, selected once
/// from configuration.
pub enum TokenVerifier {
    Local(LocalVerifier),
    Remote(RemoteVerifier),
}

impl TokenVerifier {
    /// Build the configured strategy. `Ok(None)` means verification is
    /// disabled (no mode configured).
    pub fn from_config(config: &VerifierConfig) -> Result<Option<TokenVerifier>, VerifierSetupError> {
        let Some(mode) = config.mode else {
            return Ok(None);
        };

        let verifier = match mode {
            VerifyMode::LocalSignature => {
                let secret = config
                    .secret
                    .as_deref()
                    .filter(|secret| !secret.is_empty())
                    .ok_or(VerifierSetupError::MissingSecret)?;
                TokenVerifier::Local(LocalVerifier::new(
                    secret,
                    config.issuer.clone(),
                    config.audience.clone(),
                ))
            }
            VerifyMode::RemoteEndpoint => {
                let endpoint = config
                    .endpoint_url
                    .as_deref()
                    .filter(|url| !url.is_empty())
                    .ok_or(VerifierSetupError::MissingEndpoint)?;
                TokenVerifier::Remote(RemoteVerifier::new(
                    endpoint,
                    Duration::from_millis(config.timeout_ms),
                )?)
            }
        };
        Ok(Some(verifier))
    }

    /// Validate a credential. Pure query; neither strategy mutates state.
    pub async fn verify(&self, credential: &str) -> Option<VerifiedIdentity> {
        match self {
            TokenVerifier::Local(verifier) => verifier.verify(credential),
            TokenVerifier::Remote(verifier) => verifier.verify(credential).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use isg_core::VerifierConfig;

    #[test]
    fn no_mode_disables_verification() {
        let verifier = TokenVerifier::from_config(&VerifierConfig::default()).expect("build");
        assert!(verifier.is_none());
    }

    #[test]
    fn local_mode_requires_secret() {
        let config = VerifierConfig {
            mode: Some(VerifyMode::LocalSignature),
            ..VerifierConfig::default()
        };
        assert!(matches!(
            TokenVerifier::from_config(&config),
            Err(VerifierSetupError::MissingSecret)
        ));
    }

    #[test]
    fn remote_mode_requires_endpoint() {
        let config = VerifierConfig {
            mode: Some(VerifyMode::RemoteEndpoint),
            ..VerifierConfig::default()
        };
        assert!(matches!(
            TokenVerifier::from_config(&config),
            Err(VerifierSetupError::MissingEndpoint)
        ));
    }
}
