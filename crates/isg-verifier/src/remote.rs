use crate::VerifierSetupError;
use isg_core::{split_display_name, VerifiedIdentity};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

/// Remote verification: one POST of the raw credential to the configured
/// endpoint, with a bounded timeout. Transport failures and timeouts are a
/// normal negative result, never a fault.
pub struct RemoteVerifier {
    endpoint: String,
    client: reqwest::Client,
}

impl RemoteVerifier {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, VerifierSetupError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| VerifierSetupError::HttpClient(err.to_string()))?;
        Ok(Self {
            endpoint: endpoint.into(),
            client,
        })
    }

    pub async fn verify(&self, credential: &str) -> Option<VerifiedIdentity> {
        let response = match self
            .client
            .post(&self.endpoint)
            .json(&json!({ "token": credential }))
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => {
                debug!(error = %err, "remote verification transport failure");
                return None;
            }
        };

        if !response.status().is_success() {
            debug!(status = %response.status(), "remote verification rejected");
            return None;
        }

        let body: Value = match response.json().await {
            Ok(body) => body,
            Err(err) => {
                debug!(error = %err, "remote verification returned malformed body");
                return None;
            }
        };

        // The peer contract accepts either identifier field name.
        let external_id = body
            .get("id")
            .and_then(Value::as_str)
            .or_else(|| body.get("user_id").and_then(Value::as_str))?
            .to_string();

        let (first_name, last_name) = match body.get("name").and_then(Value::as_str) {
            Some(name) => split_display_name(name),
            None => (None, None),
        };
        let email = body
            .get("email")
            .and_then(Value::as_str)
            .map(str::to_string);

        Some(VerifiedIdentity {
            external_id,
            first_name,
            last_name,
            email,
            claims: body,
        })
    }
}
