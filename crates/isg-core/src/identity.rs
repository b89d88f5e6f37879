use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Output of a successful credential verification. Produced fresh per call,
/// never cached by this subsystem.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VerifiedIdentity {
    pub external_id: String,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    /// Raw decoded claim set, carried for downstream inspection.
    #[serde(default)]
    pub claims: Value,
}

/// A (channel, peer) pair resolved to its canonical user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResolvedIdentity {
    pub user_id: String,
    pub external_id: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub channel: String,
    pub peer_id: String,
    pub verified: bool,
}

impl ResolvedIdentity {
    /// The partition key for per-user state: the external id when present
    /// (cross-channel continuity), otherwise the stable user id.
    pub fn scope_key(&self) -> &str {
        self.external_id.as_deref().unwrap_or(&self.user_id)
    }
}

/// Split a single display name on whitespace: first token becomes the first
/// name, the remaining tokens joined become the last name. Empty input and
/// empty remainders become `None`.
pub fn split_display_name(name: &str) -> (Option<String>, Option<String>) {
    let mut tokens = name.split_whitespace();
    let first = tokens.next().map(str::to_string);
    let rest = tokens.collect::<Vec<_>>().join(" ");
    let last = if rest.is_empty() { None } else { Some(rest) };
    (first, last)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_key_prefers_external_id() {
        let mut identity = ResolvedIdentity {
            user_id: "usr_1".to_string(),
            external_id: Some("ext-42".to_string()),
            first_name: None,
            last_name: None,
            channel: "whatsapp".to_string(),
            peer_id: "+1555".to_string(),
            verified: true,
        };
        assert_eq!(identity.scope_key(), "ext-42");

        identity.external_id = None;
        identity.verified = false;
        assert_eq!(identity.scope_key(), "usr_1");
    }

    #[test]
    fn display_name_splits_on_whitespace() {
        assert_eq!(
            split_display_name("Ana Lopez"),
            (Some("Ana".to_string()), Some("Lopez".to_string()))
        );
        assert_eq!(
            split_display_name("Ana Maria Lopez"),
            (Some("Ana".to_string()), Some("Maria Lopez".to_string()))
        );
        assert_eq!(split_display_name("Ana"), (Some("Ana".to_string()), None));
        assert_eq!(split_display_name(""), (None, None));
        assert_eq!(split_display_name("   "), (None, None));
    }
}
