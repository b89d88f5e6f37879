use crate::identity::ResolvedIdentity;
use serde::{Deserialize, Serialize};

pub const SCOPE_BLOCK_VERSION: &str = "v1";
pub const SCOPE_BLOCK_OPEN: &str = "<<<identity-scope";
pub const SCOPE_BLOCK_CLOSE: &str = ">>>";

/// The contract block handed to downstream memory components.
///
/// This is a typed value; the line-oriented text form exists only in
/// [`ScopeBlock::render`]. Field names, ordering, and the marker pair are a
/// compatibility contract: changing any of them requires bumping
/// [`SCOPE_BLOCK_VERSION`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScopeBlock {
    Scoped {
        scope_key: String,
        user_id: String,
        external_id: Option<String>,
        verified: bool,
        channel: String,
        peer_id: String,
    },
    Gated {
        notice: Option<String>,
    },
}

/// Derive the scope block for a resolved identity. When `require_verified`
/// is set and the identity is unverified, every field is withheld behind a
/// gated block carrying only the optional notice.
pub fn derive_scope(
    identity: &ResolvedIdentity,
    require_verified: bool,
    gating_notice: Option<&str>,
) -> ScopeBlock {
    if require_verified && !identity.verified {
        return ScopeBlock::Gated {
            notice: gating_notice.map(str::to_string),
        };
    }

    ScopeBlock::Scoped {
        scope_key: identity.scope_key().to_string(),
        user_id: identity.user_id.clone(),
        external_id: identity.external_id.clone(),
        verified: identity.verified,
        channel: identity.channel.clone(),
        peer_id: identity.peer_id.clone(),
    }
}

impl ScopeBlock {
    pub fn is_gated(&self) -> bool {
        matches!(self, ScopeBlock::Gated { .. })
    }

    /// Render the versioned line-oriented text form.
    pub fn render(&self) -> String {
        let mut lines = vec![format!("{SCOPE_BLOCK_OPEN} {SCOPE_BLOCK_VERSION}")];
        match self {
            ScopeBlock::Scoped {
                scope_key,
                user_id,
                external_id,
                verified,
                channel,
                peer_id,
            } => {
                lines.push(format!("scope_key: {scope_key}"));
                lines.push(format!("user_id: {user_id}"));
                if let Some(external_id) = external_id {
                    lines.push(format!("external_id: {external_id}"));
                }
                lines.push(format!("verified: {verified}"));
                lines.push(format!("channel: {channel}"));
                lines.push(format!("peer_id: {peer_id}"));
                lines.push("gated: false".to_string());
            }
            ScopeBlock::Gated { notice } => {
                lines.push("gated: true".to_string());
                if let Some(notice) = notice {
                    lines.push(format!("notice: {notice}"));
                }
            }
        }
        lines.push(SCOPE_BLOCK_CLOSE.to_string());
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(external_id: Option<&str>) -> ResolvedIdentity {
        ResolvedIdentity {
            user_id: "usr_7".to_string(),
            external_id: external_id.map(str::to_string),
            first_name: Some("Ana".to_string()),
            last_name: Some("Lopez".to_string()),
            channel: "whatsapp".to_string(),
            peer_id: "+15551230000".to_string(),
            verified: external_id.is_some(),
        }
    }

    #[test]
    fn scoped_block_uses_external_id_as_scope_key() {
        let block = derive_scope(&identity(Some("ext-42")), false, None);
        match &block {
            ScopeBlock::Scoped {
                scope_key,
                external_id,
                verified,
                ..
            } => {
                assert_eq!(scope_key, "ext-42");
                assert_eq!(external_id.as_deref(), Some("ext-42"));
                assert!(verified);
            }
            ScopeBlock::Gated { .. } => panic!("expected scoped block"),
        }
    }

    #[test]
    fn unverified_identity_scopes_to_user_id() {
        let block = derive_scope(&identity(None), false, None);
        match &block {
            ScopeBlock::Scoped {
                scope_key,
                external_id,
                verified,
                ..
            } => {
                assert_eq!(scope_key, "usr_7");
                assert_eq!(*external_id, None);
                assert!(!verified);
            }
            ScopeBlock::Gated { .. } => panic!("expected scoped block"),
        }
    }

    #[test]
    fn require_verified_gates_unverified_identity() {
        let block = derive_scope(&identity(None), true, Some("verify first"));
        assert!(block.is_gated());
        let rendered = block.render();
        assert!(rendered.contains("gated: true"));
        assert!(rendered.contains("notice: verify first"));
        assert!(!rendered.contains("scope_key"));
        assert!(!rendered.contains("user_id"));
    }

    #[test]
    fn require_verified_passes_verified_identity() {
        let block = derive_scope(&identity(Some("ext-42")), true, None);
        assert!(!block.is_gated());
    }

    #[test]
    fn rendered_block_keeps_field_order_and_markers() {
        let rendered = derive_scope(&identity(Some("ext-42")), false, None).render();
        let lines: Vec<&str> = rendered.lines().collect();
        assert_eq!(lines[0], "<<<identity-scope v1");
        assert_eq!(lines[1], "scope_key: ext-42");
        assert_eq!(lines[2], "user_id: usr_7");
        assert_eq!(lines[3], "external_id: ext-42");
        assert_eq!(lines[4], "verified: true");
        assert_eq!(lines[5], "channel: whatsapp");
        assert_eq!(lines[6], "peer_id: +15551230000");
        assert_eq!(lines[7], "gated: false");
        assert_eq!(lines[8], ">>>");
    }

    #[test]
    fn rendered_block_omits_absent_external_id() {
        let rendered = derive_scope(&identity(None), false, None).render();
        assert!(!rendered.contains("external_id"));
        assert!(rendered.contains("scope_key: usr_7"));
    }
}
