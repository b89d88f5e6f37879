use serde::{Deserialize, Serialize};

pub const UNKNOWN_CHANNEL: &str = "unknown";

/// A session key resolved to its transport channel and channel-local peer id.
///
/// `peer_id` is `None` for shared sessions (`agent:{id}:main`) where no
/// individual sender exists.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionRef {
    pub channel: String,
    pub peer_id: Option<String>,
}

/// Parse a session key into a `SessionRef`.
///
/// Recognized forms:
/// - `agent:{agentId}:main`: shared session, no peer
/// - `agent:{agentId}:direct:{peerId}`: channel "direct"
/// - `agent:{agentId}:{channel}:direct:{peerId}`: explicit channel, peer
///   after the "direct" marker
/// - `agent:{agentId}:{channel}:{peer...}`: explicit channel, remaining
///   segments re-joined with ':' (peer ids may contain colons, e.g. phone
///   numbers carrying a country-code separator)
///
/// Total function: anything with fewer than 3 segments or a first segment
/// other than "agent" degrades to channel "unknown" with the original
/// string as the peer id.
pub fn parse_session_key(session_key: &str) -> SessionRef {
    let segments: Vec<&str> = session_key.split(':').collect();
    if segments.len() < 3 || segments[0] != "agent" {
        return SessionRef {
            channel: UNKNOWN_CHANNEL.to_string(),
            peer_id: Some(session_key.to_string()),
        };
    }

    if segments.len() == 3 {
        if segments[2] == "main" {
            return SessionRef {
                channel: "main".to_string(),
                peer_id: None,
            };
        }
        return SessionRef {
            channel: segments[2].to_string(),
            peer_id: None,
        };
    }

    if segments[2] == "direct" {
        return SessionRef {
            channel: "direct".to_string(),
            peer_id: non_empty(segments[3..].join(":")),
        };
    }

    if segments[3] == "direct" {
        return SessionRef {
            channel: segments[2].to_string(),
            peer_id: non_empty(segments[4..].join(":")),
        };
    }

    SessionRef {
        channel: segments[2].to_string(),
        peer_id: non_empty(segments[3..].join(":")),
    }
}

fn non_empty(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn main_session_has_no_peer() {
        let parsed = parse_session_key("agent:support:main");
        assert_eq!(parsed.channel, "main");
        assert_eq!(parsed.peer_id, None);
    }

    #[test]
    fn direct_form_uses_direct_channel() {
        let parsed = parse_session_key("agent:support:direct:+15551230000");
        assert_eq!(parsed.channel, "direct");
        assert_eq!(parsed.peer_id.as_deref(), Some("+15551230000"));
    }

    #[test]
    fn explicit_channel_with_direct_marker() {
        let parsed = parse_session_key("agent:support:whatsapp:direct:+15551230000");
        assert_eq!(parsed.channel, "whatsapp");
        assert_eq!(parsed.peer_id.as_deref(), Some("+15551230000"));
    }

    #[test]
    fn peer_segments_are_rejoined_with_colons() {
        let parsed = parse_session_key("agent:support:signal:+1:555:1230000");
        assert_eq!(parsed.channel, "signal");
        assert_eq!(parsed.peer_id.as_deref(), Some("+1:555:1230000"));
    }

    #[test]
    fn direct_marker_peer_keeps_trailing_colons() {
        let parsed = parse_session_key("agent:a:web:direct:sess:9");
        assert_eq!(parsed.channel, "web");
        assert_eq!(parsed.peer_id.as_deref(), Some("sess:9"));
    }

    #[test]
    fn short_keys_degrade_to_unknown_with_original_string() {
        for key in ["", "agent", "agent:alone", "plain-session-id"] {
            let parsed = parse_session_key(key);
            assert_eq!(parsed.channel, UNKNOWN_CHANNEL, "key {key:?}");
            assert_eq!(parsed.peer_id.as_deref(), Some(key), "key {key:?}");
        }
    }

    #[test]
    fn non_agent_prefix_degrades_to_unknown() {
        let parsed = parse_session_key("robot:support:whatsapp:+1555");
        assert_eq!(parsed.channel, UNKNOWN_CHANNEL);
        assert_eq!(parsed.peer_id.as_deref(), Some("robot:support:whatsapp:+1555"));
    }
}
