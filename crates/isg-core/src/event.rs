use serde_json::Value;

/// Total extraction over inbound host payloads of unknown shape.
///
/// Recognized message-like objects carry their text under `content`, `text`
/// or `message.text` and an optional session key under `session_key` or
/// `sessionKey`. Anything else degrades to `Empty`; extraction never
/// faults on an unrecognized shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    Message {
        session_key: Option<String>,
        text: String,
    },
    Empty,
}

pub fn extract_inbound(payload: &Value) -> InboundEvent {
    let Some(object) = payload.as_object() else {
        return InboundEvent::Empty;
    };

    let text = object
        .get("content")
        .and_then(Value::as_str)
        .or_else(|| object.get("text").and_then(Value::as_str))
        .or_else(|| {
            object
                .get("message")
                .and_then(|message| message.get("text"))
                .and_then(Value::as_str)
        });

    let Some(text) = text.map(str::trim).filter(|text| !text.is_empty()) else {
        return InboundEvent::Empty;
    };

    let session_key = object
        .get("session_key")
        .and_then(Value::as_str)
        .or_else(|| object.get("sessionKey").and_then(Value::as_str))
        .map(str::to_string);

    InboundEvent::Message {
        session_key,
        text: text.to_string(),
    }
}

/// An inbound utterance classified by its leading command, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserCommand {
    Register {
        first_name: String,
        last_name: Option<String>,
    },
    Verify {
        credential: String,
    },
    /// Plain conversational content, including malformed command attempts.
    Content(String),
}

pub fn parse_command(text: &str) -> UserCommand {
    let trimmed = text.trim();
    let mut tokens = trimmed.split_whitespace();

    match tokens.next() {
        Some("/register") => {
            let Some(first_name) = tokens.next() else {
                return UserCommand::Content(text.to_string());
            };
            let rest = tokens.collect::<Vec<_>>().join(" ");
            UserCommand::Register {
                first_name: first_name.to_string(),
                last_name: if rest.is_empty() { None } else { Some(rest) },
            }
        }
        Some("/verify") => match tokens.next() {
            Some(credential) => UserCommand::Verify {
                credential: credential.to_string(),
            },
            None => UserCommand::Content(text.to_string()),
        },
        _ => UserCommand::Content(text.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extracts_content_and_session_key() {
        let event = extract_inbound(&json!({
            "content": "hello",
            "session_key": "agent:a:whatsapp:+1555",
        }));
        assert_eq!(
            event,
            InboundEvent::Message {
                session_key: Some("agent:a:whatsapp:+1555".to_string()),
                text: "hello".to_string(),
            }
        );
    }

    #[test]
    fn extracts_nested_message_text_and_camel_case_key() {
        let event = extract_inbound(&json!({
            "message": { "text": "  hi there  " },
            "sessionKey": "agent:a:web:sess-9",
        }));
        assert_eq!(
            event,
            InboundEvent::Message {
                session_key: Some("agent:a:web:sess-9".to_string()),
                text: "hi there".to_string(),
            }
        );
    }

    #[test]
    fn unrecognized_shapes_degrade_to_empty() {
        assert_eq!(extract_inbound(&json!(null)), InboundEvent::Empty);
        assert_eq!(extract_inbound(&json!(42)), InboundEvent::Empty);
        assert_eq!(extract_inbound(&json!(["a", "b"])), InboundEvent::Empty);
        assert_eq!(extract_inbound(&json!({"kind": "ping"})), InboundEvent::Empty);
        assert_eq!(extract_inbound(&json!({"content": "   "})), InboundEvent::Empty);
        assert_eq!(extract_inbound(&json!({"content": 7})), InboundEvent::Empty);
    }

    #[test]
    fn parses_register_with_and_without_last_name() {
        assert_eq!(
            parse_command("/register Ana Lopez"),
            UserCommand::Register {
                first_name: "Ana".to_string(),
                last_name: Some("Lopez".to_string()),
            }
        );
        assert_eq!(
            parse_command("/register Ana Maria Lopez"),
            UserCommand::Register {
                first_name: "Ana".to_string(),
                last_name: Some("Maria Lopez".to_string()),
            }
        );
        assert_eq!(
            parse_command("/register Ana"),
            UserCommand::Register {
                first_name: "Ana".to_string(),
                last_name: None,
            }
        );
    }

    #[test]
    fn parses_verify_credential() {
        assert_eq!(
            parse_command("/verify a.b.c"),
            UserCommand::Verify {
                credential: "a.b.c".to_string(),
            }
        );
    }

    #[test]
    fn bare_commands_and_plain_text_are_content() {
        assert_eq!(
            parse_command("/register"),
            UserCommand::Content("/register".to_string())
        );
        assert_eq!(
            parse_command("/verify"),
            UserCommand::Content("/verify".to_string())
        );
        assert_eq!(
            parse_command("hello there"),
            UserCommand::Content("hello there".to_string())
        );
    }
}
