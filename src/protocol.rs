use serde_json::{json, Value};

/// Inbound client frames. Anything that is not a well-formed, known envelope
/// maps to `Ignored` so the read loop can drop it without closing the
/// connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    Auth { access_token: String },
    Ignored,
}

pub fn parse_client_frame(text: &str) -> ClientFrame {
    let Ok(frame) = serde_json::from_str::<Value>(text) else {
        return ClientFrame::Ignored;
    };
    let Some(kind) = frame.get("type").and_then(Value::as_str) else {
        return ClientFrame::Ignored;
    };
    match kind {
        "AUTH" => {
            let token = frame
                .pointer("/data/accessToken")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|token| !token.is_empty());
            match token {
                Some(token) => ClientFrame::Auth {
                    access_token: token.to_owned(),
                },
                None => ClientFrame::Ignored,
            }
        }
        _ => ClientFrame::Ignored,
    }
}

pub fn auth_required_frame(timeout_ms: u64) -> String {
    json!({
        "type": "AUTH_REQUIRED",
        "data": { "timeout": timeout_ms }
    })
    .to_string()
}

pub fn auth_expired_frame() -> String {
    json!({
        "type": "AUTH_EXPIRED",
        "data": Value::Null
    })
    .to_string()
}

/// An event arriving from the external broadcast channel. Relayed verbatim.
#[derive(Debug, Clone, PartialEq)]
pub struct EventEnvelope {
    pub event_type: String,
    pub data: Value,
}

impl EventEnvelope {
    pub fn relay_frame(&self) -> String {
        json!({
            "type": self.event_type,
            "data": self.data
        })
        .to_string()
    }
}

/// Parses an external event payload. Returns `None` for anything malformed:
/// unparsable JSON, missing or empty `type`, missing `data` key.
pub fn parse_event_envelope(text: &str) -> Option<EventEnvelope> {
    let frame = serde_json::from_str::<Value>(text).ok()?;
    let event_type = frame
        .get("type")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|kind| !kind.is_empty())?
        .to_owned();
    let data = frame.get("data")?.clone();
    Some(EventEnvelope { event_type, data })
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::{
        auth_expired_frame, auth_required_frame, parse_client_frame, parse_event_envelope,
        ClientFrame,
    };

    #[test]
    fn auth_frame_parses_access_token() {
        let frame = parse_client_frame(r#"{"type":"AUTH","data":{"accessToken":"tok-1"}}"#);
        assert_eq!(
            frame,
            ClientFrame::Auth {
                access_token: "tok-1".to_owned()
            }
        );
    }

    #[test]
    fn malformed_client_frames_map_to_ignored() {
        for raw in [
            "not json",
            "{}",
            r#"{"type":"UNKNOWN","data":{}}"#,
            r#"{"type":"AUTH"}"#,
            r#"{"type":"AUTH","data":{}}"#,
            r#"{"type":"AUTH","data":{"accessToken":""}}"#,
            r#"{"type":"AUTH","data":{"accessToken":42}}"#,
            r#"[1,2,3]"#,
        ] {
            assert_eq!(parse_client_frame(raw), ClientFrame::Ignored, "raw={raw}");
        }
    }

    #[test]
    fn server_notice_frames_carry_expected_shapes() {
        let required: Value = serde_json::from_str(&auth_required_frame(15_000)).expect("json");
        assert_eq!(required.get("type").and_then(Value::as_str), Some("AUTH_REQUIRED"));
        assert_eq!(
            required.pointer("/data/timeout").and_then(Value::as_u64),
            Some(15_000)
        );

        let expired: Value = serde_json::from_str(&auth_expired_frame()).expect("json");
        assert_eq!(expired.get("type").and_then(Value::as_str), Some("AUTH_EXPIRED"));
        assert_eq!(expired.get("data"), Some(&Value::Null));
    }

    #[test]
    fn event_envelope_requires_type_and_data() {
        let envelope = parse_event_envelope(r#"{"type":"order.filled","data":{"id":7}}"#)
            .expect("well-formed envelope");
        assert_eq!(envelope.event_type, "order.filled");
        assert_eq!(envelope.data, json!({"id": 7}));

        assert!(parse_event_envelope("garbage").is_none());
        assert!(parse_event_envelope(r#"{"data":{}}"#).is_none());
        assert!(parse_event_envelope(r#"{"type":"","data":{}}"#).is_none());
        assert!(parse_event_envelope(r#"{"type":"x"}"#).is_none());
    }

    #[test]
    fn event_envelope_relays_null_data_verbatim() {
        let envelope = parse_event_envelope(r#"{"type":"ping","data":null}"#).expect("envelope");
        let relayed: Value = serde_json::from_str(&envelope.relay_frame()).expect("json");
        assert_eq!(relayed.get("type").and_then(Value::as_str), Some("ping"));
        assert_eq!(relayed.get("data"), Some(&Value::Null));
    }
}
