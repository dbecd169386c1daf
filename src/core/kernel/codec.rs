use serde_json::Value;

use crate::core::errors::ClientError;

/// One logical unit of the wire protocol.
///
/// The protocol is socket.io-style text framing: a leading numeric tag
/// distinguishes control frames from event frames, and event frames embed a
/// JSON array of `["<event name>", <body>]`.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// `0{json}` - transport open, carries handshake info such as `sid`.
    Open(Value),
    /// `40` / `40{json}` - namespace connect request or acknowledgment.
    ConnectAck(Option<Value>),
    /// `2` - server liveness probe, must be answered with `Pong`.
    Ping,
    /// `3` - liveness ack.
    Pong,
    /// `1` / `41` - close notice.
    Close,
    /// `42[...]` or `451-[...]` - named event with a structured body.
    /// Commands, command replies and unsolicited pushes all travel as events.
    Event { name: String, body: Value },
}

impl Frame {
    pub fn event(name: impl Into<String>, body: Value) -> Self {
        Self::Event {
            name: name.into(),
            body,
        }
    }

    /// Encode into the wire text. Deterministic: identical logical frames
    /// always produce byte-identical output.
    pub fn encode(&self) -> String {
        match self {
            Self::Open(body) => format!("0{body}"),
            Self::ConnectAck(None) => "40".to_string(),
            Self::ConnectAck(Some(body)) => format!("40{body}"),
            Self::Ping => "2".to_string(),
            Self::Pong => "3".to_string(),
            Self::Close => "41".to_string(),
            Self::Event { name, body } => {
                if body.is_null() {
                    format!("42[{}]", Value::String(name.clone()))
                } else {
                    format!("42[{},{}]", Value::String(name.clone()), body)
                }
            }
        }
    }

    /// Decode one complete frame from its wire text.
    pub fn decode(raw: &str) -> Result<Self, ClientError> {
        match raw {
            "" => Err(ClientError::Framing("empty frame".to_string())),
            "2" => Ok(Self::Ping),
            "3" => Ok(Self::Pong),
            "1" | "41" => Ok(Self::Close),
            "40" => Ok(Self::ConnectAck(None)),
            _ => {
                if let Some(body) = raw.strip_prefix("40") {
                    let value = serde_json::from_str(body)
                        .map_err(|e| ClientError::Framing(format!("bad connect ack: {e}")))?;
                    return Ok(Self::ConnectAck(Some(value)));
                }
                if let Some(body) = raw.strip_prefix("42") {
                    return Self::decode_event(body);
                }
                // `451-[...]` announces a binary attachment; the JSON part
                // after the separator still names the event and its body.
                if let Some(rest) = raw.strip_prefix("451-") {
                    return Self::decode_event(rest);
                }
                if let Some(body) = raw.strip_prefix('0') {
                    let value = serde_json::from_str(body)
                        .map_err(|e| ClientError::Framing(format!("bad open frame: {e}")))?;
                    return Ok(Self::Open(value));
                }
                let head: String = raw.chars().take(16).collect();
                Err(ClientError::Framing(format!(
                    "unrecognized frame tag: {head}"
                )))
            }
        }
    }

    fn decode_event(body: &str) -> Result<Self, ClientError> {
        let parsed: Value = serde_json::from_str(body)
            .map_err(|e| ClientError::Framing(format!("bad event frame: {e}")))?;
        let arr = parsed
            .as_array()
            .ok_or_else(|| ClientError::Framing("event frame is not an array".to_string()))?;
        let name = arr
            .first()
            .and_then(Value::as_str)
            .ok_or_else(|| ClientError::Framing("event frame missing name".to_string()))?
            .to_string();
        let body = arr.get(1).cloned().unwrap_or(Value::Null);
        Ok(Self::Event { name, body })
    }
}

/// Reassembly buffer for frames split across multiple transport reads.
///
/// The transport normally delivers one frame per text message, but partial
/// reads can split a frame at an arbitrary byte. Bytes are buffered until the
/// accumulated text parses as a complete frame; `push` returns the frames
/// completed by the given chunk.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    pending: String,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one transport read. A chunk ending a frame yields that frame;
    /// otherwise the bytes are retained for the next read.
    pub fn push(&mut self, chunk: &str) -> Result<Vec<Frame>, ClientError> {
        self.pending.push_str(chunk);

        match Frame::decode(&self.pending) {
            Ok(frame) => {
                self.pending.clear();
                Ok(vec![frame])
            }
            Err(_) if self.could_complete() => Ok(Vec::new()),
            Err(e) => {
                self.pending.clear();
                Err(e)
            }
        }
    }

    /// Whether the buffered prefix could still grow into a valid frame.
    /// A JSON-bodied frame is incomplete until its brackets balance; anything
    /// that already fails with balanced brackets is genuinely malformed.
    fn could_complete(&self) -> bool {
        let s = &self.pending;
        let Some(first) = s.chars().next() else {
            return true;
        };
        if !first.is_ascii_digit() {
            return false;
        }

        let mut depth = 0i32;
        let mut in_string = false;
        let mut escaped = false;
        let mut seen_json = false;
        for c in s.chars() {
            if in_string {
                if escaped {
                    escaped = false;
                } else if c == '\\' {
                    escaped = true;
                } else if c == '"' {
                    in_string = false;
                }
                continue;
            }
            match c {
                '"' => {
                    in_string = true;
                    seen_json = true;
                }
                '{' | '[' => {
                    depth += 1;
                    seen_json = true;
                }
                '}' | ']' => depth -= 1,
                _ => {}
            }
        }
        // Tag-only prefixes ("4", "45", "451-") and unbalanced JSON bodies
        // may still complete; balanced-but-unparseable input is malformed.
        in_string || depth > 0 || !seen_json
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn round_trip_control_frames() {
        for frame in [Frame::Ping, Frame::Pong, Frame::Close, Frame::ConnectAck(None)] {
            assert_eq!(Frame::decode(&frame.encode()).unwrap(), frame);
        }
    }

    #[test]
    fn round_trip_event_frames() {
        let frames = [
            Frame::event("ps", Value::Null),
            Frame::event("getBalance", Value::Null),
            Frame::event(
                "openOrder",
                json!({"asset": "EURUSD", "amount": 10.0, "action": "call"}),
            ),
            Frame::event("loadHistoryPeriod", json!({"asset": "EURUSD", "period": 60})),
        ];
        for frame in frames {
            assert_eq!(Frame::decode(&frame.encode()).unwrap(), frame);
        }
    }

    #[test]
    fn encoding_is_deterministic() {
        let frame = Frame::event("openOrder", json!({"asset": "EURUSD", "amount": 10.0}));
        assert_eq!(frame.encode(), frame.encode());
    }

    #[test]
    fn decodes_open_and_connect_ack_bodies() {
        let open = Frame::decode(r#"0{"sid":"abc","pingInterval":25000}"#).unwrap();
        assert!(matches!(open, Frame::Open(ref v) if v["sid"] == "abc"));

        let ack = Frame::decode(r#"40{"sid":"xyz"}"#).unwrap();
        assert!(matches!(ack, Frame::ConnectAck(Some(ref v)) if v["sid"] == "xyz"));
    }

    #[test]
    fn decodes_attachment_announced_events() {
        let frame = Frame::decode(r#"451-["loadHistoryPeriod",{"asset":"EURUSD"}]"#).unwrap();
        assert_eq!(
            frame,
            Frame::event("loadHistoryPeriod", json!({"asset": "EURUSD"}))
        );
    }

    #[test]
    fn malformed_input_is_a_framing_error() {
        assert!(matches!(
            Frame::decode("hello"),
            Err(ClientError::Framing(_))
        ));
        assert!(matches!(
            Frame::decode(r#"42{"not":"an array"}"#),
            Err(ClientError::Framing(_))
        ));
        assert!(matches!(Frame::decode(""), Err(ClientError::Framing(_))));
    }

    #[test]
    fn buffer_reassembles_split_frames() {
        let mut buffer = FrameBuffer::new();
        assert!(buffer.push(r#"42["successauth","#).unwrap().is_empty());
        let frames = buffer.push(r#"{"uid":42}]"#).unwrap();
        assert_eq!(frames, vec![Frame::event("successauth", json!({"uid": 42}))]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn buffer_rejects_balanced_garbage() {
        let mut buffer = FrameBuffer::new();
        assert!(buffer.push(r#"42{"x":1}"#).is_err());
        // Buffer recovers after the error.
        assert_eq!(
            buffer.push("2").unwrap(),
            vec![Frame::Ping],
        );
    }
}
