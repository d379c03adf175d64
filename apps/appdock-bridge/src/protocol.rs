//! JSON messages exchanged with the browser over an upgraded connection.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const LOGS_ENDED: &str = "Container logs stream ended";
pub const SHELL_CONNECTED: &str = "Connected to container terminal\r\n";
pub const SHELL_READ_FAILED: &str = "Connection closed";

/// Everything the server ever sends. Each variant carries a single `data`
/// string; the `type` tag decides how the client renders it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum OutboundMessage {
    Log(String),
    Output(String),
    Error(String),
    Closed(String),
}

impl OutboundMessage {
    pub fn logs_ended() -> Self {
        OutboundMessage::Closed(LOGS_ENDED.to_string())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            OutboundMessage::Log(_) => "log",
            OutboundMessage::Output(_) => "output",
            OutboundMessage::Error(_) => "error",
            OutboundMessage::Closed(_) => "closed",
        }
    }

    pub fn data(&self) -> &str {
        match self {
            OutboundMessage::Log(data)
            | OutboundMessage::Output(data)
            | OutboundMessage::Error(data)
            | OutboundMessage::Closed(data) => data,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::json!({ "type": self.kind(), "data": self.data() }).to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalSize {
    pub cols: u16,
    pub rows: u16,
}

impl TerminalSize {
    fn new(cols: u64, rows: u64) -> Option<Self> {
        let cols = u16::try_from(cols).ok().filter(|c| *c > 0)?;
        let rows = u16::try_from(rows).ok().filter(|r| *r > 0)?;
        Some(TerminalSize { cols, rows })
    }

    /// Accepts `"120x40"` or a JSON object with `cols` and `rows`.
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(text) => {
                if let Some((cols, rows)) = text.trim().split_once(&['x', 'X'][..]) {
                    return Self::new(cols.trim().parse().ok()?, rows.trim().parse().ok()?);
                }
                serde_json::from_str::<Value>(text)
                    .ok()
                    .filter(Value::is_object)
                    .and_then(|nested| Self::from_value(&nested))
            }
            Value::Object(map) => Self::new(map.get("cols")?.as_u64()?, map.get("rows")?.as_u64()?),
            _ => None,
        }
    }
}

/// Client-to-server traffic on an interactive session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundMessage {
    /// Keystrokes for the remote shell.
    Input(Vec<u8>),
    /// Terminal geometry change; `None` when the payload carried no usable size.
    Resize(Option<TerminalSize>),
    /// Anything else, forwarded to the shell as received.
    Raw(Vec<u8>),
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Option<Value>,
}

impl InboundMessage {
    pub fn from_text(text: &str) -> Self {
        let raw = match serde_json::from_str::<Value>(text) {
            Ok(raw) if raw.is_object() => raw,
            _ => return InboundMessage::Raw(text.as_bytes().to_vec()),
        };
        let Ok(envelope) = serde_json::from_value::<Envelope>(raw.clone()) else {
            return InboundMessage::Raw(text.as_bytes().to_vec());
        };

        match (envelope.kind.as_str(), envelope.data) {
            ("input", Some(Value::String(data))) => InboundMessage::Input(data.into_bytes()),
            ("input", None) => InboundMessage::Input(Vec::new()),
            ("resize", data) => {
                let size = data
                    .as_ref()
                    .and_then(TerminalSize::from_value)
                    .or_else(|| TerminalSize::from_value(&raw));
                InboundMessage::Resize(size)
            }
            _ => InboundMessage::Raw(text.as_bytes().to_vec()),
        }
    }

    pub fn from_binary(bytes: &[u8]) -> Self {
        InboundMessage::Raw(bytes.to_vec())
    }
}
