use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Sender id stamped on messages that originate from the server itself.
pub const SERVER_SENDER: &str = "server";

/// Signaling message relayed between peers.
///
/// `from` is always assigned by the server; whatever the sender put there
/// is overwritten before relaying. Unknown fields are carried through.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(
        default,
        deserialize_with = "string_or_none",
        skip_serializing_if = "Option::is_none"
    )]
    pub from: Option<String>,
    #[serde(
        default,
        deserialize_with = "string_or_none",
        skip_serializing_if = "Option::is_none"
    )]
    pub to: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Addressing fields are advisory: a value that is not a string is
/// treated as absent instead of failing the whole message.
fn string_or_none<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => Some(s),
        _ => None,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
    Join,
    Leave,
}

impl SignalKind {
    pub fn parse(kind: &str) -> Option<Self> {
        match kind {
            "offer" => Some(SignalKind::Offer),
            "answer" => Some(SignalKind::Answer),
            "ice-candidate" => Some(SignalKind::IceCandidate),
            "join" => Some(SignalKind::Join),
            "leave" => Some(SignalKind::Leave),
            _ => None,
        }
    }
}

impl ControlMessage {
    pub fn new(kind: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            kind: kind.into(),
            data,
            from: None,
            to: None,
            extra: Map::new(),
        }
    }

    /// First message a peer receives after the upgrade, telling it its id.
    pub fn welcome(id: &str) -> Self {
        let mut msg = Self::new(
            "welcome",
            Some(serde_json::json!({
                "id": id,
                "timestamp": chrono::Utc::now().to_rfc3339(),
            })),
        );
        msg.from = Some(SERVER_SENDER.to_string());
        msg
    }

    /// Parse a text frame payload. Anything but a JSON object with a
    /// string `type` is rejected.
    pub fn parse(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn signal_kind(&self) -> Option<SignalKind> {
        SignalKind::parse(&self.kind)
    }

    pub fn stamped(mut self, sender: &str) -> Self {
        self.from = Some(sender.to_string());
        self
    }
}
