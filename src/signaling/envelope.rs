use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, SessionError};

/// The single message shape exchanged with the signaling server, in both directions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    /// Parse one text frame.
    pub fn from_frame(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| SessionError::MalformedEnvelope(format!("unparsable frame: {}", e)))
    }

    pub fn to_frame(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| SessionError::MalformedEnvelope(format!("cannot serialize: {}", e)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// Negotiated media/transport parameters, in the browser's `{type, sdp}` JSON form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// One network candidate, in the browser's `RTCIceCandidateInit` JSON form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        default,
        rename = "sdpMLineIndex",
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

/// An envelope whose payload has been validated against its type tag.
#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    Chat { from: Option<String>, content: String },
    Offer { from: Option<String>, description: SessionDescription },
    Answer { from: Option<String>, description: SessionDescription },
    Candidate { from: Option<String>, candidate: IceCandidate },
    Error { message: String },
}

impl Signal {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Chat { .. } => "chat",
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::Candidate { .. } => "candidate",
            Self::Error { .. } => "error",
        }
    }

    pub fn chat(content: impl Into<String>) -> Self {
        Self::Chat {
            from: None,
            content: content.into(),
        }
    }

    pub fn offer(description: SessionDescription) -> Self {
        Self::Offer {
            from: None,
            description,
        }
    }

    pub fn answer(description: SessionDescription) -> Self {
        Self::Answer {
            from: None,
            description,
        }
    }

    pub fn candidate(candidate: IceCandidate) -> Self {
        Self::Candidate {
            from: None,
            candidate,
        }
    }

    /// Validate the payload of a raw envelope against its type tag.
    pub fn decode(envelope: Envelope) -> Result<Self> {
        let Envelope { kind, from, data } = envelope;
        match kind.as_str() {
            "chat" => {
                if from.is_none() {
                    return Err(SessionError::MalformedEnvelope(
                        "chat envelope without 'from'".to_owned(),
                    ));
                }
                let content = text_payload(&kind, data)?;
                Ok(Self::Chat { from, content })
            }
            "offer" => Ok(Self::Offer {
                description: description_payload(SdpType::Offer, data)?,
                from,
            }),
            "answer" => Ok(Self::Answer {
                description: description_payload(SdpType::Answer, data)?,
                from,
            }),
            "candidate" => {
                if data.is_null() {
                    return Err(missing_data(&kind));
                }
                let candidate: IceCandidate = serde_json::from_value(data).map_err(|e| {
                    SessionError::MalformedEnvelope(format!("invalid candidate: {}", e))
                })?;
                Ok(Self::Candidate { from, candidate })
            }
            "error" => Ok(Self::Error {
                message: text_payload(&kind, data)?,
            }),
            _ => Err(SessionError::UnrecognizedType(kind)),
        }
    }

    /// Build the outbound envelope. `from` is never sent; the server stamps identity.
    pub fn encode(&self) -> Result<Envelope> {
        let data = match self {
            Self::Chat { content, .. } => Value::String(content.clone()),
            Self::Offer { description, .. } | Self::Answer { description, .. } => {
                to_value(description)?
            }
            Self::Candidate { candidate, .. } => to_value(candidate)?,
            Self::Error { message } => Value::String(message.clone()),
        };
        Ok(Envelope {
            kind: self.kind().to_owned(),
            from: None,
            data,
        })
    }
}

fn missing_data(kind: &str) -> SessionError {
    SessionError::MalformedEnvelope(format!("{} envelope without 'data'", kind))
}

fn text_payload(kind: &str, data: Value) -> Result<String> {
    match data {
        Value::String(text) => Ok(text),
        Value::Null => Err(missing_data(kind)),
        other => Err(SessionError::MalformedEnvelope(format!(
            "{} envelope expects text data, got {}",
            kind, other
        ))),
    }
}

fn description_payload(expected: SdpType, data: Value) -> Result<SessionDescription> {
    let kind = match expected {
        SdpType::Offer => "offer",
        _ => "answer",
    };
    if data.is_null() {
        return Err(missing_data(kind));
    }
    let Value::Object(mut fields) = data else {
        return Err(SessionError::MalformedEnvelope(format!(
            "{} data is not a session description",
            kind
        )));
    };
    let sdp = match fields.remove("sdp") {
        Some(Value::String(sdp)) => sdp,
        _ => {
            return Err(SessionError::MalformedEnvelope(format!(
                "{} description without 'sdp'",
                kind
            )))
        }
    };
    // The inner `type` may be omitted; when present it must agree with the envelope.
    if let Some(inner) = fields.remove("type") {
        let inner: SdpType = serde_json::from_value(inner).map_err(|e| {
            SessionError::MalformedEnvelope(format!("invalid description type: {}", e))
        })?;
        if inner != expected {
            return Err(SessionError::MalformedEnvelope(format!(
                "{} envelope carries a {:?} description",
                kind, inner
            )));
        }
    }
    Ok(SessionDescription {
        sdp_type: expected,
        sdp,
    })
}

fn to_value<T: Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value)
        .map_err(|e| SessionError::MalformedEnvelope(format!("cannot serialize: {}", e)))
}
