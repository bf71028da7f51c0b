//! Data-channel message protocol.
//!
//! Outbound messages travel inside the RTVI `client-message` envelope as
//! `{"t": <type>, "d": <payload>}`. Inbound frames are either RTVI control
//! frames (`bot-ready`, `bot-llm-text`) or backend messages discriminated by
//! `type`, optionally wrapped in a `server-message` frame.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use tambourine_core::events::ConfigResponse;
use tambourine_core::types::{CleanupPromptSections, ProviderInfo};

use crate::error::TransportError;

pub const RTVI_LABEL: &str = "rtvi-ai";
pub const RTVI_PROTOCOL_VERSION: &str = "1.0.0";

/// Messages the client sends to the backend.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "t", content = "d", rename_all = "kebab-case")]
pub enum ClientMessage {
    SetPromptSections { sections: CleanupPromptSections },
    SetSttProvider { provider: String },
    SetLlmProvider { provider: String },
    SetSttTimeout { timeout_seconds: f64 },
    GetAvailableProviders {},
    StartRecording {},
    StopRecording {},
}

impl ClientMessage {
    pub fn message_type(&self) -> &'static str {
        match self {
            ClientMessage::SetPromptSections { .. } => "set-prompt-sections",
            ClientMessage::SetSttProvider { .. } => "set-stt-provider",
            ClientMessage::SetLlmProvider { .. } => "set-llm-provider",
            ClientMessage::SetSttTimeout { .. } => "set-stt-timeout",
            ClientMessage::GetAvailableProviders {} => "get-available-providers",
            ClientMessage::StartRecording {} => "start-recording",
            ClientMessage::StopRecording {} => "stop-recording",
        }
    }

    /// Serialize inside a `client-message` envelope.
    pub fn to_envelope(&self) -> Result<Vec<u8>, TransportError> {
        encode(&Envelope {
            label: RTVI_LABEL,
            kind: "client-message",
            id: Uuid::new_v4().to_string(),
            data: self,
        })
    }
}

#[derive(Serialize)]
struct Envelope<'a, T: Serialize> {
    label: &'static str,
    #[serde(rename = "type")]
    kind: &'static str,
    id: String,
    data: &'a T,
}

#[derive(Serialize)]
struct ClientReady {
    version: &'static str,
    about: About,
}

#[derive(Serialize)]
struct About {
    library: &'static str,
    library_version: &'static str,
}

/// The readiness handshake sent once the data channel opens.
pub fn client_ready_envelope() -> Result<Vec<u8>, TransportError> {
    encode(&Envelope {
        label: RTVI_LABEL,
        kind: "client-ready",
        id: Uuid::new_v4().to_string(),
        data: &ClientReady {
            version: RTVI_PROTOCOL_VERSION,
            about: About {
                library: "tambourine",
                library_version: env!("CARGO_PKG_VERSION"),
            },
        },
    })
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, TransportError> {
    serde_json::to_vec(value).map_err(|e| TransportError::Protocol(e.to_string()))
}

/// Messages the backend sends, discriminated by `type`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    RecordingComplete {
        #[serde(rename = "hasContent", default)]
        has_content: Option<bool>,
    },
    ConfigUpdated {
        setting: String,
        #[serde(default)]
        value: Value,
    },
    ConfigError {
        setting: String,
        error: String,
    },
    AvailableProviders {
        #[serde(default)]
        stt: Vec<ProviderInfo>,
        #[serde(default)]
        llm: Vec<ProviderInfo>,
    },
}

const SERVER_MESSAGE_TYPES: [&str; 4] = [
    "recording-complete",
    "config-updated",
    "config-error",
    "available-providers",
];

impl ServerMessage {
    /// The relay payload for configuration replies.
    pub fn config_response(&self) -> Option<ConfigResponse> {
        match self {
            ServerMessage::ConfigUpdated { setting, value } => Some(ConfigResponse::ConfigUpdated {
                setting: setting.clone(),
                value: value.clone(),
            }),
            ServerMessage::ConfigError { setting, error } => Some(ConfigResponse::ConfigError {
                setting: setting.clone(),
                error: error.clone(),
            }),
            _ => None,
        }
    }
}

/// A decoded data-channel frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    BotReady,
    BotText(String),
    Server(ServerMessage),
    Ignored(String),
}

/// Decode one data-channel frame.
pub fn decode_frame(bytes: &[u8]) -> Result<InboundFrame, TransportError> {
    let value: Value =
        serde_json::from_slice(bytes).map_err(|e| TransportError::Protocol(e.to_string()))?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    match kind.as_str() {
        "bot-ready" => Ok(InboundFrame::BotReady),
        "bot-llm-text" => {
            let text = value
                .pointer("/data/text")
                .and_then(Value::as_str)
                .unwrap_or_default();
            Ok(InboundFrame::BotText(text.to_string()))
        }
        "server-message" => match value.get("data") {
            Some(data) => decode_server_message(data.clone()),
            None => Err(TransportError::Protocol("server-message without data".into())),
        },
        _ => decode_server_message(value),
    }
}

fn decode_server_message(value: Value) -> Result<InboundFrame, TransportError> {
    let kind = value.get("type").and_then(Value::as_str).unwrap_or_default();
    if !SERVER_MESSAGE_TYPES.contains(&kind) {
        return Ok(InboundFrame::Ignored(kind.to_string()));
    }
    serde_json::from_value(value)
        .map(InboundFrame::Server)
        .map_err(|e| TransportError::Protocol(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tambourine_core::types::PromptSection;

    fn envelope_json(msg: &ClientMessage) -> Value {
        serde_json::from_slice(&msg.to_envelope().unwrap()).unwrap()
    }

    // =========================================================================
    // Outbound
    // =========================================================================

    #[test]
    fn test_client_message_envelope() {
        let v = envelope_json(&ClientMessage::SetSttProvider {
            provider: "B".into(),
        });
        assert_eq!(v["label"], "rtvi-ai");
        assert_eq!(v["type"], "client-message");
        assert!(v["id"].as_str().is_some());
        assert_eq!(v["data"], json!({"t": "set-stt-provider", "d": {"provider": "B"}}));
    }

    #[test]
    fn test_empty_payload_messages() {
        for msg in [
            ClientMessage::StartRecording {},
            ClientMessage::StopRecording {},
            ClientMessage::GetAvailableProviders {},
        ] {
            let v = envelope_json(&msg);
            assert_eq!(v["data"]["t"], msg.message_type());
            assert_eq!(v["data"]["d"], json!({}));
        }
    }

    #[test]
    fn test_timeout_and_sections_payloads() {
        let v = envelope_json(&ClientMessage::SetSttTimeout {
            timeout_seconds: 0.8,
        });
        assert_eq!(v["data"]["d"]["timeout_seconds"], 0.8);

        let sections = CleanupPromptSections {
            main: PromptSection::Auto { enabled: true },
            advanced: PromptSection::Auto { enabled: true },
            dictionary: PromptSection::Manual {
                enabled: true,
                content: "Tambourine".into(),
            },
        };
        let v = envelope_json(&ClientMessage::SetPromptSections { sections });
        assert_eq!(v["data"]["t"], "set-prompt-sections");
        assert_eq!(v["data"]["d"]["sections"]["dictionary"]["mode"], "manual");
    }

    #[test]
    fn test_client_ready_envelope() {
        let v: Value = serde_json::from_slice(&client_ready_envelope().unwrap()).unwrap();
        assert_eq!(v["type"], "client-ready");
        assert_eq!(v["data"]["version"], RTVI_PROTOCOL_VERSION);
    }

    // =========================================================================
    // Inbound
    // =========================================================================

    #[test]
    fn test_decode_bot_frames() {
        assert_eq!(
            decode_frame(br#"{"label":"rtvi-ai","type":"bot-ready","data":{}}"#).unwrap(),
            InboundFrame::BotReady
        );
        assert_eq!(
            decode_frame(br#"{"type":"bot-llm-text","data":{"text":"Hello"}}"#).unwrap(),
            InboundFrame::BotText("Hello".into())
        );
    }

    #[test]
    fn test_decode_wrapped_recording_complete() {
        let frame = decode_frame(
            br#"{"label":"rtvi-ai","type":"server-message","data":{"type":"recording-complete","hasContent":false}}"#,
        )
        .unwrap();
        assert_eq!(
            frame,
            InboundFrame::Server(ServerMessage::RecordingComplete {
                has_content: Some(false)
            })
        );
    }

    #[test]
    fn test_decode_bare_config_messages() {
        let frame = decode_frame(
            br#"{"type":"config-updated","setting":"stt-provider","value":"whisper","success":true}"#,
        )
        .unwrap();
        let InboundFrame::Server(msg) = frame else {
            panic!("expected server message");
        };
        assert_eq!(
            msg.config_response(),
            Some(ConfigResponse::ConfigUpdated {
                setting: "stt-provider".into(),
                value: json!("whisper"),
            })
        );

        let frame = decode_frame(
            br#"{"type":"config-error","setting":"stt-timeout","error":"Timeout must be between 0.1 and 10.0 seconds"}"#,
        )
        .unwrap();
        assert!(matches!(
            frame,
            InboundFrame::Server(ServerMessage::ConfigError { .. })
        ));
    }

    #[test]
    fn test_decode_available_providers() {
        let frame = decode_frame(
            br#"{"type":"server-message","data":{"type":"available-providers",
                "stt":[{"value":"whisper","label":"Whisper","is_local":true,"model":null}],
                "llm":[{"value":"openai","label":"OpenAI","is_local":false,"model":"gpt-4o"}]}}"#,
        )
        .unwrap();
        let InboundFrame::Server(ServerMessage::AvailableProviders { stt, llm }) = frame else {
            panic!("expected providers");
        };
        assert_eq!(stt[0].value, "whisper");
        assert_eq!(stt[0].model, None);
        assert_eq!(llm[0].model.as_deref(), Some("gpt-4o"));
    }

    #[test]
    fn test_decode_unknown_type_is_ignored() {
        assert_eq!(
            decode_frame(br#"{"type":"user-transcription","data":{}}"#).unwrap(),
            InboundFrame::Ignored("user-transcription".into())
        );
    }

    #[test]
    fn test_decode_garbage_is_protocol_error() {
        assert!(matches!(
            decode_frame(b"not json"),
            Err(TransportError::Protocol(_))
        ));
        assert!(decode_frame(br#"{"type":"config-error","setting":1}"#).is_err());
    }
}
