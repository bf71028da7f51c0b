//! SDP offer/answer exchange with the backend.

use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use tambourine_core::types::ClientIdentity;
use tambourine_session::TransportError;

/// Header carrying the client identity on signalling requests.
pub const CLIENT_UUID_HEADER: &str = "X-Client-UUID";

#[derive(Debug, Serialize)]
struct OfferRequest<'a> {
    sdp: &'a str,
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(rename = "requestData")]
    request_data: serde_json::Value,
}

/// The backend's SDP answer.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Answer {
    pub sdp: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub pc_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SignallingClient {
    http: Client,
}

impl SignallingClient {
    pub fn new(request_timeout: Duration) -> Result<Self, TransportError> {
        let http = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| TransportError::Signalling(format!("HTTP client: {}", e)))?;
        Ok(Self { http })
    }

    /// POST `offer_sdp` to `{server_url}/api/offer` and return the answer.
    ///
    /// A 401 means the backend does not know `identity`.
    pub async fn exchange(
        &self,
        server_url: &str,
        identity: &ClientIdentity,
        offer_sdp: &str,
    ) -> Result<Answer, TransportError> {
        let url = format!("{}/api/offer", server_url.trim_end_matches('/'));
        let body = OfferRequest {
            sdp: offer_sdp,
            kind: "offer",
            request_data: json!({ "clientUUID": identity.as_str() }),
        };

        let response = self
            .http
            .post(&url)
            .header(CLIENT_UUID_HEADER, identity.as_str())
            .json(&body)
            .send()
            .await
            .map_err(|e| TransportError::Signalling(e.to_string()))?;

        match response.status() {
            StatusCode::UNAUTHORIZED => {
                warn!(identity = %identity, "Backend rejected client identity");
                Err(TransportError::IdentityRejected)
            }
            status if !status.is_success() => Err(TransportError::Signalling(format!("HTTP {}", status))),
            _ => {
                let answer: Answer = response
                    .json()
                    .await
                    .map_err(|e| TransportError::Signalling(format!("Malformed answer: {}", e)))?;
                if answer.kind != "answer" {
                    return Err(TransportError::Signalling(format!(
                        "Expected an answer, got {}",
                        answer.kind
                    )));
                }
                debug!(pc_id = ?answer.pc_id, "Received SDP answer");
                Ok(answer)
            }
        }
    }
}
