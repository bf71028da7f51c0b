use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use tambourine_core::config::TransportConfig;
use tambourine_session::{
    SessionParams, TransportError, TransportEventSink, TransportFactory, TransportSession,
};

use crate::peer::WebRtcSession;
use crate::signalling::SignallingClient;

/// Creates one `WebRtcSession` per connect attempt.
pub struct WebRtcTransportFactory {
    config: TransportConfig,
    signalling: SignallingClient,
}

impl WebRtcTransportFactory {
    pub fn new(config: TransportConfig, request_timeout: Duration) -> Result<Self, TransportError> {
        Ok(Self {
            config,
            signalling: SignallingClient::new(request_timeout)?,
        })
    }
}

#[async_trait]
impl TransportFactory for WebRtcTransportFactory {
    async fn create(
        &self,
        params: SessionParams,
        events: TransportEventSink,
    ) -> Result<Arc<dyn TransportSession>, TransportError> {
        debug!(
            generation = params.generation,
            server = %params.server_url,
            "Opening WebRTC session"
        );
        let session = WebRtcSession::open(params, events, &self.config, self.signalling.clone()).await?;
        Ok(Arc::new(session))
    }
}
