//! Client identity registry.
//!
//! The backend keeps registered identities in memory only, so a stored
//! identity can become unknown at any time (for example after a backend
//! restart). `ensure_identity` always verifies before use and re-registers
//! when verification does not positively confirm the identity.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, info, warn};

use tambourine_core::types::{ClientIdentity, KeyValueStore};

use crate::error::IdentityError;

/// Settings-store key holding the persisted identity.
pub const IDENTITY_KEY: &str = "client_uuid";

/// Identity operations the connection machine depends on.
#[async_trait]
pub trait IdentityService: Send + Sync {
    /// Return a backend-confirmed identity, registering a new one if needed.
    async fn ensure_identity(&self, server_url: &str) -> Result<ClientIdentity, IdentityError>;

    /// Drop the persisted identity.
    fn clear(&self) -> Result<(), IdentityError>;
}

#[derive(Debug, Deserialize)]
struct RegisterResponse {
    uuid: String,
}

#[derive(Debug, Deserialize)]
struct VerifyResponse {
    registered: bool,
}

/// HTTP-backed identity registry persisting into a `KeyValueStore`.
pub struct IdentityRegistry {
    http: Client,
    store: Arc<dyn KeyValueStore>,
}

impl IdentityRegistry {
    pub fn new(store: Arc<dyn KeyValueStore>, request_timeout: Duration) -> Result<Self, IdentityError> {
        let http = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| IdentityError::Registration(format!("HTTP client: {}", e)))?;
        Ok(Self { http, store })
    }

    /// The persisted identity, if any.
    pub fn load(&self) -> Result<Option<ClientIdentity>, IdentityError> {
        Ok(self
            .store
            .get(IDENTITY_KEY)?
            .filter(|s| !s.trim().is_empty())
            .map(ClientIdentity))
    }

    /// Ask the backend whether `identity` is registered.
    ///
    /// Any failure to get a clear answer counts as "not registered".
    pub async fn verify(&self, server_url: &str, identity: &ClientIdentity) -> bool {
        let url = format!("{}/api/client/verify/{}", base(server_url), identity);
        let response = match self.http.get(&url).send().await {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                warn!(status = %r.status(), "Identity verification rejected");
                return false;
            }
            Err(e) => {
                warn!(error = %e, "Identity verification failed, treating identity as unknown");
                return false;
            }
        };
        match response.json::<VerifyResponse>().await {
            Ok(body) => body.registered,
            Err(e) => {
                warn!(error = %e, "Malformed verification response");
                false
            }
        }
    }

    /// Register a new identity with the backend and persist it.
    pub async fn register(&self, server_url: &str) -> Result<ClientIdentity, IdentityError> {
        let url = format!("{}/api/client/register", base(server_url));
        let response = self
            .http
            .post(&url)
            .send()
            .await
            .map_err(|e| IdentityError::Registration(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(IdentityError::Registration(format!("HTTP {}", status)));
        }

        let body: RegisterResponse = response
            .json()
            .await
            .map_err(|e| IdentityError::InvalidResponse(e.to_string()))?;
        if body.uuid.trim().is_empty() {
            return Err(IdentityError::InvalidResponse("empty uuid".into()));
        }

        let identity = ClientIdentity(body.uuid);
        self.store.set(IDENTITY_KEY, identity.as_str())?;
        info!(identity = %identity, "Registered new client identity");
        Ok(identity)
    }
}

#[async_trait]
impl IdentityService for IdentityRegistry {
    async fn ensure_identity(&self, server_url: &str) -> Result<ClientIdentity, IdentityError> {
        if let Some(identity) = self.load()? {
            if self.verify(server_url, &identity).await {
                debug!(identity = %identity, "Stored identity verified");
                return Ok(identity);
            }
            info!(identity = %identity, "Stored identity unknown to backend, clearing");
            self.clear()?;
        }
        self.register(server_url).await
    }

    fn clear(&self) -> Result<(), IdentityError> {
        self.store.delete(IDENTITY_KEY)?;
        Ok(())
    }
}

fn base(server_url: &str) -> &str {
    server_url.trim_end_matches('/')
}
