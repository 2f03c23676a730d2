use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::{QzoneApi, UpstreamError};
use crate::credential::CredentialAgent;

/// Expiry-aware front of [`QzoneApi`].
///
/// Each call snapshots the agent's session. A `SessionExpired` answer hands
/// control to [`CredentialAgent::on_session_expired`] and retries with the
/// refreshed cookie, at most `max_retry` times.
#[derive(Clone)]
pub struct SessionClient {
    api: Arc<dyn QzoneApi>,
    agent: Arc<CredentialAgent>,
    max_retry: u32,
    timeout: Duration,
}

impl SessionClient {
    pub fn new(api: Arc<dyn QzoneApi>, agent: Arc<CredentialAgent>, max_retry: u32, timeout: Duration) -> Self {
        Self { api, agent, max_retry, timeout }
    }

    pub fn agent(&self) -> &Arc<CredentialAgent> {
        &self.agent
    }

    pub fn api(&self) -> &Arc<dyn QzoneApi> {
        &self.api
    }

    pub async fn publish(&self, text: &str, images: &[Vec<u8>]) -> Result<String, UpstreamError> {
        let mut attempt = 0;
        loop {
            let generation = self.agent.generation();
            let session = self.agent.session();
            let result = tokio::time::timeout(self.timeout, self.api.publish(&session, text, images))
                .await
                .unwrap_or(Err(UpstreamError::Timeout));
            match result {
                Err(UpstreamError::SessionExpired) if attempt < self.max_retry => {
                    attempt += 1;
                    if let Err(e) = self.agent.on_session_expired(generation).await {
                        warn!(error = %e, "refresh after expired publish failed");
                        return Err(UpstreamError::SessionExpired);
                    }
                    debug!(attempt, "retrying publish with refreshed session");
                }
                other => return other,
            }
        }
    }

    /// One authenticated ping; no refresh, no retry.
    pub async fn probe(&self) -> Result<(), UpstreamError> {
        let session = self.agent.session();
        if !session.is_logged_in() {
            return Err(UpstreamError::SessionExpired);
        }
        tokio::time::timeout(self.timeout, self.api.ping(&session))
            .await
            .unwrap_or(Err(UpstreamError::Timeout))
    }
}
