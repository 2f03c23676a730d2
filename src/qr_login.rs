//! QR-Login Coordinator.
//!
//! One QR session at a time. `request_qr` replaces the session wholesale and
//! bumps its generation; each poll task remembers the generation it was
//! started for and exits as soon as it is no longer current.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::QrConfig;
use crate::credential::CredentialAgent;
use crate::models::{QrStatus, QrStatusView};
use crate::qzone::{QrCode, QrPoll, QzoneApi, UpstreamError};

#[derive(thiserror::Error, Debug)]
pub enum QrError {
    #[error("cannot obtain qr code: {0}")]
    Upstream(#[from] UpstreamError),
    #[error("shutting down")]
    ShuttingDown,
}

struct QrSession {
    generation: u64,
    status: QrStatus,
    message: String,
}

impl QrSession {
    /// Moves forward along the QR status graph; anything else is ignored.
    fn advance(&mut self, next: QrStatus, message: impl Into<String>) -> bool {
        if !self.status.can_advance_to(next) {
            return false;
        }
        self.status = next;
        self.message = message.into();
        true
    }
}

#[derive(Clone)]
pub struct QrCoordinator {
    api: Arc<dyn QzoneApi>,
    agent: Arc<CredentialAgent>,
    session: Arc<Mutex<QrSession>>,
    request_lock: Arc<tokio::sync::Mutex<()>>,
    poll_interval: Duration,
    deadline: Duration,
    shutdown: CancellationToken,
}

impl QrCoordinator {
    pub fn new(api: Arc<dyn QzoneApi>, agent: Arc<CredentialAgent>, cfg: &QrConfig, shutdown: CancellationToken) -> Self {
        Self {
            api,
            agent,
            session: Arc::new(Mutex::new(QrSession { generation: 0, status: QrStatus::Idle, message: String::new() })),
            request_lock: Arc::new(tokio::sync::Mutex::new(())),
            poll_interval: cfg.poll_interval,
            deadline: cfg.deadline,
            shutdown,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QrSession> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fetches a fresh challenge, supersedes any running session and starts
    /// polling it. Returns the code so the caller can show the image.
    pub async fn request_qr(&self) -> Result<QrCode, QrError> {
        if self.shutdown.is_cancelled() {
            return Err(QrError::ShuttingDown);
        }
        let _serial = self.request_lock.lock().await;
        let code = self.api.get_qr_code().await?;
        let generation = {
            let mut s = self.lock();
            s.generation += 1;
            s.status = QrStatus::Waiting;
            s.message = "waiting for scan".into();
            s.generation
        };
        info!(generation, "qr login session started");
        let poller = self.clone();
        let polled = code.clone();
        tokio::spawn(async move { poller.poll(generation, polled).await });
        Ok(code)
    }

    pub fn query_status(&self) -> QrStatusView {
        let s = self.lock();
        QrStatusView { status: s.status, message: s.message.clone() }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.lock().generation == generation
    }

    /// Applies `next` only if `generation` still owns the session.
    fn advance(&self, generation: u64, next: QrStatus, message: impl Into<String>) -> bool {
        let mut s = self.lock();
        s.generation == generation && s.advance(next, message)
    }

    async fn poll(&self, generation: u64, code: QrCode) {
        let deadline = Instant::now() + self.deadline;
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
            if !self.is_current(generation) {
                debug!(generation, "qr session superseded");
                return;
            }
            if Instant::now() >= deadline {
                self.advance(generation, QrStatus::Expired, "login timed out");
                info!(generation, "qr login timed out");
                return;
            }
            match self.api.poll_qr_login(&code).await {
                Ok(QrPoll::Waiting) => {}
                Ok(QrPoll::Scanned) => {
                    self.advance(generation, QrStatus::Scanned, "scanned, confirm on the phone");
                }
                Ok(QrPoll::Expired) => {
                    self.advance(generation, QrStatus::Expired, "qr code expired");
                    return;
                }
                Ok(QrPoll::Success { cookie }) => {
                    self.finish(generation, &cookie);
                    return;
                }
                Err(e) => {
                    warn!(generation, error = %e, "qr poll failed");
                    self.advance(generation, QrStatus::Error, e.to_string());
                    return;
                }
            }
        }
    }

    /// Installs the cookie under the QR lock so a newer session cannot
    /// interleave between the generation check and the install.
    fn finish(&self, generation: u64, cookie: &str) {
        let mut s = self.lock();
        if s.generation != generation {
            return;
        }
        // a confirm can arrive before we ever observed the scan
        s.advance(QrStatus::Scanned, "scanned, confirm on the phone");
        match self.agent.update_cookie(cookie) {
            Ok(uin) => {
                s.advance(QrStatus::Success, format!("logged in, UIN={uin}"));
                info!(uin, "qr login succeeded");
            }
            Err(e) => {
                warn!(error = %e, "qr login cookie rejected");
                s.advance(QrStatus::Error, format!("cookie update failed: {e}"));
            }
        }
    }
}
