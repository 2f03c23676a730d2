//! Credential Agent: sole owner of the upstream login cookie.
//!
//! Readers take an `Arc<Session>` snapshot, so a cookie swap is never seen
//! half-applied. Every install bumps a generation counter; expiry handling
//! compares generations so that a burst of concurrent "session expired"
//! reports collapses into a single refresh behind `refresh_gate`.

use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::bot::BotConnection;
use crate::models::CredentialView;
use crate::qzone::{CookieError, Session};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CredentialError {
    #[error("invalid cookie: {0}")]
    Cookie(#[from] CookieError),
    #[error("cookie belongs to account {got}, but the wall is locked to {expected}")]
    UinLocked { expected: i64, got: i64 },
    #[error("no bot produced a usable cookie; scan a QR code to log in")]
    NoCookieSource,
}

struct State {
    session: Arc<Session>,
    generation: u64,
    refreshed_at: Option<DateTime<Utc>>,
    refreshing: bool,
}

pub struct CredentialAgent {
    state: RwLock<State>,
    refresh_gate: Mutex<()>,
    bots: Vec<Arc<dyn BotConnection>>,
    cookie_domain: String,
    lock_uin: bool,
}

/// Clears the `refreshing` flag however the refresh ends.
struct RefreshingFlag<'a>(&'a CredentialAgent);

impl<'a> RefreshingFlag<'a> {
    fn raise(agent: &'a CredentialAgent) -> Self {
        agent.write().refreshing = true;
        Self(agent)
    }
}

impl Drop for RefreshingFlag<'_> {
    fn drop(&mut self) {
        self.0.write().refreshing = false;
    }
}

impl CredentialAgent {
    pub fn new(initial: Session, bots: Vec<Arc<dyn BotConnection>>, cookie_domain: impl Into<String>) -> Self {
        let refreshed_at = initial.is_logged_in().then(Utc::now);
        Self {
            state: RwLock::new(State { session: Arc::new(initial), generation: 0, refreshed_at, refreshing: false }),
            refresh_gate: Mutex::new(()),
            bots,
            cookie_domain: cookie_domain.into(),
            lock_uin: false,
        }
    }

    /// Rejects cookies of a different account once a real one is installed.
    pub fn with_uin_lock(mut self, lock: bool) -> Self {
        self.lock_uin = lock;
        self
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn session(&self) -> Arc<Session> {
        self.read().session.clone()
    }

    /// Monotonic counter bumped by every successful install.
    pub fn generation(&self) -> u64 {
        self.read().generation
    }

    pub fn uin(&self) -> i64 {
        self.read().session.uin()
    }

    pub fn cookie_raw(&self) -> String {
        self.read().session.raw().to_string()
    }

    pub fn is_logged_in(&self) -> bool {
        self.read().session.is_logged_in()
    }

    pub fn view(&self) -> CredentialView {
        let st = self.read();
        CredentialView {
            logged_in: st.session.is_logged_in(),
            uin: st.session.uin(),
            last_refresh: st.refreshed_at,
            refreshing: st.refreshing,
        }
    }

    /// Validates and installs `raw`, returning the account it belongs to.
    pub fn update_cookie(&self, raw: &str) -> Result<i64, CredentialError> {
        let session = Session::parse(raw)?;
        let uin = session.uin();
        let mut st = self.write();
        let previous = st.session.uin();
        if st.session.is_logged_in() && previous != uin {
            if self.lock_uin {
                warn!(expected = previous, got = uin, "refusing cookie for a different account");
                return Err(CredentialError::UinLocked { expected: previous, got: uin });
            }
            warn!(previous, uin, "publishing account switched");
        }
        st.session = Arc::new(session);
        st.generation += 1;
        st.refreshed_at = Some(Utc::now());
        info!(uin, generation = st.generation, "cookie installed");
        Ok(uin)
    }

    /// Installs the first usable cookie offered by a connected bot.
    pub async fn refresh_from_bot(&self) -> Result<i64, CredentialError> {
        let _gate = self.refresh_gate.lock().await;
        self.refresh_locked().await
    }

    /// Expiry hook for upstream callers. `seen` is the generation the caller
    /// used; if a newer cookie was installed meanwhile this returns at once.
    pub async fn on_session_expired(&self, seen: u64) -> Result<(), CredentialError> {
        let _gate = self.refresh_gate.lock().await;
        if self.generation() != seen {
            return Ok(());
        }
        warn!(generation = seen, "upstream session expired, refreshing");
        self.refresh_locked().await.map(|_| ())
    }

    async fn refresh_locked(&self) -> Result<i64, CredentialError> {
        let _flag = RefreshingFlag::raise(self);
        for bot in &self.bots {
            let raw = match bot.get_cookies(&self.cookie_domain).await {
                Ok(raw) => raw,
                Err(e) => {
                    warn!(bot = bot.id(), error = %e, "bot cookie fetch failed");
                    continue;
                }
            };
            match self.update_cookie(&raw) {
                Ok(uin) => {
                    info!(bot = bot.id(), uin, "session refreshed from bot");
                    return Ok(uin);
                }
                Err(e) => warn!(bot = bot.id(), error = %e, "bot cookie rejected"),
            }
        }
        error!("session refresh failed: no bot cookie available, an admin must scan a QR code");
        Err(CredentialError::NoCookieSource)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_bumps_generation_and_snapshots_are_stable() {
        let agent = CredentialAgent::new(Session::bootstrap(), vec![], "qzone.qq.com");
        assert!(!agent.is_logged_in());
        let before = agent.session();
        assert_eq!(agent.update_cookie("uin=o42;skey=X").unwrap(), 42);
        assert_eq!(agent.generation(), 1);
        assert_eq!(agent.uin(), 42);
        assert!(agent.is_logged_in());
        // old snapshot is untouched
        assert_eq!(before.uin(), 0);
    }

    #[test]
    fn invalid_cookie_leaves_state_alone() {
        let agent = CredentialAgent::new(Session::bootstrap(), vec![], "qzone.qq.com");
        assert!(agent.update_cookie("garbage").is_err());
        assert_eq!(agent.generation(), 0);
        assert_eq!(agent.cookie_raw(), crate::qzone::BOOTSTRAP_COOKIE);
    }

    #[test]
    fn uin_lock_refuses_account_switch() {
        let agent = CredentialAgent::new(Session::bootstrap(), vec![], "qzone.qq.com").with_uin_lock(true);
        agent.update_cookie("uin=o1;skey=a").unwrap();
        assert_eq!(
            agent.update_cookie("uin=o2;skey=b"),
            Err(CredentialError::UinLocked { expected: 1, got: 2 })
        );
        assert_eq!(agent.update_cookie("uin=o1;skey=c").unwrap(), 1);
    }

    #[tokio::test]
    async fn stale_expiry_report_is_ignored() {
        let agent = CredentialAgent::new(Session::bootstrap(), vec![], "qzone.qq.com");
        agent.update_cookie("uin=o5;skey=a").unwrap();
        // reported against generation 0, but generation 1 is already installed
        assert!(agent.on_session_expired(0).await.is_ok());
        assert_eq!(agent.on_session_expired(1).await, Err(CredentialError::NoCookieSource));
        assert!(!agent.view().refreshing);
    }
}
