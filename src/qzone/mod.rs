//! Upstream social-network contract.
//!
//! `QzoneApi` is the raw transport: it is stateless with respect to
//! credentials and takes a `Session` snapshot on every call. The
//! [`SessionClient`] wrapper owns the expiry handling and retries.

use std::fmt;

use async_trait::async_trait;

pub mod client;
pub mod http;

pub use client::SessionClient;
pub use http::{Endpoints, HttpQzone};

/// Cookie installed before any real login so that the client can be built.
pub const BOOTSTRAP_COOKIE: &str = "uin=o0;skey=@bootstrap;p_skey=bootstrap";
const BOOTSTRAP_MARKER: &str = "p_skey=bootstrap";

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum UpstreamError {
    #[error("session expired")]
    SessionExpired,
    #[error("request timed out")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("upstream rejected request (code {code}): {message}")]
    Rejected { code: i64, message: String },
    #[error("unexpected upstream response: {0}")]
    Protocol(String),
}

impl From<reqwest::Error> for UpstreamError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            UpstreamError::Timeout
        } else {
            UpstreamError::Transport(e.to_string())
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CookieError {
    #[error("cookie is empty")]
    Empty,
    #[error("cookie carries no usable uin")]
    MissingUin,
    #[error("cookie carries neither skey nor p_skey")]
    MissingKey,
}

/// Parsed upstream login cookie.
#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    raw: String,
    uin: i64,
    skey: String,
    p_skey: String,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session").field("uin", &self.uin).finish_non_exhaustive()
    }
}

impl Session {
    pub fn parse(raw: &str) -> Result<Self, CookieError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(CookieError::Empty);
        }
        let mut uin = 0;
        let mut skey = String::new();
        let mut p_skey = String::new();
        for (k, v) in cookie_pairs(raw) {
            match k {
                "uin" | "p_uin" if uin == 0 => uin = parse_uin(v),
                "skey" => skey = v.to_string(),
                "p_skey" => p_skey = v.to_string(),
                _ => {}
            }
        }
        if uin <= 0 {
            return Err(CookieError::MissingUin);
        }
        if skey.is_empty() && p_skey.is_empty() {
            return Err(CookieError::MissingKey);
        }
        Ok(Self { raw: raw.to_string(), uin, skey, p_skey })
    }

    pub fn bootstrap() -> Self {
        Self {
            raw: BOOTSTRAP_COOKIE.to_string(),
            uin: 0,
            skey: "@bootstrap".into(),
            p_skey: "bootstrap".into(),
        }
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn uin(&self) -> i64 {
        self.uin
    }

    pub fn skey(&self) -> &str {
        &self.skey
    }

    pub fn p_skey(&self) -> &str {
        &self.p_skey
    }

    pub fn is_logged_in(&self) -> bool {
        self.uin > 0 && !self.raw.contains(BOOTSTRAP_MARKER)
    }

    /// Anti-CSRF token derived from `p_skey` (falling back to `skey`).
    pub fn g_tk(&self) -> i64 {
        let key = if self.p_skey.is_empty() { &self.skey } else { &self.p_skey };
        let mut hash: i64 = 5381;
        for c in key.chars() {
            hash = hash.wrapping_add((hash << 5).wrapping_add(c as i64));
        }
        hash & 0x7fff_ffff
    }
}

/// `k=v` pairs of a cookie header, trimmed, empty keys dropped.
pub fn cookie_pairs(raw: &str) -> impl Iterator<Item = (&str, &str)> {
    raw.split(';').filter_map(|part| {
        let (k, v) = part.split_once('=')?;
        let k = k.trim();
        (!k.is_empty()).then_some((k, v.trim()))
    })
}

/// `o0012345` → 12345.
fn parse_uin(v: &str) -> i64 {
    v.trim_start_matches(['o', 'O']).trim_start_matches('0').parse().unwrap_or(0)
}

#[derive(Clone)]
pub struct QrCode {
    /// PNG bytes to show to the admin.
    pub image: Vec<u8>,
    /// Opaque challenge handle (the upstream `qrsig`).
    pub handle: String,
}

impl fmt::Debug for QrCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QrCode").field("image_len", &self.image.len()).finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QrPoll {
    Waiting,
    Scanned,
    Success { cookie: String },
    Expired,
}

#[async_trait]
pub trait QzoneApi: Send + Sync {
    /// Publishes one timeline entry; returns the external publication id.
    async fn publish(&self, session: &Session, text: &str, images: &[Vec<u8>]) -> Result<String, UpstreamError>;
    /// Cheap authenticated request used to detect silent session death.
    async fn ping(&self, session: &Session) -> Result<(), UpstreamError>;
    async fn get_qr_code(&self) -> Result<QrCode, UpstreamError>;
    async fn poll_qr_login(&self, qr: &QrCode) -> Result<QrPoll, UpstreamError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_uin_and_keys() {
        let s = Session::parse("uin=o0042; skey=@abc; p_skey=xyz; other=1").unwrap();
        assert_eq!(s.uin(), 42);
        assert_eq!(s.skey(), "@abc");
        assert_eq!(s.p_skey(), "xyz");
        assert!(s.is_logged_in());
    }

    #[test]
    fn rejects_cookie_without_keys() {
        assert_eq!(Session::parse("uin=o42"), Err(CookieError::MissingKey));
        assert_eq!(Session::parse("skey=1"), Err(CookieError::MissingUin));
        assert_eq!(Session::parse("  "), Err(CookieError::Empty));
    }

    #[test]
    fn bootstrap_is_not_logged_in() {
        let s = Session::bootstrap();
        assert!(!s.is_logged_in());
        assert_eq!(s.raw(), BOOTSTRAP_COOKIE);
        // a real uin still does not count while the placeholder key is present
        let s = Session::parse("uin=o7;skey=a;p_skey=bootstrap").unwrap();
        assert!(!s.is_logged_in());
    }

    #[test]
    fn g_tk_matches_reference_value() {
        let s = Session::parse("uin=o1;p_skey=abc").unwrap();
        // 5381 -> 177670 -> 5863208 -> 193485963
        assert_eq!(s.g_tk(), 193485963);
    }
}
