#![allow(dead_code)]

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use qzwall::bot::{BotConnection, BotError};
use qzwall::config::WorkerConfig;
use qzwall::credential::CredentialAgent;
use qzwall::models::{Id, NewPost, Post, PostStatus};
use qzwall::qzone::{QrCode, QrPoll, QzoneApi, Session, SessionClient, UpstreamError};
use qzwall::render::{ImageResolver, RenderError, Renderer};
use qzwall::repo::PostRepo;
use qzwall::worker::Publisher;

pub const COOKIE: &str = "uin=o10001;skey=@first;p_skey=first";
pub const FRESH_COOKIE: &str = "uin=o10001;skey=@fresh;p_skey=fresh";

/// One recorded `publish` call.
#[derive(Debug, Clone)]
pub struct PublishCall {
    pub uin: i64,
    pub skey: String,
    pub text: String,
    pub images: Vec<Vec<u8>>,
}

/// Scriptable upstream. Unscripted publishes succeed with `T1`, `T2`, ...;
/// unscripted QR polls report `Waiting`.
#[derive(Default)]
pub struct FakeUpstream {
    publish_script: Mutex<VecDeque<Result<String, UpstreamError>>>,
    pub calls: Mutex<Vec<PublishCall>>,
    published: AtomicUsize,
    ping_result: Mutex<Option<UpstreamError>>,
    pub pings: AtomicUsize,
    qr_script: Mutex<VecDeque<Result<QrPoll, UpstreamError>>>,
    qr_issued: AtomicUsize,
    pub polls: AtomicUsize,
}

impl FakeUpstream {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script_publish(&self, results: impl IntoIterator<Item = Result<String, UpstreamError>>) {
        self.publish_script.lock().unwrap().extend(results);
    }

    pub fn script_qr(&self, results: impl IntoIterator<Item = Result<QrPoll, UpstreamError>>) {
        self.qr_script.lock().unwrap().extend(results);
    }

    pub fn fail_pings(&self, error: Option<UpstreamError>) {
        *self.ping_result.lock().unwrap() = error;
    }

    pub fn calls(&self) -> Vec<PublishCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl QzoneApi for FakeUpstream {
    async fn publish(&self, session: &Session, text: &str, images: &[Vec<u8>]) -> Result<String, UpstreamError> {
        self.calls.lock().unwrap().push(PublishCall {
            uin: session.uin(),
            skey: session.skey().to_string(),
            text: text.to_string(),
            images: images.to_vec(),
        });
        let scripted = self.publish_script.lock().unwrap().pop_front();
        match scripted {
            Some(result) => result,
            None => Ok(format!("T{}", self.published.fetch_add(1, Ordering::SeqCst) + 1)),
        }
    }

    async fn ping(&self, _session: &Session) -> Result<(), UpstreamError> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        match self.ping_result.lock().unwrap().clone() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn get_qr_code(&self) -> Result<QrCode, UpstreamError> {
        let n = self.qr_issued.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(QrCode { image: vec![0x89, b'P', b'N', b'G'], handle: format!("sig-{n}") })
    }

    async fn poll_qr_login(&self, _qr: &QrCode) -> Result<QrPoll, UpstreamError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        self.qr_script.lock().unwrap().pop_front().unwrap_or(Ok(QrPoll::Waiting))
    }
}

/// Renders every post as `b"X"` except the ids told to fail.
#[derive(Default)]
pub struct FakeRenderer {
    failing: Mutex<HashSet<Id>>,
    delay: Duration,
}

impl FakeRenderer {
    pub fn failing(ids: &[Id]) -> Arc<Self> {
        Arc::new(Self { failing: Mutex::new(ids.iter().copied().collect()), delay: Duration::ZERO })
    }

    /// Sleeps before answering, letting concurrent ticks interleave.
    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self { failing: Mutex::default(), delay })
    }

    pub fn heal(&self, id: Id) {
        self.failing.lock().unwrap().remove(&id);
    }
}

#[async_trait]
impl Renderer for FakeRenderer {
    async fn render_post(&self, post: &Post) -> Result<Vec<u8>, RenderError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.failing.lock().unwrap().contains(&post.id) {
            return Err(RenderError::Load { reference: format!("post {}", post.id), message: "broken image".into() });
        }
        Ok(b"X".to_vec())
    }
}

pub struct FakeBot {
    id: i64,
    cookie: Result<String, BotError>,
    delay: Duration,
    pub calls: AtomicUsize,
}

impl FakeBot {
    pub fn with_cookie(id: i64, cookie: &str) -> Arc<Self> {
        Arc::new(Self { id, cookie: Ok(cookie.to_string()), delay: Duration::ZERO, calls: AtomicUsize::new(0) })
    }

    pub fn failing(id: i64) -> Arc<Self> {
        Arc::new(Self {
            id,
            cookie: Err(BotError::Api { retcode: 100, message: "not logged in".into() }),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn slow(id: i64, cookie: &str, delay: Duration) -> Arc<Self> {
        Arc::new(Self { id, cookie: Ok(cookie.to_string()), delay, calls: AtomicUsize::new(0) })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BotConnection for FakeBot {
    fn id(&self) -> i64 {
        self.id
    }

    async fn get_cookies(&self, _domain: &str) -> Result<String, BotError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.cookie.clone()
    }
}

pub fn agent(cookie: Option<&str>, bots: Vec<Arc<dyn BotConnection>>) -> Arc<CredentialAgent> {
    let initial = match cookie {
        Some(c) => Session::parse(c).unwrap(),
        None => Session::bootstrap(),
    };
    Arc::new(CredentialAgent::new(initial, bots, "user.qzone.qq.com"))
}

/// Fast worker settings: no publish spacing, short pauses.
pub fn worker_cfg() -> WorkerConfig {
    WorkerConfig {
        workers: 1,
        retry_count: 3,
        retry_delay: Duration::from_millis(10),
        max_retry_delay: Duration::from_millis(40),
        rate_limit: Duration::ZERO,
        poll_interval: Duration::from_millis(10),
        batch_max: 9,
        shutdown_grace: Duration::from_secs(2),
    }
}

pub fn publisher(
    repo: Arc<dyn PostRepo>,
    api: Arc<FakeUpstream>,
    agent: Arc<CredentialAgent>,
    renderer: Arc<FakeRenderer>,
    cfg: WorkerConfig,
) -> Arc<Publisher> {
    let client = SessionClient::new(api, agent, 2, Duration::from_secs(5));
    Arc::new(Publisher::new(repo, client, renderer, ImageResolver::new("/tmp/qzwall-test-uploads", ""), cfg, Duration::ZERO))
}

pub async fn submit(repo: &dyn PostRepo, text: &str) -> Post {
    let mut post = Post::new(NewPost { uin: 20002, name: "alice".into(), text: text.into(), ..Default::default() });
    repo.save(&mut post).await.unwrap();
    post
}

pub async fn submit_approved(repo: &dyn PostRepo, text: &str) -> Post {
    let mut post = submit(repo, text).await;
    post.status = PostStatus::Approved;
    repo.save(&mut post).await.unwrap();
    post
}

/// P1 and P2 over every stored post.
pub async fn assert_store_invariants(repo: &dyn PostRepo) {
    for status in PostStatus::ALL {
        for p in repo.list_by_status(status).await.unwrap() {
            assert_eq!(p.status == PostStatus::Published, !p.tid.is_empty(), "publication id mismatch on {p:?}");
            if !p.reason.is_empty() {
                assert!(matches!(p.status, PostStatus::Rejected | PostStatus::Failed), "stray reason on {p:?}");
            }
        }
    }
}
