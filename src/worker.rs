//! Batch Publisher Worker.
//!
//! Every tick drains up to `batch_max` approved posts, renders each one,
//! claims the survivors and publishes them as a single timeline entry.
//!
//! ```text
//! get_approved ─► publish_delay filter ─► PublishGate
//!      ─► render (per-post failures recorded, post excluded)
//!      ─► claim   (update_if approved/"" → published/"claim:<uuid>")
//!      ─► publish (SessionClient, refresh + retry on expiry)
//!      ─► commit  (claim marker → real tid)   | rollback (→ approved or failed)
//! ```
//!
//! The claim is the lock point: whichever worker wins the compare-and-set
//! owns the post until commit or rollback. A crash in between leaves the
//! marker behind; [`Publisher::start`] releases such claims before the
//! workers begin.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use futures_util::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::WorkerConfig;
use crate::models::{truncate_runes, Id, Post, PostStatus, CLAIM_PREFIX};
use crate::qzone::SessionClient;
use crate::rate_limit::PublishGate;
use crate::render::{ImageResolver, Renderer};
use crate::repo::{Change, PostRepo, RepoError};

const SUMMARY_RULE: &str = "----------------";
const SUMMARY_PREFIX_RUNES: usize = 20;

/// What a single tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// No eligible posts.
    Idle,
    /// Candidates existed but none survived rendering and claiming.
    Nothing,
    Published { tid: String, posts: Vec<Id> },
    Failed { posts: Vec<Id>, error: String },
    /// Shutdown observed before the claim.
    Aborted,
}

pub struct Publisher {
    repo: Arc<dyn PostRepo>,
    client: SessionClient,
    renderer: Arc<dyn Renderer>,
    resolver: ImageResolver,
    gate: PublishGate,
    cfg: WorkerConfig,
    publish_delay: Duration,
    /// Consecutive failed publishes across all workers.
    failures: AtomicU32,
}

impl Publisher {
    pub fn new(
        repo: Arc<dyn PostRepo>,
        client: SessionClient,
        renderer: Arc<dyn Renderer>,
        resolver: ImageResolver,
        cfg: WorkerConfig,
        publish_delay: Duration,
    ) -> Self {
        Self {
            repo,
            client,
            renderer,
            resolver,
            gate: PublishGate::new(cfg.rate_limit),
            cfg,
            publish_delay,
            failures: AtomicU32::new(0),
        }
    }

    /// Releases stale claims, then spawns `cfg.workers` loops.
    pub async fn start(self: Arc<Self>, shutdown: &CancellationToken) -> Result<PublisherHandle, RepoError> {
        let released = self.repo.release_claims().await?;
        if released > 0 {
            warn!(count = released, "returned unconfirmed claims to approved");
        }
        let token = shutdown.child_token();
        let tasks = (0..self.cfg.workers.max(1))
            .map(|worker| {
                let this = Arc::clone(&self);
                let token = token.clone();
                tokio::spawn(async move { this.run(worker, token).await })
            })
            .collect();
        info!(workers = self.cfg.workers, batch_max = self.cfg.batch_max, "publisher started");
        Ok(PublisherHandle { shutdown: token, tasks, grace: self.cfg.shutdown_grace })
    }

    async fn run(self: Arc<Self>, worker: usize, shutdown: CancellationToken) {
        debug!(worker, "publish worker running");
        while !shutdown.is_cancelled() {
            let pause = match self.tick(&shutdown).await {
                Ok(TickOutcome::Idle) => self.cfg.poll_interval,
                Ok(TickOutcome::Nothing) => self.cfg.retry_delay,
                Ok(TickOutcome::Published { .. }) => Duration::ZERO,
                Ok(TickOutcome::Failed { .. }) => self.backoff(self.failures.load(Ordering::SeqCst)),
                Ok(TickOutcome::Aborted) => break,
                Err(e) => {
                    error!(worker, error = %e, "publish tick failed");
                    self.cfg.poll_interval
                }
            };
            if pause.is_zero() {
                continue;
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }
        debug!(worker, "publish worker stopped");
    }

    /// `retry_delay * 2^(n-1)`, capped by `max_retry_delay`.
    pub fn backoff(&self, consecutive_failures: u32) -> Duration {
        let factor = 1u32.checked_shl(consecutive_failures.saturating_sub(1)).unwrap_or(u32::MAX);
        self.cfg.retry_delay.saturating_mul(factor).min(self.cfg.max_retry_delay)
    }

    /// One poll → render → claim → publish → commit/rollback cycle.
    pub async fn tick(&self, shutdown: &CancellationToken) -> Result<TickOutcome, RepoError> {
        let now = Utc::now();
        let ready: Vec<Post> = self
            .repo
            .get_approved(self.cfg.batch_max)
            .await?
            .into_iter()
            .filter(|p| self.is_due(p, now))
            .collect();
        if ready.is_empty() {
            return Ok(TickOutcome::Idle);
        }
        if !self.gate.acquire(shutdown).await {
            return Ok(TickOutcome::Aborted);
        }

        let mut rendered = Vec::with_capacity(ready.len());
        for post in ready {
            match self.renderer.render_post(&self.resolver.resolve_post(&post)).await {
                Ok(bytes) => rendered.push((post, bytes)),
                Err(e) => self.record_render_failure(post, &e.to_string()).await?,
            }
        }
        if shutdown.is_cancelled() {
            return Ok(TickOutcome::Aborted);
        }

        let token = format!("{CLAIM_PREFIX}{}", Uuid::new_v4());
        let (claimed, images) = self.claim(rendered, &token).await?;
        if claimed.is_empty() {
            return Ok(TickOutcome::Nothing);
        }
        let ids: Vec<Id> = claimed.iter().map(|p| p.id).collect();
        let summary = build_summary(&claimed, Local::now());
        info!(posts = ?ids, "publishing batch");

        match self.client.publish(&summary, &images).await {
            Ok(tid) => {
                self.failures.store(0, Ordering::SeqCst);
                self.commit(claimed, &token, &tid).await;
                info!(tid = %tid, posts = ?ids, "batch published");
                Ok(TickOutcome::Published { tid, posts: ids })
            }
            Err(e) => {
                let n = self.failures.fetch_add(1, Ordering::SeqCst) + 1;
                warn!(error = %e, posts = ?ids, consecutive = n, "publish failed");
                self.rollback(claimed, &token, &e.to_string()).await;
                Ok(TickOutcome::Failed { posts: ids, error: e.to_string() })
            }
        }
    }

    fn is_due(&self, post: &Post, now: DateTime<Utc>) -> bool {
        if self.publish_delay.is_zero() {
            return true;
        }
        now.signed_duration_since(post.updated_at)
            .to_std()
            .map(|age| age >= self.publish_delay)
            .unwrap_or(false)
    }

    /// Counts a render failure against the post; stays approved until the
    /// budget runs out.
    async fn record_render_failure(&self, post: Post, error: &str) -> Result<(), RepoError> {
        let max = self.cfg.retry_count;
        let charged = self
            .repo
            .update_if(post.id, PostStatus::Approved, "", &|p: &mut Post| charge(p, max, "render", error))
            .await;
        match charged {
            Ok(Some(p)) => warn!(post_id = p.id, retries = p.retry_count, error, "render failed"),
            Ok(None) | Err(RepoError::NotFound) => debug!(post_id = post.id, "render failure on a post that moved on"),
            Err(e) => return Err(e),
        }
        Ok(())
    }

    /// Moves each rendered post to a claim marker. The claimed copies are
    /// read back from the store, so later bookkeeping starts from current
    /// counters.
    async fn claim(&self, rendered: Vec<(Post, Vec<u8>)>, token: &str) -> Result<(Vec<Post>, Vec<Vec<u8>>), RepoError> {
        let mut claimed = Vec::with_capacity(rendered.len());
        let mut images = Vec::with_capacity(rendered.len());
        let mark = |p: &mut Post| {
            p.status = PostStatus::Published;
            p.tid = token.to_string();
        };
        for (post, bytes) in rendered {
            match self.repo.update_if(post.id, PostStatus::Approved, "", &mark).await {
                Ok(Some(current)) => {
                    claimed.push(current);
                    images.push(bytes);
                }
                Ok(None) | Err(RepoError::NotFound) => debug!(post_id = post.id, "claim lost"),
                Err(e) => {
                    self.release(claimed, token).await;
                    return Err(e);
                }
            }
        }
        Ok((claimed, images))
    }

    async fn commit(&self, claimed: Vec<Post>, token: &str, tid: &str) {
        let done = |p: &mut Post| {
            p.tid = tid.to_string();
            p.last_error.clear();
        };
        for post in claimed {
            if let Err(e) = self.update_claimed(post.id, token, &done).await {
                error!(post_id = post.id, tid, error = %e, "cannot record publication id");
            }
        }
    }

    async fn rollback(&self, claimed: Vec<Post>, token: &str, error: &str) {
        let max = self.cfg.retry_count;
        let undo = |p: &mut Post| {
            p.status = PostStatus::Approved;
            p.tid.clear();
            charge(p, max, "publish", error);
        };
        for post in claimed {
            match self.update_claimed(post.id, token, &undo).await {
                Ok(p) if p.status == PostStatus::Failed => warn!(post_id = p.id, "post failed permanently"),
                Ok(_) => {}
                Err(e) => error!(post_id = post.id, error = %e, "cannot roll back claim"),
            }
        }
    }

    /// Undo claims without charging the retry budget.
    async fn release(&self, claimed: Vec<Post>, token: &str) {
        let undo = |p: &mut Post| {
            p.status = PostStatus::Approved;
            p.tid.clear();
        };
        for post in claimed {
            if let Err(e) = self.update_claimed(post.id, token, &undo).await {
                error!(post_id = post.id, error = %e, "cannot release claim");
            }
        }
    }

    async fn update_claimed(&self, id: Id, token: &str, change: &Change<'_>) -> Result<Post, RepoError> {
        self.repo.update_if(id, PostStatus::Published, token, change).await?.ok_or(RepoError::Conflict)
    }
}

/// Charges one failed attempt; past the budget the post becomes `failed`.
fn charge(post: &mut Post, max: u32, stage: &str, error: &str) {
    post.retry_count += 1;
    post.last_error = error.to_string();
    if post.retry_count > max {
        post.status = PostStatus::Failed;
        post.reason = format!("{stage} exceeded retries: {error}");
    }
}

/// Text body of one publication: header, one line per post, footer.
pub fn build_summary(posts: &[Post], when: DateTime<Local>) -> String {
    let mut out = format!("【Wall Update】{}\n{SUMMARY_RULE}\n", when.format("%m/%d"));
    for post in posts {
        let line = if post.text.is_empty() {
            "[image]".to_string()
        } else {
            truncate_runes(&post.text, SUMMARY_PREFIX_RUNES, "...")
        };
        out.push_str(&format!("#{}: {}\n", post.id, line));
    }
    out.push_str(SUMMARY_RULE);
    out.push_str("\nsee images below 👇");
    out
}

/// Running worker set.
pub struct PublisherHandle {
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    grace: Duration,
}

impl PublisherHandle {
    /// Signals every worker and waits up to the grace period; stragglers
    /// are aborted, leaving any claim for the next startup sweep.
    pub async fn stop(self) {
        self.shutdown.cancel();
        let aborts: Vec<_> = self.tasks.iter().map(|t| t.abort_handle()).collect();
        if tokio::time::timeout(self.grace, join_all(self.tasks)).await.is_err() {
            warn!(grace = ?self.grace, "publish workers did not stop in time, aborting");
            for a in aborts {
                a.abort();
            }
        }
        info!("publisher stopped");
    }
}
