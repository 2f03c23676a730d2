//! Moderation Facade: guarded `pending → approved | rejected` transitions.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{info, warn};

use crate::models::{BatchReport, Id, Post, PostStatus, WallStats};
use crate::repo::{PostRepo, RepoError};

#[derive(thiserror::Error, Debug)]
pub enum ModerationError {
    #[error("post {0} not found")]
    NotFound(Id),
    #[error("post {id} is {from}, cannot become {to}")]
    InvalidTransition { id: Id, from: PostStatus, to: PostStatus },
    #[error(transparent)]
    Repo(#[from] RepoError),
}

/// Result of a single moderation call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Applied,
    /// The post was already in the requested state.
    AlreadyDone,
}

#[derive(Clone)]
pub struct Moderation {
    repo: Arc<dyn PostRepo>,
}

impl Moderation {
    pub fn new(repo: Arc<dyn PostRepo>) -> Self {
        Self { repo }
    }

    pub fn repo(&self) -> &Arc<dyn PostRepo> {
        &self.repo
    }

    pub async fn approve(&self, id: Id) -> Result<Outcome, ModerationError> {
        self.transition(id, PostStatus::Approved, "").await
    }

    pub async fn reject(&self, id: Id, reason: &str) -> Result<Outcome, ModerationError> {
        self.transition(id, PostStatus::Rejected, reason).await
    }

    pub async fn batch_approve(&self, ids: &[Id]) -> Result<BatchReport, ModerationError> {
        self.batch(ids, PostStatus::Approved, "").await
    }

    pub async fn batch_reject(&self, ids: &[Id], reason: &str) -> Result<BatchReport, ModerationError> {
        self.batch(ids, PostStatus::Rejected, reason).await
    }

    /// Compare-and-set from `pending`. Losing the race to an identical
    /// transition is reported as `AlreadyDone`, any other loser as an error.
    async fn transition(&self, id: Id, to: PostStatus, reason: &str) -> Result<Outcome, ModerationError> {
        let post = self.repo.get(id).await?.ok_or(ModerationError::NotFound(id))?;
        if post.status == to {
            return Ok(Outcome::AlreadyDone);
        }
        if !post.status.can_transition_to(to) || post.status != PostStatus::Pending {
            warn!(post_id = id, from = %post.status, to = %to, "refused moderation transition");
            return Err(ModerationError::InvalidTransition { id, from: post.status, to });
        }

        let mut next = post;
        next.status = to;
        next.reason = if to == PostStatus::Rejected { reason.to_string() } else { String::new() };
        if self.repo.save_if(&mut next, PostStatus::Pending, "").await? {
            info!(post_id = id, status = %to, "post moderated");
            return Ok(Outcome::Applied);
        }

        let current = self.repo.get(id).await?.ok_or(ModerationError::NotFound(id))?;
        if current.status == to {
            Ok(Outcome::AlreadyDone)
        } else {
            Err(ModerationError::InvalidTransition { id, from: current.status, to })
        }
    }

    async fn batch(&self, ids: &[Id], to: PostStatus, reason: &str) -> Result<BatchReport, ModerationError> {
        let mut seen = HashSet::with_capacity(ids.len());
        let unique: Vec<Id> = ids.iter().copied().filter(|id| seen.insert(*id)).collect();

        let mut report = BatchReport::default();
        let eligible: Vec<Id> = self
            .repo
            .get_many(&unique)
            .await?
            .into_iter()
            .filter(|p| p.status == PostStatus::Pending)
            .map(|p| p.id)
            .collect();
        report.skipped = unique.len() - eligible.len();

        for id in eligible {
            match self.transition(id, to, reason).await {
                Ok(Outcome::Applied) => report.applied += 1,
                Ok(Outcome::AlreadyDone) | Err(ModerationError::InvalidTransition { .. }) | Err(ModerationError::NotFound(_)) => {
                    report.skipped += 1
                }
                Err(e) => return Err(e),
            }
        }
        info!(status = %to, applied = report.applied, skipped = report.skipped, "batch moderation");
        Ok(report)
    }

    pub async fn get(&self, id: Id) -> Result<Post, ModerationError> {
        self.repo.get(id).await?.ok_or(ModerationError::NotFound(id))
    }

    pub async fn list(&self, status: PostStatus) -> Result<Vec<Post>, ModerationError> {
        Ok(self.repo.list_by_status(status).await?)
    }

    pub async fn stats(&self) -> Result<WallStats, ModerationError> {
        Ok(WallStats {
            pending: self.repo.count_by_status(PostStatus::Pending).await?,
            approved: self.repo.count_by_status(PostStatus::Approved).await?,
            rejected: self.repo.count_by_status(PostStatus::Rejected).await?,
            failed: self.repo.count_by_status(PostStatus::Failed).await?,
            published: self.repo.count_by_status(PostStatus::Published).await?,
            total: self.repo.count_all().await?,
        })
    }
}
