use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub type Id = i64;

/// Prefix of the external id written while a worker holds a claim on a post.
pub const CLAIM_PREFIX: &str = "claim:";

const ANON_LABEL: &str = "anonymous";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum PostStatus {
    Pending,
    Approved,
    Rejected,
    Failed,
    Published,
}

impl PostStatus {
    pub const ALL: [PostStatus; 5] = [
        PostStatus::Pending,
        PostStatus::Approved,
        PostStatus::Rejected,
        PostStatus::Failed,
        PostStatus::Published,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PostStatus::Pending => "pending",
            PostStatus::Approved => "approved",
            PostStatus::Rejected => "rejected",
            PostStatus::Failed => "failed",
            PostStatus::Published => "published",
        }
    }

    /// Rejected and published posts never move again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, PostStatus::Rejected | PostStatus::Published)
    }

    /// Transitions the pipeline may perform. A claimed post (published with a
    /// claim marker) counts as approved until the upstream confirms it.
    pub fn can_transition_to(&self, next: PostStatus) -> bool {
        use PostStatus::*;
        matches!(
            (self, next),
            (Pending, Approved)
                | (Pending, Rejected)
                | (Approved, Approved)
                | (Approved, Published)
                | (Approved, Failed)
        )
    }
}

impl fmt::Display for PostStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown post status `{0}`")]
pub struct UnknownStatus(pub String);

impl FromStr for PostStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PostStatus::Pending),
            "approved" => Ok(PostStatus::Approved),
            "rejected" => Ok(PostStatus::Rejected),
            "failed" => Ok(PostStatus::Failed),
            "published" => Ok(PostStatus::Published),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Post {
    pub id: Id,
    /// Author account on the chat network, 0 when unknown.
    pub uin: i64,
    pub name: String,
    /// Chat group the submission came from, 0 for the web form.
    pub group_id: i64,
    pub text: String,
    /// Either absolute `http…` URLs or `/uploads/<file>` paths.
    pub images: Vec<String>,
    pub anon: bool,
    pub status: PostStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    /// External publication id; a `claim:` marker while a publish is in flight.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tid: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub avatar_url: String,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_error: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Post {
    /// Fresh pending post; the store assigns `id` on first save.
    pub fn new(new: NewPost) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            uin: new.uin,
            name: new.name,
            group_id: new.group_id,
            text: new.text,
            images: new.images,
            anon: new.anon,
            status: PostStatus::Pending,
            reason: String::new(),
            tid: String::new(),
            avatar_url: new.avatar_url.unwrap_or_default(),
            retry_count: 0,
            last_error: String::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_claimed(&self) -> bool {
        self.status == PostStatus::Published && self.tid.starts_with(CLAIM_PREFIX)
    }

    pub fn show_name(&self) -> String {
        if self.anon {
            return ANON_LABEL.to_string();
        }
        if self.uin > 0 {
            return format!("{} ({})", self.name, self.uin);
        }
        self.name.clone()
    }

    pub fn avatar(&self) -> Option<String> {
        if !self.avatar_url.is_empty() {
            return Some(self.avatar_url.clone());
        }
        if self.uin > 0 {
            return Some(format!("https://q1.qlogo.cn/g?b=qq&nk={}&s=640", self.uin));
        }
        None
    }

    /// Short multi-line description used by chat surfaces and logs.
    pub fn summary(&self) -> String {
        let when = self.created_at.with_timezone(&Local).format("%m-%d %H:%M");
        let mut out = format!("#{} {} [{}] {}\n", self.id, self.show_name(), self.status, when);
        if !self.text.is_empty() {
            out.push_str(&truncate_runes(&self.text, 60, "..."));
            out.push('\n');
        }
        if !self.images.is_empty() {
            out.push_str(&format!("[{} images]", self.images.len()));
        }
        out
    }
}

/// Cuts `text` to at most `max` chars, appending `tail` only when something was cut.
pub fn truncate_runes(text: &str, max: usize, tail: &str) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}{}", &text[..idx], tail),
        None => text.to_string(),
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct NewPost {
    #[serde(default)]
    pub uin: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub group_id: i64,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub images: Vec<String>,
    #[serde(default)]
    pub anon: bool,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum QrStatus {
    Idle,
    Waiting,
    Scanned,
    Success,
    Expired,
    Error,
}

impl QrStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, QrStatus::Success | QrStatus::Expired | QrStatus::Error)
    }

    /// Forward-only progress within one QR session.
    pub fn can_advance_to(&self, next: QrStatus) -> bool {
        use QrStatus::*;
        match (self, next) {
            (_, Error) => !self.is_terminal(),
            (Waiting, Scanned) | (Waiting, Expired) => true,
            (Scanned, Success) | (Scanned, Expired) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct QrStatusView {
    pub status: QrStatus,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CredentialView {
    pub logged_in: bool,
    pub uin: i64,
    pub last_refresh: Option<DateTime<Utc>>,
    pub refreshing: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct BatchReport {
    pub applied: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct WallStats {
    pub pending: i64,
    pub approved: i64,
    pub rejected: i64,
    pub failed: i64,
    pub published: i64,
    pub total: i64,
}
