use async_trait::async_trait;
use chrono::Utc;

use crate::models::*;

#[derive(thiserror::Error, Debug)]
pub enum RepoError {
    #[error("not found")] NotFound,
    #[error("conflict")] Conflict,
    #[error("storage error: {0}")] Internal(String),
}

pub type RepoResult<T> = Result<T, RepoError>;

/// In-place edit applied by [`PostRepo::update_if`].
pub type Change<'a> = dyn Fn(&mut Post) + Send + Sync + 'a;

/// Durable post log with an indexed status column.
///
/// Every write bumps `updated_at` and is persisted before the call returns.
/// `save_if` is the pipeline's lock point: it writes only when the stored
/// row still carries the expected status and external id.
#[async_trait]
pub trait PostRepo: Send + Sync {
    /// Inserts when `post.id == 0` (assigning the id), otherwise updates.
    async fn save(&self, post: &mut Post) -> RepoResult<()>;
    async fn save_if(&self, post: &mut Post, status: PostStatus, tid: &str) -> RepoResult<bool>;
    /// Applies `change` to the stored row while it still carries `status`
    /// and `tid`, so counters are bumped on current data rather than on an
    /// earlier read. Returns the written post, or `None` when the guard no
    /// longer holds.
    async fn update_if(&self, id: Id, status: PostStatus, tid: &str, change: &Change<'_>) -> RepoResult<Option<Post>>;
    async fn get(&self, id: Id) -> RepoResult<Option<Post>>;
    /// FIFO by id.
    async fn list_by_status(&self, status: PostStatus) -> RepoResult<Vec<Post>>;
    /// Approved posts without an external id, FIFO by id.
    async fn get_approved(&self, limit: usize) -> RepoResult<Vec<Post>>;
    /// Known posts among `ids`, ascending by id; unknown ids are omitted.
    async fn get_many(&self, ids: &[Id]) -> RepoResult<Vec<Post>>;
    async fn count_by_status(&self, status: PostStatus) -> RepoResult<i64>;
    async fn count_all(&self) -> RepoResult<i64>;
    /// Returns posts still holding a claim marker to `approved`.
    async fn release_claims(&self) -> RepoResult<u64>;
}

pub mod inmem {
    use super::*;
    use serde::{Deserialize, Serialize};
    use std::collections::BTreeMap;
    use std::path::{Path, PathBuf};
    use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
    use tracing::{info, warn};

    #[derive(Default, Serialize, Deserialize)]
    struct State {
        posts: BTreeMap<Id, Post>,
        next_id: Id,
    }

    /// In-process store, optionally mirrored to a JSON snapshot after each write.
    #[derive(Clone, Default)]
    pub struct InMemRepo {
        state: Arc<RwLock<State>>,
        snapshot_path: Option<Arc<PathBuf>>,
    }

    impl InMemRepo {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_snapshot(path: impl Into<PathBuf>) -> RepoResult<Self> {
            let path = path.into();
            let state = Self::load_state_from(&path)?;
            Ok(Self {
                state: Arc::new(RwLock::new(state)),
                snapshot_path: Some(Arc::new(path)),
            })
        }

        fn load_state_from(path: &Path) -> RepoResult<State> {
            match std::fs::read(path) {
                Ok(bytes) => {
                    let state: State = serde_json::from_slice(&bytes)
                        .map_err(|e| RepoError::Internal(format!("parse snapshot '{}': {e}", path.display())))?;
                    info!(path = %path.display(), posts = state.posts.len(), "loaded snapshot");
                    Ok(state)
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    warn!(path = %path.display(), "no snapshot, starting empty");
                    Ok(State::default())
                }
                Err(e) => Err(RepoError::Internal(format!("read snapshot '{}': {e}", path.display()))),
            }
        }

        fn read(&self) -> RwLockReadGuard<'_, State> {
            self.state.read().unwrap_or_else(|e| e.into_inner())
        }

        fn write(&self) -> RwLockWriteGuard<'_, State> {
            self.state.write().unwrap_or_else(|e| e.into_inner())
        }

        // Called with the write guard held so snapshots never interleave.
        fn persist(&self, state: &State) -> RepoResult<()> {
            let Some(path) = &self.snapshot_path else { return Ok(()) };
            let bytes = serde_json::to_vec_pretty(state).map_err(|e| RepoError::Internal(e.to_string()))?;
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir).map_err(|e| RepoError::Internal(e.to_string()))?;
            }
            let tmp = path.with_extension("json.tmp");
            std::fs::write(&tmp, bytes).map_err(|e| RepoError::Internal(e.to_string()))?;
            std::fs::rename(&tmp, &**path).map_err(|e| RepoError::Internal(e.to_string()))
        }
    }

    #[async_trait]
    impl PostRepo for InMemRepo {
        async fn save(&self, post: &mut Post) -> RepoResult<()> {
            let mut s = self.write();
            post.updated_at = Utc::now();
            if post.id == 0 {
                s.next_id += 1;
                post.id = s.next_id;
            } else if !s.posts.contains_key(&post.id) {
                return Err(RepoError::NotFound);
            }
            s.posts.insert(post.id, post.clone());
            self.persist(&s)
        }

        async fn save_if(&self, post: &mut Post, status: PostStatus, tid: &str) -> RepoResult<bool> {
            let mut s = self.write();
            let current = s.posts.get(&post.id).ok_or(RepoError::NotFound)?;
            if current.status != status || current.tid != tid {
                return Ok(false);
            }
            post.updated_at = Utc::now();
            s.posts.insert(post.id, post.clone());
            self.persist(&s)?;
            Ok(true)
        }

        async fn update_if(&self, id: Id, status: PostStatus, tid: &str, change: &Change<'_>) -> RepoResult<Option<Post>> {
            let mut s = self.write();
            let current = s.posts.get_mut(&id).ok_or(RepoError::NotFound)?;
            if current.status != status || current.tid != tid {
                return Ok(None);
            }
            let mut post = current.clone();
            change(&mut post);
            post.id = id;
            post.updated_at = Utc::now();
            *current = post.clone();
            self.persist(&s)?;
            Ok(Some(post))
        }

        async fn get(&self, id: Id) -> RepoResult<Option<Post>> {
            Ok(self.read().posts.get(&id).cloned())
        }

        async fn list_by_status(&self, status: PostStatus) -> RepoResult<Vec<Post>> {
            let s = self.read();
            Ok(s.posts.values().filter(|p| p.status == status).cloned().collect())
        }

        async fn get_approved(&self, limit: usize) -> RepoResult<Vec<Post>> {
            let s = self.read();
            Ok(s.posts
                .values()
                .filter(|p| p.status == PostStatus::Approved && p.tid.is_empty())
                .take(limit)
                .cloned()
                .collect())
        }

        async fn get_many(&self, ids: &[Id]) -> RepoResult<Vec<Post>> {
            let s = self.read();
            let mut v: Vec<_> = ids.iter().filter_map(|id| s.posts.get(id).cloned()).collect();
            v.sort_by_key(|p| p.id);
            v.dedup_by_key(|p| p.id);
            Ok(v)
        }

        async fn count_by_status(&self, status: PostStatus) -> RepoResult<i64> {
            Ok(self.read().posts.values().filter(|p| p.status == status).count() as i64)
        }

        async fn count_all(&self) -> RepoResult<i64> {
            Ok(self.read().posts.len() as i64)
        }

        async fn release_claims(&self) -> RepoResult<u64> {
            let mut s = self.write();
            let now = Utc::now();
            let mut released = 0;
            for p in s.posts.values_mut().filter(|p| p.is_claimed()) {
                p.status = PostStatus::Approved;
                p.tid.clear();
                p.updated_at = now;
                released += 1;
            }
            if released > 0 {
                self.persist(&s)?;
            }
            Ok(released)
        }
    }
}

pub mod sqlite {
    use super::*;
    use chrono::DateTime;
    use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
    use sqlx::{QueryBuilder, Sqlite, SqlitePool};
    use std::path::Path;
    use std::str::FromStr;
    use std::time::Duration;

    const POST_COLS: &str = "SELECT id, uin, name, group_id, text, images, anon, status, reason, tid, \
                             avatar_url, retry_count, last_error, created_at, updated_at FROM posts ";

    impl From<sqlx::Error> for RepoError {
        fn from(e: sqlx::Error) -> Self {
            match e {
                sqlx::Error::RowNotFound => RepoError::NotFound,
                sqlx::Error::Database(db) if db.is_unique_violation() => RepoError::Conflict,
                other => RepoError::Internal(other.to_string()),
            }
        }
    }

    #[derive(sqlx::FromRow)]
    struct PostRow {
        id: i64,
        uin: i64,
        name: String,
        group_id: i64,
        text: String,
        images: String,
        anon: bool,
        status: String,
        reason: String,
        tid: String,
        avatar_url: String,
        retry_count: i64,
        last_error: String,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    }

    impl TryFrom<PostRow> for Post {
        type Error = RepoError;

        fn try_from(r: PostRow) -> Result<Self, Self::Error> {
            let status = r.status.parse::<PostStatus>().map_err(|e: UnknownStatus| RepoError::Internal(e.to_string()))?;
            let images = serde_json::from_str(&r.images)
                .map_err(|e| RepoError::Internal(format!("post #{} images: {e}", r.id)))?;
            Ok(Post {
                id: r.id,
                uin: r.uin,
                name: r.name,
                group_id: r.group_id,
                text: r.text,
                images,
                anon: r.anon,
                status,
                reason: r.reason,
                tid: r.tid,
                avatar_url: r.avatar_url,
                retry_count: r.retry_count.max(0) as u32,
                last_error: r.last_error,
                created_at: r.created_at,
                updated_at: r.updated_at,
            })
        }
    }

    fn collect(rows: Vec<PostRow>) -> RepoResult<Vec<Post>> {
        rows.into_iter().map(Post::try_from).collect()
    }

    fn images_json(post: &Post) -> RepoResult<String> {
        serde_json::to_string(&post.images).map_err(|e| RepoError::Internal(e.to_string()))
    }

    #[derive(Clone)]
    pub struct SqliteRepo { pool: SqlitePool }

    impl SqliteRepo {
        /// Opens (creating if needed) the database file and applies migrations.
        pub async fn open(path: impl AsRef<Path>) -> RepoResult<Self> {
            let path = path.as_ref();
            if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                std::fs::create_dir_all(dir).map_err(|e| RepoError::Internal(e.to_string()))?;
            }
            let opts = SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal)
                .busy_timeout(Duration::from_secs(5));
            let pool = SqlitePoolOptions::new().max_connections(4).connect_with(opts).await?;
            Self::migrated(pool).await
        }

        /// Private in-memory database; a single connection keeps it alive.
        pub async fn in_memory() -> RepoResult<Self> {
            let opts = SqliteConnectOptions::from_str("sqlite::memory:")?;
            let pool = SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(opts)
                .await?;
            Self::migrated(pool).await
        }

        async fn migrated(pool: SqlitePool) -> RepoResult<Self> {
            sqlx::migrate!("./migrations")
                .run(&pool)
                .await
                .map_err(|e| RepoError::Internal(format!("migrate: {e}")))?;
            Ok(Self { pool })
        }
    }

    #[async_trait]
    impl PostRepo for SqliteRepo {
        async fn save(&self, post: &mut Post) -> RepoResult<()> {
            let images = images_json(post)?;
            let now = Utc::now();
            if post.id == 0 {
                let res = sqlx::query(
                    "INSERT INTO posts (uin, name, group_id, text, images, anon, status, reason, tid, \
                     avatar_url, retry_count, last_error, created_at, updated_at) \
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(post.uin).bind(&post.name).bind(post.group_id).bind(&post.text).bind(&images)
                .bind(post.anon).bind(post.status.as_str()).bind(&post.reason).bind(&post.tid)
                .bind(&post.avatar_url).bind(post.retry_count as i64).bind(&post.last_error)
                .bind(post.created_at).bind(now)
                .execute(&self.pool)
                .await?;
                post.id = res.last_insert_rowid();
            } else {
                let res = sqlx::query(
                    "UPDATE posts SET uin=?, name=?, group_id=?, text=?, images=?, anon=?, status=?, reason=?, \
                     tid=?, avatar_url=?, retry_count=?, last_error=?, updated_at=? WHERE id=?",
                )
                .bind(post.uin).bind(&post.name).bind(post.group_id).bind(&post.text).bind(&images)
                .bind(post.anon).bind(post.status.as_str()).bind(&post.reason).bind(&post.tid)
                .bind(&post.avatar_url).bind(post.retry_count as i64).bind(&post.last_error)
                .bind(now).bind(post.id)
                .execute(&self.pool)
                .await?;
                if res.rows_affected() == 0 {
                    return Err(RepoError::NotFound);
                }
            }
            post.updated_at = now;
            Ok(())
        }

        async fn save_if(&self, post: &mut Post, status: PostStatus, tid: &str) -> RepoResult<bool> {
            let images = images_json(post)?;
            let now = Utc::now();
            let res = sqlx::query(
                "UPDATE posts SET uin=?, name=?, group_id=?, text=?, images=?, anon=?, status=?, reason=?, \
                 tid=?, avatar_url=?, retry_count=?, last_error=?, updated_at=? \
                 WHERE id=? AND status=? AND tid=?",
            )
            .bind(post.uin).bind(&post.name).bind(post.group_id).bind(&post.text).bind(&images)
            .bind(post.anon).bind(post.status.as_str()).bind(&post.reason).bind(&post.tid)
            .bind(&post.avatar_url).bind(post.retry_count as i64).bind(&post.last_error)
            .bind(now).bind(post.id).bind(status.as_str()).bind(tid)
            .execute(&self.pool)
            .await?;
            if res.rows_affected() == 1 {
                post.updated_at = now;
                return Ok(true);
            }
            // Distinguish a lost race from a missing row.
            let exists: Option<(i64,)> = sqlx::query_as("SELECT id FROM posts WHERE id=?")
                .bind(post.id)
                .fetch_optional(&self.pool)
                .await?;
            match exists {
                Some(_) => Ok(false),
                None => Err(RepoError::NotFound),
            }
        }

        async fn update_if(&self, id: Id, status: PostStatus, tid: &str, change: &Change<'_>) -> RepoResult<Option<Post>> {
            // Optimistic: the write also requires the retry counter read here,
            // so a concurrent bump makes this round start over.
            loop {
                let mut post = self.get(id).await?.ok_or(RepoError::NotFound)?;
                if post.status != status || post.tid != tid {
                    return Ok(None);
                }
                let seen_retries = post.retry_count;
                change(&mut post);
                post.id = id;
                let images = images_json(&post)?;
                let now = Utc::now();
                let res = sqlx::query(
                    "UPDATE posts SET uin=?, name=?, group_id=?, text=?, images=?, anon=?, status=?, reason=?, \
                     tid=?, avatar_url=?, retry_count=?, last_error=?, updated_at=? \
                     WHERE id=? AND status=? AND tid=? AND retry_count=?",
                )
                .bind(post.uin).bind(&post.name).bind(post.group_id).bind(&post.text).bind(&images)
                .bind(post.anon).bind(post.status.as_str()).bind(&post.reason).bind(&post.tid)
                .bind(&post.avatar_url).bind(post.retry_count as i64).bind(&post.last_error)
                .bind(now).bind(id).bind(status.as_str()).bind(tid).bind(seen_retries as i64)
                .execute(&self.pool)
                .await?;
                if res.rows_affected() == 1 {
                    post.updated_at = now;
                    return Ok(Some(post));
                }
            }
        }

        async fn get(&self, id: Id) -> RepoResult<Option<Post>> {
            let row = sqlx::query_as::<_, PostRow>(&format!("{POST_COLS}WHERE id=?"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
            row.map(Post::try_from).transpose()
        }

        async fn list_by_status(&self, status: PostStatus) -> RepoResult<Vec<Post>> {
            let rows = sqlx::query_as::<_, PostRow>(&format!("{POST_COLS}WHERE status=? ORDER BY id ASC"))
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await?;
            collect(rows)
        }

        async fn get_approved(&self, limit: usize) -> RepoResult<Vec<Post>> {
            let rows = sqlx::query_as::<_, PostRow>(&format!(
                "{POST_COLS}WHERE status='approved' AND tid='' ORDER BY id ASC LIMIT ?"
            ))
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
            collect(rows)
        }

        async fn get_many(&self, ids: &[Id]) -> RepoResult<Vec<Post>> {
            if ids.is_empty() {
                return Ok(Vec::new());
            }
            let mut qb = QueryBuilder::<Sqlite>::new(POST_COLS);
            qb.push("WHERE id IN (");
            let mut sep = qb.separated(", ");
            for id in ids {
                sep.push_bind(*id);
            }
            sep.push_unseparated(") ORDER BY id ASC");
            let rows = qb.build_query_as::<PostRow>().fetch_all(&self.pool).await?;
            collect(rows)
        }

        async fn count_by_status(&self, status: PostStatus) -> RepoResult<i64> {
            let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM posts WHERE status=?")
                .bind(status.as_str())
                .fetch_one(&self.pool)
                .await?;
            Ok(n)
        }

        async fn count_all(&self) -> RepoResult<i64> {
            let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM posts").fetch_one(&self.pool).await?;
            Ok(n)
        }

        async fn release_claims(&self) -> RepoResult<u64> {
            let res = sqlx::query(
                "UPDATE posts SET status='approved', tid='', updated_at=? WHERE status='published' AND tid LIKE ?",
            )
            .bind(Utc::now())
            .bind(format!("{CLAIM_PREFIX}%"))
            .execute(&self.pool)
            .await?;
            Ok(res.rows_affected())
        }
    }
}
