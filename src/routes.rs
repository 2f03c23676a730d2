use std::sync::Arc;

use actix_multipart::Multipart;
use actix_web::{web, HttpRequest, HttpResponse};
use futures_util::TryStreamExt as _;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use utoipa::{IntoParams, ToSchema};

use crate::auth::{Auth, AuthConfig, Role};
use crate::config::{Censor, WallConfig};
use crate::credential::CredentialAgent;
use crate::error::ApiError;
use crate::models::*;
use crate::moderation::Moderation;
use crate::qr_login::QrCoordinator;
use crate::rate_limit::SubmissionLimiter;
use crate::render::ImageResolver;
use crate::storage::UploadStore;

/// Upper bound for a plain multipart text field.
const FIELD_LIMIT: usize = 64 * 1024;
const DEFAULT_NAME: &str = "anonymous";

pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1")
            .service(web::resource("/health").route(web::get().to(health)))
            .service(web::resource("/auth/login").route(web::post().to(login)))
            .service(
                web::resource("/posts")
                    .route(web::get().to(list_posts))
                    .route(web::post().to(submit_post)),
            )
            // batch routes go before `/posts/{id}` so they are matched first
            .service(web::resource("/posts/approve").route(web::post().to(batch_approve)))
            .service(web::resource("/posts/reject").route(web::post().to(batch_reject)))
            .service(web::resource("/posts/{id}").route(web::get().to(get_post)))
            .service(web::resource("/posts/{id}/approve").route(web::post().to(approve_post)))
            .service(web::resource("/posts/{id}/reject").route(web::post().to(reject_post)))
            .service(web::resource("/stats").route(web::get().to(stats)))
            .service(web::resource("/qzone/status").route(web::get().to(qzone_status)))
            .service(web::resource("/qzone/qrcode").route(web::post().to(request_qr)))
            .service(web::resource("/qzone/qrcode/status").route(web::get().to(qr_status)))
            .service(web::resource("/qzone/refresh").route(web::post().to(refresh_cookie)))
            .service(web::resource("/qzone/cookie").route(web::put().to(update_cookie))),
    );
    cfg.route("/uploads/{file}", web::get().to(get_upload));
}

#[derive(Clone)]
pub struct AppState {
    pub moderation: Moderation,
    pub agent: Arc<CredentialAgent>,
    pub qr: QrCoordinator,
    pub uploads: UploadStore,
    pub resolver: ImageResolver,
    pub censor: Arc<Censor>,
    pub limiter: SubmissionLimiter,
    pub wall: WallConfig,
}

impl AppState {
    /// Rewrites `/uploads/..` references into browser-fetchable URLs.
    fn display(&self, mut post: Post) -> Post {
        post.images = post.images.iter().map(|r| self.resolver.for_display(r)).collect();
        post
    }
}

fn ensure_admin(auth: &Auth) -> Result<(), ApiError> {
    if auth.is_admin() { Ok(()) } else { Err(ApiError::Forbidden) }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub logged_in: bool,
}

#[utoipa::path(get, path = "/api/v1/health", responses((status = 200, body = HealthResponse)))]
pub async fn health(data: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(HealthResponse { status: "ok".into(), logged_in: data.agent.is_logged_in() })
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct LoginResponse {
    pub token: String,
}

#[utoipa::path(
    post,
    path = "/api/v1/auth/login",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Admin token", body = LoginResponse),
        (status = 401, description = "Bad credentials")
    )
)]
pub async fn login(auth: web::Data<AuthConfig>, payload: web::Json<LoginRequest>) -> Result<HttpResponse, ApiError> {
    if !auth.check_credentials(&payload.username, &payload.password) {
        warn!(username = %payload.username, "admin login refused");
        return Err(ApiError::Unauthorized);
    }
    let token = auth.create_jwt(&payload.username, vec![Role::Admin]).map_err(|e| {
        tracing::error!(error = %e, "jwt encode failed");
        ApiError::Internal
    })?;
    info!(username = %payload.username, "admin logged in");
    Ok(HttpResponse::Ok().json(LoginResponse { token }))
}

/// Accepted submission, before it becomes a post.
#[derive(Debug, Default)]
struct Submission {
    text: String,
    uin: i64,
    name: String,
    anon: Option<bool>,
    images: Vec<Vec<u8>>,
}

/// Checks emptiness, length and the censor list; no state is touched.
pub fn validate_submission(text: &str, image_count: usize, wall: &WallConfig, censor: &Censor) -> Result<(), ApiError> {
    if text.trim().is_empty() && image_count == 0 {
        return Err(ApiError::BadRequest("submission needs text or an image".into()));
    }
    if text.chars().count() > wall.max_text_len {
        return Err(ApiError::BadRequest(format!("text exceeds {} characters", wall.max_text_len)));
    }
    if let Some(word) = censor.check_censor(text) {
        info!(word, "submission blocked by censor list");
        return Err(ApiError::BadRequest("submission contains a blocked word".into()));
    }
    Ok(())
}

async fn read_field(field: &mut actix_multipart::Field, limit: usize) -> Result<Vec<u8>, ApiError> {
    let mut buf = Vec::new();
    while let Some(chunk) = field.try_next().await.map_err(|e| ApiError::BadRequest(format!("multipart: {e}")))? {
        if buf.len() + chunk.len() > limit {
            return Err(ApiError::PayloadTooLarge);
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(buf)
}

async fn read_submission(mut payload: Multipart, max_images: usize, max_bytes: usize) -> Result<Submission, ApiError> {
    let mut sub = Submission::default();
    while let Some(mut field) = payload.try_next().await.map_err(|e| ApiError::BadRequest(format!("multipart: {e}")))? {
        let name = field.content_disposition().get_name().unwrap_or_default().to_string();
        match name.as_str() {
            "images" | "images[]" | "image" => {
                let bytes = read_field(&mut field, max_bytes).await?;
                if !bytes.is_empty() && sub.images.len() < max_images {
                    sub.images.push(bytes);
                }
            }
            _ => {
                let raw = read_field(&mut field, FIELD_LIMIT).await?;
                let value = String::from_utf8(raw).map_err(|_| ApiError::BadRequest(format!("field {name} is not utf-8")))?;
                match name.as_str() {
                    "text" => sub.text = value,
                    "uin" => sub.uin = value.trim().parse().unwrap_or(0),
                    "name" => sub.name = value.trim().to_string(),
                    "anon" => sub.anon = Some(matches!(value.trim(), "1" | "true" | "on" | "yes")),
                    _ => {}
                }
            }
        }
    }
    Ok(sub)
}

#[utoipa::path(
    post,
    path = "/api/v1/posts",
    responses(
        (status = 201, description = "Pending post created", body = Post),
        (status = 400, description = "Empty, too long or blocked"),
        (status = 413, description = "Image too large"),
        (status = 415, description = "Not an image"),
        (status = 429, description = "Too many submissions")
    )
)]
pub async fn submit_post(req: HttpRequest, data: web::Data<AppState>, payload: Multipart) -> Result<HttpResponse, ApiError> {
    let client = req.connection_info().realip_remote_addr().unwrap_or("unknown").to_string();
    if !data.limiter.allow(&client) {
        return Err(ApiError::TooManyRequests);
    }
    let sub = read_submission(payload, data.wall.max_images, data.uploads.max_bytes()).await?;
    validate_submission(&sub.text, sub.images.len(), &data.wall, &data.censor)?;

    let images = data.uploads.save_all(&sub.images).await?;
    let name = if sub.name.is_empty() { DEFAULT_NAME.to_string() } else { sub.name };
    let mut post = Post::new(NewPost {
        uin: sub.uin,
        name,
        group_id: 0,
        text: sub.text,
        images,
        anon: sub.anon.unwrap_or(data.wall.anon_default),
        avatar_url: None,
    });
    data.moderation.repo().save(&mut post).await?;
    info!(post_id = post.id, images = post.images.len(), "submission received");
    Ok(HttpResponse::Created().json(data.display(post)))
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct ListQuery {
    /// Defaults to `pending`.
    pub status: Option<String>,
}

#[utoipa::path(
    get,
    path = "/api/v1/posts",
    params(ListQuery),
    responses((status = 200, description = "Posts in FIFO order", body = [Post]))
)]
pub async fn list_posts(auth: Auth, data: web::Data<AppState>, query: web::Query<ListQuery>) -> Result<HttpResponse, ApiError> {
    ensure_admin(&auth)?;
    let status = match query.status.as_deref() {
        None | Some("") => PostStatus::Pending,
        Some(s) => s.parse::<PostStatus>().map_err(|e| ApiError::BadRequest(e.to_string()))?,
    };
    let posts: Vec<Post> = data.moderation.list(status).await?.into_iter().map(|p| data.display(p)).collect();
    Ok(HttpResponse::Ok().json(posts))
}

#[utoipa::path(
    get,
    path = "/api/v1/posts/{id}",
    params(("id" = Id, Path, description = "Post id")),
    responses((status = 200, body = Post), (status = 404, description = "Unknown post"))
)]
pub async fn get_post(auth: Auth, data: web::Data<AppState>, path: web::Path<Id>) -> Result<HttpResponse, ApiError> {
    ensure_admin(&auth)?;
    let post = data.moderation.get(path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(data.display(post)))
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ModerationResponse {
    pub id: Id,
    /// False when the post was already in the requested state.
    pub applied: bool,
}

#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct RejectRequest {
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct BatchRequest {
    pub ids: Vec<Id>,
    #[serde(default)]
    pub reason: String,
}

fn reason_or_default(reason: &str) -> &str {
    let r = reason.trim();
    if r.is_empty() { "rejected by admin" } else { r }
}

#[utoipa::path(
    post,
    path = "/api/v1/posts/{id}/approve",
    params(("id" = Id, Path, description = "Post id")),
    responses(
        (status = 200, body = ModerationResponse),
        (status = 404, description = "Unknown post"),
        (status = 409, description = "Post is not pending")
    )
)]
pub async fn approve_post(auth: Auth, data: web::Data<AppState>, path: web::Path<Id>) -> Result<HttpResponse, ApiError> {
    ensure_admin(&auth)?;
    let id = path.into_inner();
    let outcome = data.moderation.approve(id).await?;
    Ok(HttpResponse::Ok().json(ModerationResponse { id, applied: outcome == crate::moderation::Outcome::Applied }))
}

#[utoipa::path(
    post,
    path = "/api/v1/posts/{id}/reject",
    params(("id" = Id, Path, description = "Post id")),
    request_body = RejectRequest,
    responses(
        (status = 200, body = ModerationResponse),
        (status = 404, description = "Unknown post"),
        (status = 409, description = "Post is not pending")
    )
)]
pub async fn reject_post(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<Id>,
    payload: Option<web::Json<RejectRequest>>,
) -> Result<HttpResponse, ApiError> {
    ensure_admin(&auth)?;
    let id = path.into_inner();
    let body = payload.map(|p| p.into_inner()).unwrap_or_default();
    let outcome = data.moderation.reject(id, reason_or_default(&body.reason)).await?;
    Ok(HttpResponse::Ok().json(ModerationResponse { id, applied: outcome == crate::moderation::Outcome::Applied }))
}

#[utoipa::path(
    post,
    path = "/api/v1/posts/approve",
    request_body = BatchRequest,
    responses((status = 200, body = BatchReport))
)]
pub async fn batch_approve(auth: Auth, data: web::Data<AppState>, payload: web::Json<BatchRequest>) -> Result<HttpResponse, ApiError> {
    ensure_admin(&auth)?;
    if payload.ids.is_empty() {
        return Err(ApiError::BadRequest("ids must not be empty".into()));
    }
    Ok(HttpResponse::Ok().json(data.moderation.batch_approve(&payload.ids).await?))
}

#[utoipa::path(
    post,
    path = "/api/v1/posts/reject",
    request_body = BatchRequest,
    responses((status = 200, body = BatchReport))
)]
pub async fn batch_reject(auth: Auth, data: web::Data<AppState>, payload: web::Json<BatchRequest>) -> Result<HttpResponse, ApiError> {
    ensure_admin(&auth)?;
    if payload.ids.is_empty() {
        return Err(ApiError::BadRequest("ids must not be empty".into()));
    }
    let report = data.moderation.batch_reject(&payload.ids, reason_or_default(&payload.reason)).await?;
    Ok(HttpResponse::Ok().json(report))
}

#[utoipa::path(get, path = "/api/v1/stats", responses((status = 200, body = WallStats)))]
pub async fn stats(auth: Auth, data: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    ensure_admin(&auth)?;
    Ok(HttpResponse::Ok().json(data.moderation.stats().await?))
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct QzoneStatus {
    pub logged_in: bool,
    pub uin: i64,
}

#[utoipa::path(get, path = "/api/v1/qzone/status", responses((status = 200, body = QzoneStatus)))]
pub async fn qzone_status(data: web::Data<AppState>) -> HttpResponse {
    let view = data.agent.view();
    HttpResponse::Ok().json(QzoneStatus { logged_in: view.logged_in, uin: view.uin })
}

#[utoipa::path(
    post,
    path = "/api/v1/qzone/qrcode",
    responses(
        (status = 200, description = "PNG image of the login QR code", content_type = "image/png"),
        (status = 503, description = "Upstream unavailable")
    )
)]
pub async fn request_qr(auth: Auth, data: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    ensure_admin(&auth)?;
    let code = data.qr.request_qr().await?;
    Ok(HttpResponse::Ok().content_type("image/png").body(code.image))
}

#[utoipa::path(get, path = "/api/v1/qzone/qrcode/status", responses((status = 200, body = QrStatusView)))]
pub async fn qr_status(auth: Auth, data: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    ensure_admin(&auth)?;
    Ok(HttpResponse::Ok().json(data.qr.query_status()))
}

#[utoipa::path(
    post,
    path = "/api/v1/qzone/refresh",
    responses((status = 200, body = CredentialView), (status = 503, description = "No bot cookie available"))
)]
pub async fn refresh_cookie(auth: Auth, data: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    ensure_admin(&auth)?;
    data.agent.refresh_from_bot().await?;
    Ok(HttpResponse::Ok().json(data.agent.view()))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CookieRequest {
    pub cookie: String,
}

#[utoipa::path(
    put,
    path = "/api/v1/qzone/cookie",
    request_body = CookieRequest,
    responses((status = 200, body = CredentialView), (status = 400, description = "Unusable cookie"))
)]
pub async fn update_cookie(auth: Auth, data: web::Data<AppState>, payload: web::Json<CookieRequest>) -> Result<HttpResponse, ApiError> {
    ensure_admin(&auth)?;
    data.agent.update_cookie(&payload.cookie)?;
    Ok(HttpResponse::Ok().json(data.agent.view()))
}

pub async fn get_upload(data: web::Data<AppState>, path: web::Path<String>) -> Result<HttpResponse, ApiError> {
    match data.uploads.load(&path.into_inner()).await? {
        Some((bytes, mime)) => Ok(HttpResponse::Ok()
            .content_type(mime)
            .insert_header(("Cache-Control", "public, max-age=31536000, immutable"))
            .body(bytes)),
        None => Err(ApiError::NotFound),
    }
}
