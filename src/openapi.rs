use crate::models::{BatchReport, CredentialView, NewPost, Post, PostStatus, QrStatus, QrStatusView, WallStats};
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::routes::health,
        crate::routes::login,
        crate::routes::submit_post,
        crate::routes::list_posts,
        crate::routes::get_post,
        crate::routes::approve_post,
        crate::routes::reject_post,
        crate::routes::batch_approve,
        crate::routes::batch_reject,
        crate::routes::stats,
        crate::routes::qzone_status,
        crate::routes::request_qr,
        crate::routes::qr_status,
        crate::routes::refresh_cookie,
        crate::routes::update_cookie,
    ),
    components(schemas(
        Post, NewPost, PostStatus, BatchReport, WallStats, QrStatus, QrStatusView, CredentialView,
        crate::routes::HealthResponse, crate::routes::LoginRequest, crate::routes::LoginResponse,
        crate::routes::ModerationResponse, crate::routes::RejectRequest, crate::routes::BatchRequest,
        crate::routes::QzoneStatus, crate::routes::CookieRequest
    )),
    tags(
        (name = "posts", description = "Submission and moderation"),
        (name = "qzone", description = "Publishing account session"),
    )
)]
pub struct ApiDoc;
