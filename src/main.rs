use std::sync::Arc;
use std::time::Duration;

use actix_cors::Cors;
use actix_web::{middleware::Compress, web, App, HttpServer};
use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::EnvFilter;
use utoipa::OpenApi; // bring trait into scope for ApiDoc::openapi()
use utoipa_swagger_ui::SwaggerUi;

use qzwall::auth::AuthConfig;
use qzwall::bot::{BotConnection, OneBotHttp};
use qzwall::config::{Censor, Cli, Config};
use qzwall::credential::CredentialAgent;
use qzwall::keep_alive::KeepAlive;
use qzwall::moderation::Moderation;
use qzwall::openapi::ApiDoc;
use qzwall::qr_login::QrCoordinator;
use qzwall::qzone::{HttpQzone, QzoneApi, Session, SessionClient};
use qzwall::rate_limit::SubmissionLimiter;
use qzwall::render::{CardRenderer, ImageResolver};
use qzwall::repo::sqlite::SqliteRepo;
use qzwall::repo::PostRepo;
use qzwall::storage::UploadStore;
use qzwall::worker::Publisher;
use qzwall::{routes_config, AppState};

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Load .env automatically only in debug builds to reduce manual setup overhead.
    if cfg!(debug_assertions) {
        let _ = dotenv::dotenv();
    }

    let config_path = Cli::parse().config_path();
    let mut cfg = Config::load(config_path.as_deref()).context("loading config")?;

    // Structured logging initialisation; RUST_LOG wins over the config file.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.log.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    info!(config = ?config_path, "bootstrapping confession wall");
    cfg.finish().context("validating config")?;

    if let Some(dir) = cfg.database.path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }
    let repo: Arc<dyn PostRepo> = Arc::new(SqliteRepo::open(&cfg.database.path).await.context("opening store")?);
    info!(path = %cfg.database.path.display(), "store ready");

    let mut bots: Vec<Arc<dyn BotConnection>> = Vec::with_capacity(cfg.bot.connections.len());
    for conn in &cfg.bot.connections {
        bots.push(Arc::new(OneBotHttp::new(conn, cfg.qzone.timeout).context("building bot client")?));
    }

    let initial = if cfg.qzone.cookie.is_empty() {
        Session::bootstrap()
    } else {
        Session::parse(&cfg.qzone.cookie).unwrap_or_else(|e| {
            warn!(error = %e, "configured cookie unusable, starting logged out");
            Session::bootstrap()
        })
    };
    let agent = Arc::new(
        CredentialAgent::new(initial, bots, cfg.bot.cookie_domain.clone()).with_uin_lock(cfg.qzone.lock_uin),
    );
    if !agent.is_logged_in() {
        match agent.refresh_from_bot().await {
            Ok(uin) => info!(uin, "logged in with bot cookie"),
            Err(e) => warn!(error = %e, "starting without an upstream session"),
        }
    }

    let api: Arc<dyn QzoneApi> = Arc::new(HttpQzone::new(cfg.qzone.timeout).context("building upstream client")?);
    let client = SessionClient::new(api.clone(), agent.clone(), cfg.qzone.max_retry, cfg.qzone.timeout);
    let shutdown = CancellationToken::new();

    let resolver = ImageResolver::new(&cfg.web.upload_dir, &cfg.web.site_root);
    let renderer = Arc::new(CardRenderer::new(cfg.qzone.timeout).context("building renderer")?);
    let publisher = Arc::new(Publisher::new(
        repo.clone(),
        client.clone(),
        renderer,
        resolver.clone(),
        cfg.worker.clone(),
        cfg.wall.publish_delay,
    ));
    let workers = publisher.start(&shutdown).await.context("starting publisher")?;
    let keep_alive = KeepAlive::new(client, cfg.qzone.keep_alive).spawn(shutdown.clone());
    let qr = QrCoordinator::new(api, agent.clone(), &cfg.qr, shutdown.clone());

    let server = if cfg.web.enable {
        let state = AppState {
            moderation: Moderation::new(repo.clone()),
            agent: agent.clone(),
            qr,
            uploads: UploadStore::new(resolver.upload_dir(), cfg.max_image_bytes()),
            resolver,
            censor: Arc::new(Censor::load(&cfg.censor).context("loading censor list")?),
            limiter: SubmissionLimiter::new(cfg.wall.submit_limit, cfg.wall.submit_window),
            wall: cfg.wall.clone(),
        };
        let auth = AuthConfig::new(&cfg.web.jwt_secret, &cfg.web.admin_username, &cfg.web.admin_password);
        let openapi = ApiDoc::openapi();
        // multipart bodies carry up to max_images files
        let body_limit = cfg.max_image_bytes().saturating_mul(cfg.wall.max_images.max(1)) + 1024 * 1024;
        let server = HttpServer::new(move || {
            let cors = Cors::default()
                .allow_any_origin()
                .allow_any_header()
                .allowed_methods(["GET", "POST", "PUT", "OPTIONS"])
                .max_age(3600);
            App::new()
                .wrap(TracingLogger::default())
                .wrap(Compress::default())
                .wrap(cors)
                .app_data(web::Data::new(state.clone()))
                .app_data(web::Data::new(auth.clone()))
                .app_data(web::PayloadConfig::new(body_limit))
                .configure(routes_config)
                .service(SwaggerUi::new("/docs/{_:.*}").url("/docs/openapi.json", openapi.clone()))
        })
        .disable_signals()
        .bind(&cfg.web.addr)
        .with_context(|| format!("binding {}", cfg.web.addr))?
        .run();
        info!(addr = %cfg.web.addr, "listening");
        let handle = server.handle();
        actix_web::rt::spawn(server);
        Some(handle)
    } else {
        info!("web surface disabled");
        None
    };

    wait_for_signal().await;
    info!("shutting down");
    shutdown.cancel();
    if let Some(handle) = server {
        handle.stop(true).await;
    }
    workers.stop().await;
    if tokio::time::timeout(Duration::from_secs(5), keep_alive).await.is_err() {
        warn!("keep-alive did not stop in time");
    }
    info!("bye");
    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
                return;
            }
            Err(e) => warn!(error = %e, "cannot install SIGTERM handler"),
        }
    }
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "cannot listen for ctrl-c");
    }
}
