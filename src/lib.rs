pub mod auth;
pub mod bot;
pub mod config;
pub mod credential;
pub mod error;
pub mod keep_alive;
pub mod models;
pub mod moderation;
pub mod openapi;
pub mod qr_login;
pub mod qzone;
pub mod rate_limit;
pub mod render;
pub mod repo;
pub mod routes;
pub mod storage;
pub mod worker;

// Re-export commonly used items for tests / external users
pub use routes::{config as routes_config, AppState};
