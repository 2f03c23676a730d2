//! Process configuration.
//!
//! Loaded from a JSON file where every field is optional, then patched from
//! the environment for secrets. Durations are written Go-style (`"30m"`,
//! `"1h30m"`, `"250ms"`) or as integer seconds.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub const DEFAULT_CONFIG_PATH: &str = "config.json";

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub qzone: QzoneConfig,
    pub bot: BotConfig,
    pub wall: WallConfig,
    pub database: DatabaseConfig,
    pub web: WebConfig,
    pub censor: CensorConfig,
    pub worker: WorkerConfig,
    pub qr: QrConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QzoneConfig {
    #[serde(with = "duration")]
    pub keep_alive: Duration,
    pub max_retry: u32,
    #[serde(with = "duration")]
    pub timeout: Duration,
    /// Refuse cookies that would switch the publishing account.
    pub lock_uin: bool,
    /// Initial cookie; empty means "ask a bot, else wait for QR login".
    pub cookie: String,
}

impl Default for QzoneConfig {
    fn default() -> Self {
        Self {
            keep_alive: Duration::from_secs(30 * 60),
            max_retry: 2,
            timeout: Duration::from_secs(30),
            lock_uin: false,
            cookie: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BotConfig {
    pub connections: Vec<BotConnectionConfig>,
    pub cookie_domain: String,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self { connections: Vec::new(), cookie_domain: "qzone.qq.com".into() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConnectionConfig {
    pub id: i64,
    /// OneBot HTTP API base, e.g. `http://127.0.0.1:3000`.
    pub url: String,
    #[serde(default)]
    pub access_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WallConfig {
    pub max_images: usize,
    pub max_image_size_mb: u64,
    pub max_text_len: usize,
    #[serde(with = "duration")]
    pub publish_delay: Duration,
    pub anon_default: bool,
    /// Web submissions allowed per client per `submit_window`.
    pub submit_limit: usize,
    #[serde(with = "duration")]
    pub submit_window: Duration,
}

impl Default for WallConfig {
    fn default() -> Self {
        Self {
            max_images: 9,
            max_image_size_mb: 5,
            max_text_len: 2000,
            publish_delay: Duration::ZERO,
            anon_default: false,
            submit_limit: 5,
            submit_window: Duration::from_secs(10 * 60),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { path: PathBuf::from("data/wall.db") }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    pub enable: bool,
    pub addr: String,
    pub upload_dir: PathBuf,
    /// Public origin used to turn `/uploads/..` paths into absolute URLs.
    pub site_root: String,
    pub jwt_secret: String,
    pub admin_username: String,
    pub admin_password: String,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            enable: true,
            addr: "0.0.0.0:8081".into(),
            upload_dir: PathBuf::from("data/uploads"),
            site_root: String::new(),
            jwt_secret: String::new(),
            admin_username: "admin".into(),
            admin_password: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CensorConfig {
    pub words: Vec<String>,
    pub words_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub workers: usize,
    pub retry_count: u32,
    #[serde(with = "duration")]
    pub retry_delay: Duration,
    #[serde(with = "duration")]
    pub max_retry_delay: Duration,
    #[serde(with = "duration")]
    pub rate_limit: Duration,
    #[serde(with = "duration")]
    pub poll_interval: Duration,
    pub batch_max: usize,
    #[serde(with = "duration")]
    pub shutdown_grace: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            retry_count: 3,
            retry_delay: Duration::from_secs(5),
            max_retry_delay: Duration::from_secs(5 * 60),
            rate_limit: Duration::from_secs(30),
            poll_interval: Duration::from_secs(5),
            batch_max: 9,
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QrConfig {
    #[serde(with = "duration")]
    pub poll_interval: Duration,
    #[serde(with = "duration")]
    pub deadline: Duration,
}

impl Default for QrConfig {
    fn default() -> Self {
        Self { poll_interval: Duration::from_secs(2), deadline: Duration::from_secs(240) }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self { level: "info".into() }
    }
}

impl Config {
    /// Reads `path`, or the default location when `None`, and applies the
    /// environment. A missing default file yields the built-in defaults; a
    /// missing explicit file is an error. Call [`Config::finish`] afterwards.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut cfg = match path {
            Some(p) => Self::from_file(p)?,
            None => {
                let p = PathBuf::from(DEFAULT_CONFIG_PATH);
                if p.exists() { Self::from_file(&p)? } else { Self::default() }
            }
        };
        cfg.apply_env();
        Ok(cfg)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Secrets from the environment win over the file.
    pub fn apply_env(&mut self) {
        fn non_empty(name: &str) -> Option<String> {
            std::env::var(name).ok().filter(|v| !v.trim().is_empty())
        }
        if let Some(v) = non_empty("QZWALL_JWT_SECRET") {
            self.web.jwt_secret = v;
        }
        if let Some(v) = non_empty("QZWALL_ADMIN_PASSWORD") {
            self.web.admin_password = v;
        }
        if let Some(v) = non_empty("QZWALL_COOKIE") {
            self.qzone.cookie = v;
        }
    }

    /// Validates and fills derived values.
    pub fn finish(&mut self) -> Result<(), ConfigError> {
        if self.worker.workers == 0 {
            return Err(ConfigError::Invalid("worker.workers must be at least 1".into()));
        }
        if self.worker.batch_max == 0 || self.worker.batch_max > self.wall.max_images.max(1) {
            return Err(ConfigError::Invalid(format!(
                "worker.batch_max must be within 1..={}",
                self.wall.max_images.max(1)
            )));
        }
        if self.worker.poll_interval.is_zero() || self.qr.poll_interval.is_zero() {
            return Err(ConfigError::Invalid("poll intervals must be positive".into()));
        }
        if self.worker.max_retry_delay < self.worker.retry_delay {
            self.worker.max_retry_delay = self.worker.retry_delay;
        }
        if self.web.enable && self.web.jwt_secret.is_empty() {
            warn!("web.jwt_secret not set, generating an ephemeral one; admin tokens will not survive restarts");
            let bytes: [u8; 32] = rand::thread_rng().gen();
            self.web.jwt_secret = bytes.iter().map(|b| format!("{b:02x}")).collect();
        }
        if self.web.enable && self.web.admin_password.is_empty() {
            warn!("web.admin_password not set, admin login is disabled");
        }
        Ok(())
    }

    pub fn max_image_bytes(&self) -> usize {
        (self.wall.max_image_size_mb as usize).saturating_mul(1024 * 1024)
    }
}

/// Command line of the `qzwall` binary.
#[derive(Parser, Debug)]
#[command(name = "qzwall", version, about = "Runs the confession wall publication pipeline.")]
pub struct Cli {
    /// Path to the JSON configuration file.
    #[arg(short, long, value_name = "FILE", env = "QZWALL_CONFIG")]
    pub config: Option<PathBuf>,
    /// Same as `--config`, given positionally.
    #[arg(value_name = "FILE", conflicts_with = "config")]
    pub path: Option<PathBuf>,
}

impl Cli {
    pub fn config_path(&self) -> Option<PathBuf> {
        self.config.clone().or_else(|| self.path.clone())
    }
}

/// Submission-time word filter.
#[derive(Debug, Clone, Default)]
pub struct Censor {
    words: Vec<String>,
}

impl Censor {
    /// An empty list lets everything through.
    pub fn load(cfg: &CensorConfig) -> Result<Self, ConfigError> {
        let mut words: Vec<String> = cfg.words.iter().filter_map(|w| normalize_word(w)).collect();
        if let Some(path) = &cfg.words_file {
            let raw = std::fs::read_to_string(path)
                .map_err(|source| ConfigError::Io { path: path.clone(), source })?;
            words.extend(parse_word_list(&raw));
        }
        words.sort();
        words.dedup();
        info!(count = words.len(), "censor list loaded");
        Ok(Self { words })
    }

    pub fn from_words<I: IntoIterator<Item = S>, S: AsRef<str>>(words: I) -> Self {
        Self { words: words.into_iter().filter_map(|w| normalize_word(w.as_ref())).collect() }
    }

    /// First listed word contained in `text`, case-insensitively.
    pub fn check_censor(&self, text: &str) -> Option<&str> {
        if self.words.is_empty() {
            return None;
        }
        let lower = text.to_lowercase();
        self.words.iter().find(|w| lower.contains(w.as_str())).map(String::as_str)
    }
}

fn normalize_word(w: &str) -> Option<String> {
    let w = w.trim();
    (!w.is_empty()).then(|| w.to_lowercase())
}

fn parse_word_list(raw: &str) -> impl Iterator<Item = String> + '_ {
    raw.lines()
        .map(str::trim)
        .filter(|l| !l.starts_with('#'))
        .filter_map(normalize_word)
}

/// Serde adapter for Go-style duration strings.
pub mod duration {
    use std::time::Duration;

    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Secs(u64),
            Text(String),
        }
        match Raw::deserialize(d)? {
            Raw::Secs(s) => Ok(Duration::from_secs(s)),
            Raw::Text(t) => parse(&t).map_err(de::Error::custom),
        }
    }

    /// Parses `"1h30m"`, `"250ms"`, `"1.5s"`, `"0"` or bare seconds.
    pub fn parse(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        if s.is_empty() {
            return Err("empty duration".into());
        }
        if let Ok(secs) = s.parse::<u64>() {
            return Ok(Duration::from_secs(secs));
        }
        let mut total = 0f64;
        let mut rest = s;
        while !rest.is_empty() {
            let num_len = rest.find(|c: char| !(c.is_ascii_digit() || c == '.')).unwrap_or(rest.len());
            if num_len == 0 {
                return Err(format!("invalid duration `{s}`"));
            }
            let value: f64 = rest[..num_len].parse().map_err(|_| format!("invalid duration `{s}`"))?;
            rest = &rest[num_len..];
            let unit_len = rest.find(|c: char| c.is_ascii_digit() || c == '.').unwrap_or(rest.len());
            let scale = match &rest[..unit_len] {
                "ns" => 1e-9,
                "us" | "µs" => 1e-6,
                "ms" => 1e-3,
                "s" => 1.0,
                "m" => 60.0,
                "h" => 3600.0,
                unit => return Err(format!("unknown unit `{unit}` in duration `{s}`")),
            };
            rest = &rest[unit_len..];
            total += value * scale;
        }
        Duration::try_from_secs_f64(total).map_err(|_| format!("duration `{s}` out of range"))
    }

    pub fn format(d: Duration) -> String {
        let ms = d.as_millis();
        if ms == 0 {
            return "0s".into();
        }
        if ms % 1000 != 0 {
            return format!("{ms}ms");
        }
        let secs = d.as_secs();
        let (h, m, s) = (secs / 3600, secs / 60 % 60, secs % 60);
        let mut out = String::new();
        if h > 0 {
            out.push_str(&format!("{h}h"));
        }
        if m > 0 {
            out.push_str(&format!("{m}m"));
        }
        if s > 0 {
            out.push_str(&format!("{s}s"));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn empty_object_is_a_valid_config() {
        let mut cfg: Config = serde_json::from_str("{}").unwrap();
        cfg.finish().unwrap();
        assert_eq!(cfg.qzone.keep_alive, Duration::from_secs(1800));
        assert_eq!(cfg.qzone.max_retry, 2);
        assert_eq!(cfg.worker.workers, 1);
        assert_eq!(cfg.worker.retry_count, 3);
        assert_eq!(cfg.worker.rate_limit, Duration::from_secs(30));
        assert_eq!(cfg.worker.batch_max, 9);
        assert_eq!(cfg.wall.max_text_len, 2000);
        assert_eq!(cfg.max_image_bytes(), 5 * 1024 * 1024);
        assert!(!cfg.web.jwt_secret.is_empty());
    }

    #[test]
    fn durations_parse_go_style() {
        use duration::parse;
        assert_eq!(parse("30m").unwrap(), Duration::from_secs(1800));
        assert_eq!(parse("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse("1.5s").unwrap(), Duration::from_millis(1500));
        assert_eq!(parse("45").unwrap(), Duration::from_secs(45));
        assert!(parse("10 parsecs").is_err());
        assert!(parse("").is_err());
        assert!(parse("99999999999999999999h").is_err());
        assert_eq!(duration::format(Duration::from_secs(5400)), "1h30m");
        assert_eq!(duration::format(Duration::from_millis(250)), "250ms");
    }

    #[test]
    fn sections_accept_strings_and_integers() {
        let cfg: Config = serde_json::from_str(
            r#"{"worker": {"retry_delay": "2s", "rate_limit": 10, "workers": 3}, "wall": {"publish_delay": "1m"}}"#,
        )
        .unwrap();
        assert_eq!(cfg.worker.retry_delay, Duration::from_secs(2));
        assert_eq!(cfg.worker.rate_limit, Duration::from_secs(10));
        assert_eq!(cfg.worker.workers, 3);
        assert_eq!(cfg.wall.publish_delay, Duration::from_secs(60));
        assert_eq!(cfg.worker.poll_interval, Duration::from_secs(5));
    }

    #[test]
    fn shipped_example_parses() {
        let mut cfg: Config = serde_json::from_str(include_str!("../config.example.json")).unwrap();
        cfg.finish().unwrap();
        assert_eq!(cfg.qr.deadline, Duration::from_secs(240));
        assert_eq!(cfg.bot.connections[0].url, "http://127.0.0.1:3000");
        assert_eq!(cfg.wall.submit_window, Duration::from_secs(600));
    }

    #[test]
    fn zero_workers_is_rejected() {
        let mut cfg: Config = serde_json::from_str(r#"{"worker": {"workers": 0}}"#).unwrap();
        assert!(matches!(cfg.finish(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    #[serial]
    fn arg_forms() {
        std::env::remove_var("QZWALL_CONFIG");
        let path = |v: &[&str]| Cli::try_parse_from(v.iter().copied()).unwrap().config_path();
        assert_eq!(path(&["qzwall", "a.json"]), Some("a.json".into()));
        assert_eq!(path(&["qzwall", "-c", "b.json"]), Some("b.json".into()));
        assert_eq!(path(&["qzwall", "--config=c.json"]), Some("c.json".into()));
        assert_eq!(path(&["qzwall"]), None);
        assert!(Cli::try_parse_from(["qzwall", "-c", "a.json", "b.json"]).is_err());

        std::env::set_var("QZWALL_CONFIG", "env.json");
        let from_env = path(&["qzwall"]);
        std::env::remove_var("QZWALL_CONFIG");
        assert_eq!(from_env, Some("env.json".into()));
    }

    #[test]
    #[serial]
    fn env_overrides_secrets() {
        std::env::set_var("QZWALL_ADMIN_PASSWORD", "hunter2");
        std::env::set_var("QZWALL_COOKIE", "uin=o1;skey=k");
        let mut cfg = Config::default();
        cfg.apply_env();
        std::env::remove_var("QZWALL_ADMIN_PASSWORD");
        std::env::remove_var("QZWALL_COOKIE");
        assert_eq!(cfg.web.admin_password, "hunter2");
        assert_eq!(cfg.qzone.cookie, "uin=o1;skey=k");
    }

    #[test]
    fn censor_file_skips_comments_and_blank_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("words.txt");
        std::fs::write(&path, "# banned\n  Spam \n\nscam\n").unwrap();
        let censor = Censor::load(&CensorConfig { words: vec!["Ads".into()], words_file: Some(path) }).unwrap();
        assert_eq!(censor.check_censor("Buy SPAM now"), Some("spam"));
        assert_eq!(censor.check_censor("free ADS"), Some("ads"));
        assert_eq!(censor.check_censor("hello"), None);
        assert_eq!(censor.check_censor("# banned"), None);
    }

    #[test]
    fn configured_words_take_effect_without_extra_switches() {
        let cfg: Config = serde_json::from_str(r#"{"censor": {"words": ["spam"]}}"#).unwrap();
        let censor = Censor::load(&cfg.censor).unwrap();
        assert_eq!(censor.check_censor("buy spam"), Some("spam"));

        let open = Censor::load(&Config::default().censor).unwrap();
        assert_eq!(open.check_censor("buy spam"), None);
    }
}
