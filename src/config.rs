use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// sqlx connection url, e.g. `sqlite://database/course.db`
    pub database_url: String,
    /// Directory rendered certificates are written to
    pub certificate_dir: PathBuf,
    /// Log directory, stdout when unset
    pub log_dir: Option<PathBuf>,
    pub payment: PaymentConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PaymentConfig {
    /// Where the gateway sends the student back after paying
    pub redirect_url: String,
    /// Lifetime of the pending payment stored in the student's session
    pub session_ttl_minutes: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: "sqlite://database/course.db".to_string(),
            certificate_dir: PathBuf::from("certificates"),
            log_dir: None,
            payment: PaymentConfig::default(),
        }
    }
}

impl Default for PaymentConfig {
    fn default() -> Self {
        Self {
            redirect_url: "http://127.0.0.1:8080/payment/callback".to_string(),
            session_ttl_minutes: 240,
        }
    }
}

impl Config {
    /// Read the TOML file if it exists, then apply `.env` / environment overrides.
    pub async fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let mut config = match tokio::fs::read_to_string(path).await {
            Ok(content) => toml::from_str::<Config>(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("config {} not found, using defaults", path.display());
                Config::default()
            }
            Err(e) => return Err(e.into()),
        };
        config.apply_env();
        Ok(config)
    }

    fn apply_env(&mut self) {
        let _ = dotenvy::dotenv();
        if let Ok(url) = dotenvy::var("DATABASE_URL") {
            self.database_url = url;
        }
        if let Ok(dir) = dotenvy::var("CERTIFICATE_DIR") {
            self.certificate_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = dotenvy::var("LOG_DIR") {
            self.log_dir = Some(PathBuf::from(dir));
        }
    }
}
