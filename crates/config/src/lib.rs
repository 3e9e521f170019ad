use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

const APP_NAME: &str = "sifen-worker";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Postgres connection string. Overridden by `DATABASE_URL` when set.
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default)]
    pub sifen: SifenUrls,
    #[serde(default)]
    pub queue: QueueConfig,
    /// HTTP request timeout in milliseconds.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SifenUrls {
    pub recebe_lote: String,
    pub consulta_lote: String,
    pub evento: String,
    /// Base URL printed into the QR code of signed documents.
    pub qr_base: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// How long a status query waits before it becomes deliverable.
    #[serde(default = "default_query_delay_ms")]
    pub query_delay_ms: u64,
    /// Idle sleep between claim attempts when the queue is empty.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Claims older than this are considered abandoned and redelivered.
    #[serde(default = "default_visibility_timeout_ms")]
    pub visibility_timeout_ms: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            sifen: SifenUrls::default(),
            queue: QueueConfig::default(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl Default for SifenUrls {
    fn default() -> Self {
        Self {
            recebe_lote: "https://sifen-test.set.gov.py/de/ws/async/recibe-lote.wsdl".to_string(),
            consulta_lote: "https://sifen-test.set.gov.py/de/ws/consultas/consulta-lote.wsdl"
                .to_string(),
            evento: "https://sifen-test.set.gov.py/de/ws/eventos/evento.wsdl".to_string(),
            qr_base: "https://ekuatia.set.gov.py/consultas-test/qr?".to_string(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            query_delay_ms: default_query_delay_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            visibility_timeout_ms: default_visibility_timeout_ms(),
        }
    }
}

fn default_database_url() -> String {
    "postgres://localhost/sifen".to_string()
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_query_delay_ms() -> u64 {
    30_000
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_visibility_timeout_ms() -> u64 {
    300_000
}

impl AppConfig {
    /// Rejects configurations the worker cannot run with, reporting every
    /// problem at once.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();
        if self.database_url.trim().is_empty() {
            problems.push("database_url must not be empty");
        }
        if self.sifen.recebe_lote.trim().is_empty() {
            problems.push("sifen.recebe_lote must not be empty");
        }
        if self.sifen.consulta_lote.trim().is_empty() {
            problems.push("sifen.consulta_lote must not be empty");
        }
        if self.sifen.evento.trim().is_empty() {
            problems.push("sifen.evento must not be empty");
        }
        if self.queue.query_delay_ms == 0 {
            problems.push("queue.query_delay_ms must be positive");
        }
        if self.queue.poll_interval_ms == 0 {
            problems.push("queue.poll_interval_ms must be positive");
        }
        if !problems.is_empty() {
            bail!("invalid configuration: {}", problems.join("; "));
        }
        Ok(())
    }
}

pub fn load() -> Result<AppConfig> {
    let mut cfg: AppConfig = confy::load(APP_NAME, None).context("Failed to load app config")?;
    if let Ok(url) = std::env::var("DATABASE_URL") {
        if !url.trim().is_empty() {
            cfg.database_url = url;
        }
    }
    Ok(cfg)
}

pub fn store(cfg: &AppConfig) -> Result<()> {
    confy::store(APP_NAME, None, cfg).context("Failed to store app config")?;
    Ok(())
}
