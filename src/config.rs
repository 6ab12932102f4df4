//! Configuração do agente carregada a partir de `agent.toml`.
//!
//! A struct [`AgentConfig`] contém todos os parâmetros configuráveis.
//! Valores não presentes no arquivo usam defaults sensíveis.
//! A variável de ambiente `AGENT_SERVER_URL` tem precedência sobre o arquivo;
//! as flags da CLI têm precedência sobre ambos.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::state_machine::{CleanupStrategy, RetryConfig};

/// Nome do arquivo procurado no diretório atual quando `--config` não é usado.
pub const DEFAULT_CONFIG_FILE: &str = "agent.toml";

/// Variável de ambiente que sobrescreve `server_url`.
pub const SERVER_URL_ENV: &str = "AGENT_SERVER_URL";

/// Configuração de nível superior carregada de `agent.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// URL base do servidor de jobs.
    pub server_url: String,

    /// Diretório sob o qual cada job recebe `<job_id>/`.
    pub job_directory_root: PathBuf,

    /// O que remover do diretório do job ao final.
    pub cleanup_strategy: CleanupStrategy,

    /// Retentativas das chamadas ao servidor.
    pub retry: RetryConfig,

    /// Intervalo entre heartbeats, em segundos.
    pub heartbeat_interval_secs: u64,

    /// Espera entre tentativas de entrega de um evento.
    pub event_retry_backoff_ms: u64,

    /// Tempo máximo para esvaziar a fila de eventos no encerramento.
    pub event_drain_timeout_ms: u64,

    /// Tempo dado ao job após o SIGINT antes do kill forçado.
    pub kill_grace_period_secs: u64,

    pub connect_timeout_secs: u64,

    pub request_timeout_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:8080".to_string(),
            job_directory_root: PathBuf::from("/tmp/jobs"),
            cleanup_strategy: CleanupStrategy::default(),
            retry: RetryConfig::default(),
            heartbeat_interval_secs: 5,
            event_retry_backoff_ms: 1000,
            event_drain_timeout_ms: 10_000,
            kill_grace_period_secs: 10,
            connect_timeout_secs: 10,
            request_timeout_secs: 30,
        }
    }
}

impl AgentConfig {
    /// Carrega a configuração de `path`, ou de `agent.toml` no diretório atual.
    /// Usa valores padrão se nenhum arquivo for indicado e `agent.toml` não existir.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let default = Path::new(DEFAULT_CONFIG_FILE);
                if default.exists() {
                    Self::from_file(default)?
                } else {
                    Self::default()
                }
            }
        };

        // Variável de ambiente tem precedência sobre o arquivo de configuração.
        if let Ok(url) = std::env::var(SERVER_URL_ENV) {
            if !url.trim().is_empty() {
                config.server_url = url;
            }
        }

        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("invalid config file {}", path.display()))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn event_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.event_retry_backoff_ms)
    }

    pub fn event_drain_timeout(&self) -> Duration {
        Duration::from_millis(self.event_drain_timeout_ms)
    }

    pub fn kill_grace_period(&self) -> Duration {
        Duration::from_secs(self.kill_grace_period_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
