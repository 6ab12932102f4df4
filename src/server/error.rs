//! Tipos de erro para o cliente HTTP do servidor de jobs.
//!
//! Define [`ServerError`] com variantes para rate limiting, erros da API,
//! rejeições explícitas, erros de rede e respostas malformadas. A
//! classificação entre falhas transitórias e definitivas fica em
//! [`ServerError::is_transient`].

use std::time::Duration;

use thiserror::Error;

/// Erros que podem ocorrer ao interagir com o servidor.
///
/// - [`RateLimited`](ServerError::RateLimited): o servidor retornou HTTP 429
/// - [`ApiError`](ServerError::ApiError): qualquer outro erro HTTP (4xx/5xx)
/// - [`Rejected`](ServerError::Rejected): o servidor recusou a requisição (ex.: job já reivindicado)
/// - [`NetworkError`](ServerError::NetworkError): falha na camada de rede
/// - [`ParseError`](ServerError::ParseError): resposta que não pôde ser interpretada
#[derive(Debug, Error)]
pub enum ServerError {
    /// O servidor retornou HTTP 429 (rate limit).
    /// O campo `retry_after_ms` indica quantos milissegundos esperar antes de retentar.
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    /// Erro retornado pela API (ex.: 400 requisição inválida, 503 indisponível).
    #[error("API error (status {status}): {message}")]
    ApiError { status: u16, message: String },

    /// O servidor recusou explicitamente a requisição. Nunca é retentado.
    #[error("request rejected by server: {0}")]
    Rejected(String),

    /// Falha de rede subjacente (DNS, conexão recusada, timeout).
    #[error("network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    /// Corpo de resposta malformado.
    #[error("failed to parse server response: {0}")]
    ParseError(String),
}

impl ServerError {
    /// Falhas transitórias: rate limit, 5xx e erros de transporte.
    pub fn is_transient(&self) -> bool {
        match self {
            ServerError::RateLimited { .. } => true,
            ServerError::ApiError { status, .. } => *status >= 500,
            ServerError::NetworkError(e) => !e.is_builder() && !e.is_decode(),
            ServerError::Rejected(_) | ServerError::ParseError(_) => false,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ServerError::RateLimited { retry_after_ms } => {
                Some(Duration::from_millis(*retry_after_ms))
            }
            _ => None,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            ServerError::RateLimited { .. } => "RateLimited",
            ServerError::ApiError { .. } => "ApiError",
            ServerError::Rejected(_) => "Rejected",
            ServerError::NetworkError(_) => "NetworkError",
            ServerError::ParseError(_) => "ParseError",
        }
    }
}
