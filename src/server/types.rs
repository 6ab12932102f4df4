//! Tipos de dados trocados com o servidor de jobs.
//!
//! Todas as structs derivam `Serialize` e `Deserialize` para conversão JSON.
//! As especificações de job em si ficam em
//! [`state_machine`](crate::state_machine).

use serde::{Deserialize, Serialize};

/// Metadados do agente enviados no handshake e ao reivindicar um job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentMetadata {
    /// Identificador único desta instância do agente.
    pub agent_id: String,
    /// Versão do binário do agente.
    pub version: String,
    /// Nome do host onde o agente executa.
    pub hostname: String,
    /// PID do processo do agente.
    pub pid: u32,
}

impl AgentMetadata {
    /// Coleta os metadados do processo atual.
    pub fn current(agent_id: &str) -> Self {
        let hostname = std::env::var("HOSTNAME")
            .ok()
            .filter(|h| !h.trim().is_empty())
            .unwrap_or_else(|| "unknown".to_string());
        Self {
            agent_id: agent_id.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            hostname,
            pid: std::process::id(),
        }
    }
}

/// Resposta do handshake. `accepted = false` significa que o servidor
/// recusou este agente (ex.: versão não suportada).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeResponse {
    pub accepted: bool,
    #[serde(default)]
    pub message: String,
}

/// Resposta da reserva de um id de job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReserveResponse {
    pub job_id: String,
}

/// Corpo da requisição de claim de um job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimRequest {
    pub agent: AgentMetadata,
}

/// Corpo do heartbeat periódico.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub agent_id: String,
}

/// Resposta do heartbeat. O servidor usa este canal para repassar pedidos
/// de kill feitos pela sua API.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    #[serde(default)]
    pub kill_requested: bool,
}
