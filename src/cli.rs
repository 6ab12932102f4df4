//! Interface de linha de comando do agente baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] (exec, resolve)
//! e flags globais (--config, --server-url, --cleanup, --max-retries, --verbose).

use std::path::PathBuf;

use anyhow::{Result, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::state_machine::{CleanupStrategy, JobRequest, JobSource};

/// Agente de execução de jobs: conduz um único job do claim até o fim.
#[derive(Debug, Parser)]
#[command(name = "job-agent", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Caminho do arquivo de configuração (padrão: `agent.toml`).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// URL base do servidor de jobs.
    #[arg(long, global = true)]
    pub server_url: Option<String>,

    /// Diretório raiz dos diretórios de job.
    #[arg(long, global = true)]
    pub job_directory_root: Option<PathBuf>,

    /// Estratégia de limpeza do diretório do job.
    #[arg(long, global = true)]
    pub cleanup: Option<CleanupArg>,

    /// Número máximo de retentativas em caso de falha transitória.
    #[arg(long, global = true)]
    pub max_retries: Option<u32>,

    /// Habilita saída detalhada (verbose).
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

/// Argumento de limpeza aceito pela CLI, mapeado para [`CleanupStrategy`].
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum CleanupArg {
    /// Mantém o diretório do job intacto.
    None,
    /// Remove apenas as dependências baixadas.
    Dependencies,
    /// Remove o diretório do job inteiro.
    Full,
}

impl From<CleanupArg> for CleanupStrategy {
    fn from(arg: CleanupArg) -> Self {
        match arg {
            CleanupArg::None => CleanupStrategy::NoCleanup,
            CleanupArg::Dependencies => CleanupStrategy::Dependencies,
            CleanupArg::Full => CleanupStrategy::Full,
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Executa um job já submetido (--job-id) ou descrito pelos argumentos.
    Exec(JobArgs),

    /// Resolve a especificação de um job sem executá-lo e imprime o JSON.
    Resolve(JobArgs),
}

/// Descrição do job na linha de comando.
#[derive(Debug, Clone, Args)]
pub struct JobArgs {
    /// Id do job. Sozinho, executa um job já resolvido pelo servidor;
    /// com --name/--user, é o id pedido para o novo job.
    #[arg(long)]
    pub job_id: Option<String>,

    /// Nome do job.
    #[arg(long)]
    pub name: Option<String>,

    /// Usuário dono do job.
    #[arg(long)]
    pub user: Option<String>,

    /// Tag de seleção de comando (repetível).
    #[arg(long = "command-tag")]
    pub command_tags: Vec<String>,

    /// Tag de seleção de cluster (repetível).
    #[arg(long = "cluster-tag")]
    pub cluster_tags: Vec<String>,

    /// Tempo máximo de execução do job, em segundos.
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Conecta stdin/stdout/stderr do job ao terminal.
    #[arg(long, default_value_t = false)]
    pub interactive: bool,

    /// Argumentos repassados ao job (após `--`).
    #[arg(last = true)]
    pub job_args: Vec<String>,
}

impl JobArgs {
    fn is_request(&self) -> bool {
        self.name.is_some() || self.user.is_some()
    }

    /// Monta o pedido de job a partir dos argumentos.
    pub fn job_request(&self) -> Result<JobRequest> {
        let (Some(name), Some(user)) = (&self.name, &self.user) else {
            bail!("a job request needs both --name and --user");
        };
        Ok(JobRequest {
            requested_id: self.job_id.clone(),
            name: name.clone(),
            user: user.clone(),
            command_tags: self.command_tags.clone(),
            cluster_tags: self.cluster_tags.clone(),
            job_args: self.job_args.clone(),
            interactive: self.interactive,
            timeout_secs: self.timeout,
        })
    }

    /// Origem do job a executar.
    pub fn job_source(&self) -> Result<JobSource> {
        match (&self.job_id, self.is_request()) {
            (Some(job_id), false) => Ok(JobSource::Preresolved(job_id.clone())),
            (_, true) => Ok(JobSource::Request(self.job_request()?)),
            (None, false) => bail!("either --job-id or --name and --user are required"),
        }
    }
}
