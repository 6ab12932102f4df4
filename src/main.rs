use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use job_agent::cli::{Cli, Command, JobArgs};
use job_agent::config::AgentConfig;
use job_agent::events::{AgentEventsService, EventSink};
use job_agent::listeners::{
    ConsoleListener, EventPublishingListener, LoggingListener, SpanListener,
};
use job_agent::server::ServerClient;
use job_agent::services::{
    AgentJobService, HttpHeartbeat, JobProcessManager, KillService, LocalJobSetup,
    LocalProcessManager,
};
use job_agent::state_machine::{
    Collaborators, ExecutionContext, JobExecutionEngine, JobStatus, KillSource, RetryPolicy,
};
use job_agent::ui::TerminalConsole;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(1)
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "job_agent=debug" } else { "job_agent=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(cli: &Cli) -> Result<AgentConfig> {
    let mut config = AgentConfig::load(cli.config.as_deref())?;
    if let Some(url) = &cli.server_url {
        config.server_url = url.clone();
    }
    if let Some(root) = &cli.job_directory_root {
        config.job_directory_root = root.clone();
    }
    if let Some(cleanup) = cli.cleanup {
        config.cleanup_strategy = cleanup.into();
    }
    if let Some(max_retries) = cli.max_retries {
        config.retry.max_retries = max_retries;
    }
    Ok(config)
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config = load_config(&cli)?;
    let client = Arc::new(
        ServerClient::new(
            &config.server_url,
            config.connect_timeout(),
            config.request_timeout(),
        )
        .context("failed to build server client")?,
    );

    match &cli.command {
        Command::Resolve(args) => resolve(&client, args).await,
        Command::Exec(args) => exec(&config, client, args).await,
    }
}

async fn resolve(client: &ServerClient, args: &JobArgs) -> Result<ExitCode> {
    let request = args.job_request()?;
    let spec = client
        .resolve_job_specification_dry_run(&request)
        .await
        .context("dry-run resolution failed")?;
    println!("{}", serde_json::to_string_pretty(&spec)?);
    Ok(ExitCode::SUCCESS)
}

async fn exec(config: &AgentConfig, client: Arc<ServerClient>, args: &JobArgs) -> Result<ExitCode> {
    let agent_id = Uuid::new_v4().to_string();
    let ctx = Arc::new(
        ExecutionContext::new(agent_id.clone(), args.job_source()?)
            .with_job_directory_root(config.job_directory_root.clone())
            .with_cleanup_strategy(config.cleanup_strategy),
    );
    info!(%agent_id, server = %config.server_url, "Starting job agent");

    let process: Arc<dyn JobProcessManager> =
        Arc::new(LocalProcessManager::new(config.kill_grace_period()));
    let kill = Arc::new(KillService::new(Arc::clone(&ctx), Arc::clone(&process)));
    let heartbeat = Arc::new(HttpHeartbeat::new(
        Arc::clone(&client),
        &agent_id,
        config.heartbeat_interval(),
        Arc::clone(&kill),
    ));
    let setup = Arc::new(
        LocalJobSetup::new(config.request_timeout()).context("failed to build download client")?,
    );
    let collaborators = Collaborators {
        jobs: Arc::clone(&client) as Arc<dyn AgentJobService>,
        setup,
        process,
        heartbeat,
    };

    let sink: Arc<dyn EventSink> = client;
    let (events, delivery) =
        AgentEventsService::start(&agent_id, sink, config.event_retry_backoff());

    let signals = tokio::spawn({
        let kill = Arc::clone(&kill);
        async move {
            shutdown_signal().await;
            kill.kill(KillSource::SystemSignal);
        }
    });

    let console = Arc::new(TerminalConsole::start());
    let engine = JobExecutionEngine::builder()
        .actions(collaborators.actions())
        .listener(Arc::new(
            ConsoleListener::new(console.clone()).with_job_source(ctx.job_source()),
        ))
        .listener(Arc::new(LoggingListener::with_current_dispatch()))
        .listener(Arc::new(SpanListener::new(&agent_id)))
        .listener(Arc::new(EventPublishingListener::new(Arc::clone(&ctx), events)))
        .retry_policy(RetryPolicy::new(config.retry.clone()))
        .build()?;

    let status = engine.run(&ctx).await;
    drop(engine);
    signals.abort();

    if !delivery.drain(config.event_drain_timeout()).await {
        warn!("Some events were not delivered to the server");
    }
    console.print_outcome(status, ctx.process_result());

    Ok(exit_code(status))
}

fn exit_code(status: JobStatus) -> ExitCode {
    match status {
        JobStatus::Succeeded => ExitCode::SUCCESS,
        JobStatus::Killed => ExitCode::from(2),
        _ => ExitCode::from(1),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}
