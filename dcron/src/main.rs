mod cli;
mod jobs;
mod scheduler;

use anyhow::Context;
use clap::Parser;
use cli::{Cli, Commands};
use coord::{etcd::EtcdClient, with_session, CoordinationClient, SessionElector, SessionLocker};
use jobs::{CounterJob, LeaderJob};
use scheduler::{Gate, Scheduler};
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_filter()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = cli.coord_config();
    config.validate().context("invalid configuration")?;
    info!("connecting to {}", config.endpoints.join(","));

    let client: Arc<dyn CoordinationClient> = Arc::new(EtcdClient::new(&config)?);
    run(&cli, client, shutdown_signal()).await
}

/// Runs the selected subcommand on a fresh session until `shutdown`
/// resolves. The session lease is revoked on every exit path.
async fn run<S>(cli: &Cli, client: Arc<dyn CoordinationClient>, shutdown: S) -> anyhow::Result<()>
where
    S: Future<Output = anyhow::Result<&'static str>>,
{
    let config = cli.coord_config();
    let outcome = with_session(client, config.session_ttl(), |session| async move {
        info!("session lease {} ttl {:?}", session.lease(), session.ttl());
        Ok(match &cli.command {
            Commands::RunWithElector => {
                let elector = SessionElector::new(session, config.election_prefix.as_str());
                run_with_elector(cli, Arc::new(elector), shutdown).await
            }
            Commands::RunWithLock => {
                let locker = SessionLocker::new(session, config.lock_prefix.as_str());
                run_with_lock(cli, Arc::new(locker), shutdown).await
            }
        })
    })
    .await
    .context("session")?;
    outcome
}

async fn run_with_elector<S>(
    cli: &Cli,
    elector: Arc<SessionElector>,
    shutdown: S,
) -> anyhow::Result<()>
where
    S: Future<Output = anyhow::Result<&'static str>>,
{
    info!("starting elector: {}", elector.id());

    let ctx = CancellationToken::new();
    let (campaign, mut campaign_err) =
        elector.spawn_campaign_loop(ctx.clone(), cli.campaign_interval());

    let mut scheduler = Scheduler::new(Gate::Elector(elector.clone()), cli.job_interval());
    scheduler.add_job(Arc::new(LeaderJob::new(elector.id())));
    let jobs = scheduler.start(ctx.clone());

    let result = tokio::select! {
        signal = shutdown => signal.map(|name| info!("received signal: {}", name)),
        err = &mut campaign_err => match err {
            Ok(e) => {
                error!("error: {}", e);
                Err(anyhow::Error::new(e).context("campaign loop failed"))
            }
            Err(_) => Err(anyhow::anyhow!("campaign loop exited without reporting")),
        },
    };

    ctx.cancel();
    let (campaign, jobs) = tokio::join!(campaign, jobs);
    log_join("campaign loop", campaign);
    log_join("scheduler", jobs);
    result
}

async fn run_with_lock<S>(cli: &Cli, locker: Arc<SessionLocker>, shutdown: S) -> anyhow::Result<()>
where
    S: Future<Output = anyhow::Result<&'static str>>,
{
    info!("starting locker");

    let ctx = CancellationToken::new();
    let mut scheduler = Scheduler::new(Gate::Locker(locker), cli.job_interval());
    scheduler.add_job(Arc::new(CounterJob::new(&cli.counter_file)));
    let jobs = scheduler.start(ctx.clone());

    let signal = shutdown.await;
    ctx.cancel();
    log_join("scheduler", jobs.await);
    info!("received signal: {}", signal?);
    Ok(())
}

fn log_join(task: &str, res: Result<(), JoinError>) {
    if let Err(e) = res {
        error!("{} task failed: {}", task, e);
    }
}

#[cfg(unix)]
async fn shutdown_signal() -> anyhow::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;
    let mut quit = signal(SignalKind::quit()).context("installing SIGQUIT handler")?;
    let mut terminate = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;

    Ok(tokio::select! {
        _ = interrupt.recv() => "SIGINT",
        _ = quit.recv() => "SIGQUIT",
        _ = terminate.recv() => "SIGTERM",
    })
}

#[cfg(not(unix))]
async fn shutdown_signal() -> anyhow::Result<&'static str> {
    tokio::signal::ctrl_c().await.context("listening for ctrl-c")?;
    Ok("ctrl-c")
}
