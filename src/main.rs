use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt};

use netpolicy::{
    config::{Command, Config, CycleArgs},
    cycle::{last_boundary_for, next_boundary_for},
    net::Collaborators,
    quota::spawn_quota_worker,
    service::NetworkPolicyService,
    state::JsonPolicyStore,
};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = netpolicy::config::Cli::parse();
    let cmd = cli.command.clone().unwrap_or(Command::Run);

    match cmd {
        Command::Run => run_engine(cli.config).await,
        Command::Cycle(args) => print_cycle(&cli.config, &args),
        Command::Dump => dump_snapshot(&cli.config),
    }
}

async fn run_engine(config: Config) -> Result<()> {
    let store = Arc::new(JsonPolicyStore::open(&config.data_dir)?);
    let persisted = store.load_or_init()?;
    info!(
        path = %store.path().display(),
        policies = persisted.network_policies.len(),
        uid_policies = persisted.uid_policies.len(),
        "loaded policy snapshot"
    );

    let deps = Collaborators::logging(store);
    let service = NetworkPolicyService::start(deps, persisted, config.service_options())
        .map_err(|e| anyhow::anyhow!("start policy engine: {e}"))?;
    service.system_ready().await;

    let quota = spawn_quota_worker(service.clone(), config.stats_poll_interval());
    info!(
        version = netpolicy::version::VERSION,
        poll_secs = config.stats_poll_interval_secs,
        "netpolicy running"
    );

    shutdown_signal().await;
    info!("shutting down");
    quota.shutdown().await;
    Ok(())
}

fn print_cycle(config: &Config, args: &CycleArgs) -> Result<()> {
    let timezone = args.timezone.unwrap_or(config.default_timezone);
    let at = args.at.unwrap_or_else(Utc::now);
    let last = last_boundary_for(args.cycle_day, timezone, at)?;
    let next = next_boundary_for(args.cycle_day, timezone, at)?;

    println!("timezone: {}", timezone.name());
    println!("at:       {}", at.to_rfc3339());
    println!("last:     {} ({})", last.to_rfc3339(), last.with_timezone(&timezone));
    println!("next:     {} ({})", next.to_rfc3339(), next.with_timezone(&timezone));
    Ok(())
}

fn dump_snapshot(config: &Config) -> Result<()> {
    let store = JsonPolicyStore::open(&config.data_dir)?;
    let persisted = store.load_or_init()?;
    println!("{}", serde_json::to_string_pretty(&persisted)?);
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).compact().init();
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
