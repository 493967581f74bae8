//! simuser - run simulated users against an analytics engine
//!
//! Each user connects, opens the configured app, subscribes sheets and
//! objects, waits for everything to settle, and resets. Repeated for the
//! configured number of iterations.
//!
//! ## Usage
//!
//! ```bash
//! simuser --config simulation.toml
//! simuser --server localhost:4848 --app sales.qvf --users 10 --iterations 5
//! ```

use anyhow::{bail, Context};
use clap::Parser;
use simuser_session::{
    NoDefinitions, ObjectKind, Session, SessionConfig, SimulationConfig, WsTransport,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "simuser")]
#[command(about = "Simulated users for an analytics engine")]
struct Args {
    /// Path to simulation config file
    #[arg(short, long, env = "SIMUSER_CONFIG")]
    config: Option<PathBuf>,

    /// Engine host, overrides the config
    #[arg(long, env = "SIMUSER_SERVER")]
    server: Option<String>,

    /// App to open, overrides the config
    #[arg(long, env = "SIMUSER_APP")]
    app: Option<String>,

    /// Concurrent users
    #[arg(long)]
    users: Option<usize>,

    /// Iterations per user
    #[arg(long)]
    iterations: Option<usize>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("simuser_session=info".parse()?),
        )
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => SimulationConfig::load(path)?,
        None => match (&args.server, &args.app) {
            (Some(server), Some(app)) => SimulationConfig {
                users: 1,
                iterations: 1,
                session: SessionConfig::new(server.clone(), app.clone()),
                sheets: Vec::new(),
                objects: Vec::new(),
            },
            _ => bail!("either --config or both --server and --app are required"),
        },
    };

    // Apply CLI overrides
    if let Some(server) = args.server {
        config.session.server = server;
    }
    if let Some(app) = args.app {
        config.session.app = app;
    }
    if let Some(users) = args.users {
        config.users = users;
    }
    if let Some(iterations) = args.iterations {
        config.iterations = iterations;
    }
    config.validate()?;

    info!(
        server = %config.session.server,
        app = %config.session.app,
        users = config.users,
        iterations = config.iterations,
        "Starting simulation"
    );

    let started = Instant::now();
    let config = Arc::new(config);
    let mut users = Vec::with_capacity(config.users);
    for user in 0..config.users {
        let config = Arc::clone(&config);
        users.push(tokio::spawn(async move { run_user(user, &config).await }));
    }

    let mut failed_actions = 0;
    for handle in users {
        failed_actions += handle.await.context("user task panicked")?;
    }

    info!(
        elapsed_ms = started.elapsed().as_millis() as u64,
        failed_actions,
        "Simulation finished"
    );
    if failed_actions > 0 {
        bail!("{} actions failed", failed_actions);
    }
    Ok(())
}

/// Run every iteration for one user. Returns the number of failed actions.
async fn run_user(user: usize, config: &SimulationConfig) -> usize {
    let session = Session::new(
        config.session.clone(),
        Arc::new(WsTransport::new().with_connect_timeout(config.session.request_timeout())),
        Arc::new(NoDefinitions),
    );
    let mut failed = 0;

    for iteration in 0..config.iterations {
        session.begin_action("open app");
        let opened = async {
            session.connect().await?;
            session.open_app().await?;
            session.subscribe_objects(ObjectKind::Sheet, &config.sheets).await?;
            session
                .subscribe_objects(ObjectKind::GenericObject, &config.objects)
                .await
        }
        .await;
        if let Err(e) = opened {
            session.executor().action().fail(e);
        }

        let report = session.finish_action().await;
        if report.failed() {
            failed += 1;
            for e in &report.errors {
                error!(user, iteration, error = %e, "Action failed");
            }
        }
        for w in &report.warnings {
            warn!(user, iteration, warning = %w, "Action warning");
        }

        session.reset().await;
    }

    info!(user, session = %session.id(), failed, "User finished");
    failed
}
