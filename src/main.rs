use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use creditbot_config::Settings;
use creditbot_runtime::Runtime;
use tokio::time::MissedTickBehavior;
use tracing::level_filters::LevelFilter;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "creditbot", version, about = "Approves product credit requests posted in Slack")]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Process unhandled channel messages once and exit
    RunOnce {
        #[arg(long, default_value = "./config/example-config.yaml")]
        config: String,
    },
    /// Run every `bot.poll_interval_ms` until interrupted
    Poll {
        #[arg(long, default_value = "./config/example-config.yaml")]
        config: String,
    },
    /// Serve the HTTP control plane
    Serve {
        #[arg(long, default_value = "./config/example-config.yaml")]
        config: String,
    },
    /// Verify the hash chain of an audit log
    VerifyAudit { path: String },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Commands::RunOnce { config } => {
            let Some((_, runtime)) = start(&config).await else {
                return ExitCode::FAILURE;
            };
            match runtime.run_invocation().await {
                Ok(_) => ExitCode::SUCCESS,
                Err(e) => {
                    error!(error = %e, "run failed");
                    ExitCode::FAILURE
                }
            }
        }
        Commands::Poll { config } => {
            let Some((settings, runtime)) = start(&config).await else {
                return ExitCode::FAILURE;
            };
            poll(&runtime, settings.config.bot.poll_interval_ms).await
        }
        Commands::Serve { config } => {
            let Some(settings) = load(&config) else {
                return ExitCode::FAILURE;
            };
            match creditbot_runtime::serve(settings, shutdown_signal()).await {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    error!(error = %e, "server exited with error");
                    ExitCode::FAILURE
                }
            }
        }
        Commands::VerifyAudit { path } => match creditbot_runtime::verify_audit_chain(&path) {
            Ok(summary) => {
                println!("{summary}");
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("audit verification failed: {e}");
                ExitCode::FAILURE
            }
        },
    }
}

fn init_tracing(json: bool) {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.compact().init();
    }
}

fn load(config_path: &str) -> Option<Settings> {
    match creditbot_config::load_settings(config_path) {
        Ok(settings) => Some(settings),
        Err(e) => {
            error!(config = %config_path, error = %e, "failed to load config");
            None
        }
    }
}

async fn start(config_path: &str) -> Option<(Settings, Runtime)> {
    let settings = load(config_path)?;
    match Runtime::from_settings(&settings).await {
        Ok(runtime) => Some((settings, runtime)),
        Err(e) => {
            error!(error = %e, "startup failed");
            None
        }
    }
}

// A signal only stops the loop between runs; an in-flight run completes.
async fn poll(runtime: &Runtime, interval_ms: u64) -> ExitCode {
    let period = Duration::from_millis(interval_ms);
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    info!(interval_ms, "polling started");
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("shutdown requested; polling stopped");
                return ExitCode::SUCCESS;
            }
            _ = ticker.tick() => {
                if let Err(e) = runtime.run_invocation().await {
                    warn!(error = %e, "run failed; retrying at the next interval");
                }
            }
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "ctrl-c handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
