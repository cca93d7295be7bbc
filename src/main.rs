use std::path::Path;
use std::sync::Arc;

use data_seeder::api::seeder_routes;
use data_seeder::client::{Controller, ControllerEvent, HttpApi, RunOutcome, SeederApi};
use data_seeder::config::SeederConfig;
use data_seeder::jobs::JobRegistry;
use data_seeder::jobs::builtin::register_demo_jobs;
use data_seeder::jobs::settings::Settings;
use data_seeder::orchestrator::Orchestrator;
use data_seeder::store::{LibSqlBackend, ProgressStore};
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const USAGE: &str = "\
Usage: data-seeder [command]

Commands:
  serve                     Run the REST server (default)
  jobs                      List registered jobs
  status [key]              Show global status, or one job's status
  run <key> [name=value..]  Start a job and poll it to completion
  resume <key>              Re-attach to a job that is still running
  cancel <key>              Cancel a running job
  reset <key>               Reset one job's data in batches
  reset-all                 Reset every job with data

Client commands talk to SEEDER_URL (default http://127.0.0.1:<SEEDER_PORT>).";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = SeederConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        std::process::exit(1);
    });
    let _log_guard = init_tracing(config.log_dir.as_deref());

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = args.first().map(String::as_str).unwrap_or("serve");
    let rest = args.get(1..).unwrap_or_default();

    match command {
        "serve" => serve(config).await,
        "-h" | "--help" | "help" => {
            println!("{USAGE}");
            Ok(())
        }
        other => run_client(&config, other, rest).await,
    }
}

/// Console logging plus an optional daily rolling file.
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "data-seeder.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .with(file_layer)
        .init();

    guard
}

async fn serve(config: SeederConfig) -> anyhow::Result<()> {
    eprintln!("🌱 Data Seeder v{}", env!("CARGO_PKG_VERSION"));

    // ── Database ─────────────────────────────────────────────────────────
    let backend = LibSqlBackend::new_local(&config.db_path)
        .await
        .unwrap_or_else(|e| {
            eprintln!(
                "Error: Failed to open database at {}: {}",
                config.db_path.display(),
                e
            );
            std::process::exit(1);
        });
    eprintln!("   Database: {}", config.db_path.display());

    if config.recover_on_startup {
        let abandoned = backend.abandon_running().await?;
        if abandoned > 0 {
            eprintln!("   Marked {abandoned} interrupted run(s) as cancelled");
        }
    }

    // ── Jobs ─────────────────────────────────────────────────────────────
    let registry = Arc::new(JobRegistry::new());
    register_demo_jobs(&registry, backend.connection()).await?;
    eprintln!("   Jobs: {} registered", registry.count());

    let store: Arc<dyn ProgressStore> = Arc::new(backend);
    let orchestrator = Arc::new(
        Orchestrator::new(registry, store).with_reset_batch_size(config.reset_batch_size),
    );

    // ── REST server ──────────────────────────────────────────────────────
    let app = seeder_routes(orchestrator).layer(CorsLayer::permissive());
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    eprintln!("   API: http://{addr}/api/jobs\n");
    tracing::info!(port = config.port, "Seeder API started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("Shutting down");
        })
        .await?;
    Ok(())
}

async fn run_client(config: &SeederConfig, command: &str, args: &[String]) -> anyhow::Result<()> {
    let base_url = std::env::var("SEEDER_URL")
        .unwrap_or_else(|_| format!("http://127.0.0.1:{}", config.port));
    let api: Arc<dyn SeederApi> = Arc::new(HttpApi::new(base_url));
    let controller = Arc::new(Controller::new(Arc::clone(&api), config));

    let key = || {
        args.first().map(String::as_str).ok_or_else(|| {
            anyhow::anyhow!("`{command}` needs a job key\n\n{USAGE}")
        })
    };

    match command {
        "jobs" => {
            for job in api.list_jobs().await? {
                println!(
                    "{:<16} {:<24} {:<10} total={} batch={}",
                    job.key, job.name, job.status.status, job.default_total, job.default_batch_size
                );
                if !job.dependents.is_empty() {
                    println!("{:<16} dependents: {}", "", job.dependents.join(", "));
                }
            }
        }
        "status" => match args.first() {
            Some(key) => {
                let status = api.get_status(key).await?;
                println!(
                    "{}: {} {}/{} ({:.1}%)",
                    status.job_key, status.status, status.processed, status.total, status.percentage
                );
                if let Some(message) = status.error_message {
                    println!("  error: {message}");
                }
            }
            None => {
                let global = api.get_global_status().await?;
                match (global.is_running, global.job_name) {
                    (true, Some(name)) => println!(
                        "Running: {name} {}/{} ({:.1}%)",
                        global.processed.unwrap_or(0),
                        global.total.unwrap_or(0),
                        global.percentage.unwrap_or(0.0)
                    ),
                    _ => println!("Idle"),
                }
            }
        },
        "cancel" => {
            let response = api.cancel_job(key()?).await?;
            println!("{}", response.message);
        }
        "run" => {
            let key = key()?;
            let settings = parse_settings(&args[1..])?;
            let printer = spawn_printer(&controller);
            let stopper = spawn_ctrl_c(Arc::clone(&controller), StopTarget::Job(key.to_string()));
            let outcome = controller.run_job(key, settings).await?;
            stopper.abort();
            finish(printer, outcome).await?;
        }
        "resume" => {
            let key = key()?;
            let printer = spawn_printer(&controller);
            match controller.resume(key).await? {
                Some(outcome) => finish(printer, outcome).await?,
                None => println!("{key} is not running"),
            }
        }
        "reset" => {
            let key = key()?;
            let printer = spawn_printer(&controller);
            let stopper = spawn_ctrl_c(Arc::clone(&controller), StopTarget::Reset(key.to_string()));
            let outcome = controller.run_reset(key).await?;
            stopper.abort();
            finish(printer, outcome).await?;
        }
        "reset-all" => {
            let printer = spawn_printer(&controller);
            let stopper = spawn_ctrl_c(Arc::clone(&controller), StopTarget::ResetAll);
            let outcome = controller.run_reset_all().await?;
            stopper.abort();
            finish(printer, outcome).await?;
        }
        other => anyhow::bail!("Unknown command `{other}`\n\n{USAGE}"),
    }
    Ok(())
}

/// Parse `name=value` pairs; values that read as JSON keep their type.
fn parse_settings(pairs: &[String]) -> anyhow::Result<Settings> {
    let mut settings = Settings::new();
    for pair in pairs {
        let (name, raw) = pair
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("Expected name=value, got `{pair}`"))?;
        let value = serde_json::from_str(raw)
            .unwrap_or_else(|_| serde_json::Value::String(raw.to_string()));
        settings.insert(name.trim().to_string(), value);
    }
    Ok(settings)
}

fn spawn_printer(controller: &Controller) -> tokio::task::JoinHandle<()> {
    let mut rx = controller.subscribe();
    tokio::spawn(async move {
        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return,
            };
            match event {
                ControllerEvent::Progress {
                    key,
                    percentage,
                    message,
                    ..
                } => eprintln!("[{key}] {percentage:>5.1}%  {message}"),
                ControllerEvent::Finished { .. } => return,
                ControllerEvent::LockChanged(_) => {}
            }
        }
    })
}

/// The loop a Ctrl-C should stop.
enum StopTarget {
    Job(String),
    Reset(String),
    ResetAll,
}

/// First Ctrl-C stops the loop and cancels the run on the server.
fn spawn_ctrl_c(controller: Arc<Controller>, target: StopTarget) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        let result = match &target {
            StopTarget::Job(key) => {
                eprintln!("Stopping {key}...");
                controller.stop(key).await
            }
            StopTarget::Reset(key) => {
                eprintln!("Stopping reset of {key}...");
                controller.stop_reset(key).await
            }
            StopTarget::ResetAll => {
                eprintln!("Stopping reset-all...");
                controller.stop_reset_all().await
            }
        };
        if let Err(e) = result {
            eprintln!("Cancel failed, the run continues on the server: {e}");
        }
    })
}

async fn finish(printer: tokio::task::JoinHandle<()>, outcome: RunOutcome) -> anyhow::Result<()> {
    printer.await.ok();
    match outcome {
        RunOutcome::Completed => println!("Done."),
        RunOutcome::Cancelled => println!("Cancelled."),
        RunOutcome::Failed(message) => anyhow::bail!("Failed: {message}"),
        RunOutcome::Blocked { message, .. } => anyhow::bail!("{message}"),
    }
    Ok(())
}
