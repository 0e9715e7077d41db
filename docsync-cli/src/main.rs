use clap::{Parser, Subcommand};
use docsync_core::config::Config;
use docsync_core::resolver::{Direction, DirectionHint};
use docsync_core::AppContext;
use owo_colors::OwoColorize;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "docsync")]
#[command(version = "0.1.0")]
#[command(about = "Bidirectional document sync between a cloud and a local endpoint", long_about = None)]
struct Cli {
    /// Path to a YAML configuration file, overlaid with environment variables.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a starter configuration file and state database path.
    Init {
        #[arg(default_value = "docsync.yaml")]
        path: PathBuf,
    },
    /// Verify connectivity to the state store and both endpoints.
    Test,
    /// Run a one-off sync pass.
    Sync {
        #[arg(long)]
        doctype: Option<String>,
        #[arg(long)]
        docname: Option<String>,
        #[arg(long, value_enum)]
        direction: Option<CliDirection>,
        #[arg(long)]
        limit: Option<u32>,
    },
    /// Print sync status counts and queue depth.
    Status,
    /// List unresolved conflicts.
    Conflicts,
    /// Run the webhook intake server and background worker until interrupted.
    Webhook,
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum CliDirection {
    #[value(name = "c->l")]
    CloudToLocal,
    #[value(name = "l->c")]
    LocalToCloud,
    Auto,
}

const EXIT_OK: u8 = 0;
const EXIT_GENERIC: u8 = 1;
const EXIT_CONFIG: u8 = 2;
const EXIT_CONNECTIVITY: u8 = 3;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{}: {e}", "configuration error".red());
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    docsync_core::logging::init_tracing(&config);

    match run(cli.command, config).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("{}: {e}", "error".red());
            ExitCode::from(EXIT_GENERIC)
        }
    }
}

async fn run(command: Commands, config: Config) -> anyhow::Result<u8> {
    match command {
        Commands::Init { path } => {
            init_config_file(&path)?;
            println!("{} wrote {}", "done:".green(), path.display());
            Ok(EXIT_OK)
        }
        Commands::Test => cmd_test(config).await,
        Commands::Sync {
            doctype,
            docname,
            direction,
            limit,
        } => cmd_sync(config, doctype, docname, direction, limit).await,
        Commands::Status => cmd_status(config).await,
        Commands::Conflicts => cmd_conflicts(config).await,
        Commands::Webhook => cmd_webhook(config).await,
    }
}

fn init_config_file(path: &std::path::Path) -> anyhow::Result<()> {
    let template = r#"# docsync configuration - see README for the full option reference.
doctypes:
  - Customer
conflict_resolution: latest_timestamp
batch_size: 50
state_db_path: docsync.db
log_level: info

# cloud:
#   url: https://cloud.example.com
#   api_key: ""
#   api_secret: ""
# local:
#   url: http://localhost:8000
#   api_key: ""
#   api_secret: ""
"#;
    std::fs::write(path, template)?;
    Ok(())
}

async fn bootstrap(config: Config) -> Result<AppContext, u8> {
    AppContext::bootstrap(config).await.map_err(|e| {
        eprintln!("{}: {e}", "configuration error".red());
        EXIT_CONFIG
    })
}

async fn cmd_test(config: Config) -> anyhow::Result<u8> {
    let ctx = match bootstrap(config).await {
        Ok(ctx) => ctx,
        Err(code) => return Ok(code),
    };

    let results = ctx.health_monitor().run_checks().await;
    let mut all_healthy = true;
    for r in &results {
        if r.healthy {
            println!("{} {} ({:?}) - {}", "ok".green(), r.name, r.duration, r.message);
        } else {
            all_healthy = false;
            println!("{} {} ({:?}) - {}", "fail".red(), r.name, r.duration, r.message);
        }
    }

    Ok(if all_healthy { EXIT_OK } else { EXIT_CONNECTIVITY })
}

async fn cmd_sync(
    config: Config,
    doctype: Option<String>,
    docname: Option<String>,
    direction: Option<CliDirection>,
    limit: Option<u32>,
) -> anyhow::Result<u8> {
    let ctx = match bootstrap(config).await {
        Ok(ctx) => ctx,
        Err(code) => return Ok(code),
    };

    let hint = match direction {
        Some(CliDirection::CloudToLocal) => DirectionHint::Cloud,
        Some(CliDirection::LocalToCloud) => DirectionHint::Local,
        Some(CliDirection::Auto) | None => DirectionHint::None,
    };

    match (doctype, docname) {
        (Some(doctype), Some(docname)) => {
            let outcome = ctx.executor.sync_one(&doctype, &docname, hint).await;
            print_outcome(&doctype, &docname, &outcome);
            Ok(if outcome.is_synced() || matches!(outcome, docsync_core::executor::Outcome::Skipped(_)) {
                EXIT_OK
            } else {
                EXIT_GENERIC
            })
        }
        (Some(doctype), None) => {
            let summary = ctx.executor.sync_doctype(&doctype, limit).await;
            print_summary(&doctype, &summary);
            Ok(if summary.failed == 0 { EXIT_OK } else { EXIT_GENERIC })
        }
        (None, _) => {
            let summary = ctx.executor.sync_all().await;
            print_summary("all configured doctypes", &summary);
            Ok(if summary.failed == 0 { EXIT_OK } else { EXIT_GENERIC })
        }
    }
}

fn print_outcome(doctype: &str, docname: &str, outcome: &docsync_core::executor::Outcome) {
    use docsync_core::executor::Outcome;
    match outcome {
        Outcome::Synced(Direction::CloudToLocal) => {
            println!("{} {}/{} synced c->l", "ok".green(), doctype, docname)
        }
        Outcome::Synced(Direction::LocalToCloud) => {
            println!("{} {}/{} synced l->c", "ok".green(), doctype, docname)
        }
        Outcome::Skipped(reason) => println!("{} {}/{}: {reason}", "skip".yellow(), doctype, docname),
        Outcome::Conflict => println!("{} {}/{}: manual resolution required", "conflict".red(), doctype, docname),
        Outcome::Failed(e) => println!("{} {}/{}: {e}", "fail".red(), doctype, docname),
    }
}

fn print_summary(label: &str, summary: &docsync_core::executor::Summary) {
    println!(
        "{label}: {} synced, {} skipped, {} conflict, {} failed",
        summary.synced.to_string().green(),
        summary.skipped,
        summary.conflict.to_string().yellow(),
        summary.failed.to_string().red(),
    );
}

async fn cmd_status(config: Config) -> anyhow::Result<u8> {
    let ctx = match bootstrap(config).await {
        Ok(ctx) => ctx,
        Err(code) => return Ok(code),
    };

    let counts = ctx.store.status_counts().await?;
    println!("{}", "sync record status".bold());
    for (status, count) in &counts {
        println!("  {status}: {count}");
    }

    let pending = ctx.store.pending_webhook_count().await?;
    println!("{}", "webhook queue".bold());
    println!("  pending: {pending}");

    Ok(EXIT_OK)
}

async fn cmd_conflicts(config: Config) -> anyhow::Result<u8> {
    let ctx = match bootstrap(config).await {
        Ok(ctx) => ctx,
        Err(code) => return Ok(code),
    };

    let conflicts = ctx.store.open_conflicts().await?;
    if conflicts.is_empty() {
        println!("{}", "no unresolved conflicts".green());
        return Ok(EXIT_OK);
    }

    for c in &conflicts {
        println!(
            "{} {}/{} detected {}",
            "conflict".red(),
            c.doctype,
            c.docname,
            c.detected_at
        );
    }
    Ok(EXIT_OK)
}

async fn cmd_webhook(config: Config) -> anyhow::Result<u8> {
    let ctx = match bootstrap(config).await {
        Ok(ctx) => ctx,
        Err(code) => return Ok(code),
    };

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let worker = ctx.worker();
    let worker_handle = tokio::spawn(async move { worker.run(shutdown_rx).await });

    let router = ctx.webhook_router();
    let addr = format!("{}:{}", ctx.config.webhook_host, ctx.config.webhook_port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    println!("{} listening on {addr}", "webhook:".green());

    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received");
    });

    if let Err(e) = server.await {
        tracing::error!(error = %e, "webhook server exited with an error");
    }

    let _ = shutdown_tx.send(true);
    let _ = worker_handle.await;

    Ok(EXIT_OK)
}
