use clap::{Parser, Subcommand};
use tideway_scheduler::{HttpPushScheduler, sync_schedules};
use tideway_server::config::loader::{DEFAULT_CONFIG_PATH, load_config};
use tideway_server::services::build_catalog;
use tideway_server::{AppConfig, ServerBuilder};

#[derive(Debug, Parser)]
#[command(name = "tideway-server", version, about = "Rate limiting, job scheduling and diagnostics service")]
struct Cli {
    /// Configuration file
    #[arg(long, env = "TIDEWAY_CONFIG", default_value = DEFAULT_CONFIG_PATH, global = true)]
    config: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the HTTP server and the primary scheduler (default)
    Serve,
    /// Reconcile push-scheduler registrations with the job catalog
    SyncSchedules {
        /// Apply deletions without asking
        #[arg(long)]
        auto_approve: bool,
    },
    /// Load and validate configuration, then exit
    CheckConfig,
}

#[tokio::main]
async fn main() {
    // .env is optional
    if let Err(e) = dotenvy::dotenv()
        && !matches!(e, dotenvy::Error::Io(ref io_err) if io_err.kind() == std::io::ErrorKind::NotFound)
    {
        eprintln!("Warning: Failed to load .env file: {e}");
    }

    tideway_server::observability::init_tracing();

    let cli = Cli::parse();

    let cfg = match load_config(Some(&cli.config)) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            std::process::exit(2);
        }
    };
    tracing::info!(path = %cli.config, environment = %cfg.environment, "Configuration loaded");
    tideway_server::observability::apply_logging_level(&cfg.logging.level);

    let code = match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(cfg).await,
        Command::SyncSchedules { auto_approve } => sync(cfg, auto_approve).await,
        Command::CheckConfig => check_config(&cfg),
    };
    std::process::exit(code);
}

async fn serve(cfg: AppConfig) -> i32 {
    tideway_server::metrics::init_metrics();

    let server = match ServerBuilder::new().with_config(cfg).build() {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Server initialization failed: {e}");
            return 2;
        }
    };

    if let Err(err) = server.run().await {
        eprintln!("Server error: {err:#}");
        return 1;
    }
    0
}

async fn sync(cfg: AppConfig, auto_approve: bool) -> i32 {
    let Some(secondary) = cfg.scheduler.secondary.as_ref() else {
        eprintln!("Configuration error: scheduler.secondary is not configured");
        return 2;
    };
    let catalog = match build_catalog(&cfg) {
        Ok(catalog) => catalog,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            return 2;
        }
    };
    let scheduler = match HttpPushScheduler::new(secondary) {
        Ok(scheduler) => scheduler,
        Err(e) => {
            eprintln!("Push scheduler client failed: {e}");
            return 1;
        }
    };

    match sync_schedules(&scheduler, &catalog, secondary, auto_approve).await {
        Ok(report) => {
            match serde_json::to_string_pretty(&report) {
                Ok(text) => println!("{text}"),
                Err(e) => eprintln!("cannot render sync report: {e}"),
            }
            if !report.pending_deletions.is_empty() {
                eprintln!(
                    "{} deletion(s) pending; rerun with --auto-approve to apply",
                    report.pending_deletions.len()
                );
            }
            0
        }
        Err(e) => {
            eprintln!("Schedule sync failed: {e}");
            1
        }
    }
}

fn check_config(cfg: &AppConfig) -> i32 {
    match build_catalog(cfg) {
        Ok(catalog) => {
            println!(
                "configuration OK: environment={}, jobs={}, secondary={}, notifications={}",
                cfg.environment,
                catalog.jobs().len(),
                if cfg.scheduler.secondary.is_some() { "configured" } else { "absent" },
                if cfg.notifications.is_some() { "webhook" } else { "log" },
            );
            0
        }
        Err(e) => {
            eprintln!("Configuration error: {e}");
            2
        }
    }
}
