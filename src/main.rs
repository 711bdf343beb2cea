use rust_tapebackup::cli::Cli;
use rust_tapebackup::config::BackupConfig;
use rust_tapebackup::logger;
use rust_tapebackup::orchestrator::{BackupOrchestrator, Collaborators};
use rust_tapebackup::shell::{CommandRunner, DiagnosticLog};
use rust_tapebackup::Result;
use tracing::{debug, error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse_args();

    // Initialize logging system
    logger::init(args.verbose)?;

    debug!("tapebackup starting");

    match run(args).await {
        Ok(0) => {
            info!("Backup completed successfully");
            Ok(())
        }
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("Backup could not start: {}", e);
            std::process::exit(1);
        }
    }
}

async fn run(args: Cli) -> Result<i32> {
    let config = BackupConfig::load(args.config.as_deref())?;

    let diagnostics = DiagnosticLog::new();
    let runner = CommandRunner::new(config.changer.benign_stderr.clone(), diagnostics.clone());
    let parts = Collaborators::from_config(&config, runner);

    let mut orchestrator = BackupOrchestrator::new(config, parts, diagnostics);
    let outcome = orchestrator.run().await;
    debug!("Run ended in phase {}", orchestrator.phase());
    Ok(outcome.exit_code())
}
