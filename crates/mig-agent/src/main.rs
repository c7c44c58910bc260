use anyhow::Result;
use clap::Parser;
use mig_agent::app::ApplicationBuilder;
use mig_agent::config::load_catalog;
use mig_agent::config::CatalogArgs;
use mig_agent::config::Cli;
use mig_agent::config::Commands;
use mig_agent::config::DaemonArgs;
use mig_agent::logging;
use utils::version;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon(daemon_args) => run_daemon(*daemon_args).await,
        Commands::ValidateCatalog(catalog_args) => run_validate_catalog(catalog_args),
    }
}

async fn run_daemon(daemon_args: DaemonArgs) -> Result<()> {
    let _guard = logging::init(daemon_args.log_file.as_deref())?;

    tracing::info!(
        node = %daemon_args.node_name,
        branch = version::branch().unwrap_or("unknown"),
        "Starting MIG agent {}",
        &**version::VERSION
    );

    let agent = ApplicationBuilder::new(daemon_args).build().await?;
    agent.run().await
}

fn run_validate_catalog(catalog_args: CatalogArgs) -> Result<()> {
    utils::logging::init();

    let catalog = load_catalog(catalog_args.known_geometries_file.as_deref())?;
    for model in catalog.models() {
        println!("{model}:");
        for geometry in catalog.allowed_for(model) {
            println!("  - {geometry}");
        }
    }
    Ok(())
}
