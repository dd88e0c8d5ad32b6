use std::process;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use nbpipe::cli::{
    compile_payload, format_compile_report, format_submission, serve_addr, submit_payload, Cli,
    Commands, ServeArgs,
};
use nbpipe::config::{load_settings, Settings};
use nbpipe::server::{create_router, AppState};
use nbpipe::submit::Scheduler;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize logging
    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    if let Err(e) = run(cli).await {
        error!("{:#}", e);
        process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    // Load .env file if specified, before settings expand ${VARS}
    if let Some(ref env_file) = cli.env_file {
        dotenvy::from_path(env_file)
            .with_context(|| format!("failed to load env file {}", env_file.display()))?;
    }

    let settings = load_settings(cli.config.as_deref()).context("failed to load settings")?;

    match cli.command {
        Commands::Serve(args) => serve(settings, &args).await,
        Commands::Submit(args) => {
            let scheduler = Scheduler::from_settings(settings)?;
            let cancel = CancellationToken::new();
            let on_interrupt = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupted, cancelling submission");
                    on_interrupt.cancel();
                }
            });

            let outcome = submit_payload(&scheduler, &args.payload, cancel)
                .await
                .with_context(|| format!("submission of {} failed", args.payload.display()))?;
            print!("{}", format_submission(&outcome));
            Ok(())
        }
        Commands::Compile(args) => {
            let report = compile_payload(&settings, &args.payload)
                .with_context(|| format!("failed to compile {}", args.payload.display()))?;
            let yaml = report.workflow.to_yaml()?;
            match args.output {
                Some(path) => {
                    std::fs::write(&path, yaml)
                        .with_context(|| format!("failed to write {}", path.display()))?;
                    print!("{}", format_compile_report(&report));
                    println!("\nWorkflow written to {}", path.display());
                }
                None => {
                    print!("{}", format_compile_report(&report));
                    println!("\n---\n{}", yaml);
                }
            }
            Ok(())
        }
    }
}

async fn serve(settings: Settings, args: &ServeArgs) -> anyhow::Result<()> {
    let addr = serve_addr(&settings, args);
    let scheduler = Scheduler::from_settings(settings)?;
    let app = create_router(AppState::new(scheduler));

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind to {}", addr))?;

    info!("Server listening on {}", addr);
    info!("Endpoints:");
    info!("  GET  /health     - Health check");
    info!("  GET  /status     - In-flight submissions");
    info!("  POST /scheduler  - Submit a pipeline graph");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await
        .context("server error")
}
