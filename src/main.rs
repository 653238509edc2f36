//! RTOS Probe MCP Server - Main Entry Point

use clap::Parser;
use tracing::{info, error, debug};
use tracing_subscriber::{EnvFilter, fmt};
use rmcp::{ServiceExt, transport::stdio};

use rtos_probe::{
    Config,
    config::Args,
    tools::RtosProbeToolHandler,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse command line arguments
    let args = Args::parse();

    // Handle special flags first
    if args.generate_config {
        let config = Config::default();
        println!("{}", config.to_toml()?);
        return Ok(());
    }

    // Initialize logging
    init_logging(&args)?;

    info!("Starting RTOS Probe MCP Server v{}", env!("CARGO_PKG_VERSION"));
    debug!("Command line args: {:?}", args);

    // Load configuration
    let mut config = Config::load(args.config.as_ref())
        .map_err(|e| {
            error!("Failed to load configuration: {}", e);
            e
        })?;

    // Merge command line arguments into configuration
    config.merge_args(&args);

    if args.validate_config {
        config.validate()?;
        println!("Configuration is valid");
        return Ok(());
    }

    if args.show_config {
        println!("{}", config.to_toml()?);
        return Ok(());
    }

    // Validate final configuration
    config.validate()
        .map_err(|e| {
            error!("Configuration validation failed: {}", e);
            e
        })?;

    match &config.debugger.firmware {
        Some(elf) => info!("Firmware symbols: {}", elf.display()),
        None => info!("No firmware ELF configured, pass elf_path to connect"),
    }
    match config.rtos.registry_address {
        Some(addr) => info!("Thread registry at 0x{:08X}", addr),
        None => info!("Thread registry symbol: '{}'", config.rtos.registry_symbol),
    }
    info!(
        "Exception frame {:?}, max {} threads, pruning {}",
        config.rtos.exception_frame, config.rtos.max_tasks, config.rtos.prune_dead_tasks
    );
    info!(
        "Core file '{}' with {} region(s), dump on fault: {}",
        config.coredump.file_name,
        config.coredump.regions.len(),
        config.coredump.auto_on_fault
    );

    let service = RtosProbeToolHandler::new(config)
        .serve(stdio()).await.inspect_err(|e| {
            error!("Serving error: {:?}", e);
        })?;

    info!("RTOS Probe MCP Server started successfully");

    // Wait for the service to complete
    service.waiting().await?;

    info!("RTOS Probe MCP Server stopped, cleaning up");
    Ok(())
}

/// Initialize logging system
fn init_logging(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(false)
        .with_line_number(false);

    // Configure output destination; stdout carries the MCP stream
    if let Some(log_file) = &args.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)?;

        subscriber
            .with_writer(file)
            .init();

        eprintln!("Logging to file: {}", log_file.display());
    } else {
        subscriber
            .with_writer(std::io::stderr)
            .init();
    }

    debug!("Logging initialized with level: {}", args.log_level);
    Ok(())
}
