use anyhow::Result;
use clap::Parser;
use tracing::{error, info, warn};
use warden::preflight::run_preflight;
use warden::{EventBusError, Supervisor, WardenConfig};

#[derive(Parser, Debug)]
#[command(name = "warden")]
#[command(about = "Starts and supervises the local vector store and LLM runtime")]
#[command(version)]
#[command(long_about = "Warden launches the vector-store and LLM runtime services a host \
application depends on, verifies that they answer health checks, restarts them behind a \
circuit breaker, and keeps the host running in a documented degraded mode when a service \
cannot be brought up.")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "warden.toml", help = "Path to TOML configuration file")]
    config: String,

    /// Enable debug logging (most verbose)
    #[arg(short, long, help = "Enable debug level logging")]
    debug: bool,

    /// Enable verbose logging (info level)
    #[arg(short, long, help = "Enable verbose info level logging")]
    verbose: bool,

    /// Enable quiet mode (errors only)
    #[arg(short, long, help = "Enable quiet mode - only log errors")]
    quiet: bool,

    /// Validate configuration and exit
    #[arg(long, help = "Validate configuration file and exit without starting services")]
    validate_config: bool,

    /// Print default configuration and exit
    #[arg(long, help = "Print default configuration in TOML format and exit")]
    print_config: bool,

    /// Dry run mode - run pre-flight checks only
    #[arg(long, help = "Run pre-flight checks, print the report and exit")]
    dry_run: bool,

    /// Override log format (json, pretty, compact)
    #[arg(long, value_name = "FORMAT", help = "Log output format: json, pretty, or compact")]
    log_format: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_config {
        print_default_config()?;
        return Ok(());
    }

    init_logging(&args)?;

    info!("Starting warden v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration file: {}", args.config);

    let config = match WardenConfig::load_from_file(&args.config) {
        Ok(config) => {
            info!("Configuration loaded successfully from: {}", args.config);
            config
        }
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    if let Err(e) = config.validate() {
        error!("Configuration validation failed: {}", e);
        eprintln!("✗ Configuration validation failed: {}", e);
        std::process::exit(1);
    }

    if args.validate_config {
        println!("✓ Configuration is valid");
        return Ok(());
    }

    if args.dry_run {
        let report = run_preflight(&config).await;
        println!("{}", serde_json::to_string_pretty(&report)?);
        if report.passed() {
            println!("✓ Pre-flight checks passed");
        } else {
            println!("✗ {} pre-flight check(s) failed", report.failures().count());
        }
        return Ok(());
    }

    let mut warden = Supervisor::new(config).map_err(|e| {
        error!("Failed to create supervisor: {}", e);
        e
    })?;

    let mut events = warden.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => info!("{}", event.description()),
                Err(EventBusError::Lagged { skipped }) => {
                    warn!("Event log skipped {} events", skipped)
                }
                Err(EventBusError::ChannelClosed) => break,
            }
        }
    });

    match warden.start().await {
        Ok(report) => {
            if report.degraded {
                warn!(
                    "Running in degraded mode with {}/{} services",
                    report.running_count(),
                    report.services.len()
                );
            } else {
                info!("All services running");
            }
        }
        Err(e) => {
            error!("Startup failed: {}", e);
            warden.shutdown().await;
            std::process::exit(1);
        }
    }

    let reason = warden.run().await.map_err(|e| {
        error!("Supervisor error during execution: {}", e);
        e
    })?;

    info!("Warden exited after {:?}", reason);
    Ok(())
}

fn init_logging(args: &Args) -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

    let log_level = if args.debug {
        "debug"
    } else if args.verbose {
        "info"
    } else if args.quiet {
        "error"
    } else {
        "warn"
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("warden={}", log_level)));

    let fmt_layer = match args.log_format.as_deref() {
        Some("json") => fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .boxed(),
        Some("compact") => fmt::layer()
            .compact()
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .boxed(),
        Some("pretty") | None => fmt::layer()
            .pretty()
            .with_target(true)
            .with_thread_ids(args.debug)
            .with_file(args.debug)
            .with_line_number(args.debug)
            .boxed(),
        Some(format) => {
            eprintln!("Warning: Unknown log format '{}', using default", format);
            fmt::layer()
                .with_target(true)
                .with_thread_ids(args.debug)
                .with_file(args.debug)
                .with_line_number(args.debug)
                .boxed()
        }
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(env_filter)
        .init();

    Ok(())
}

/// Print default configuration in TOML format
fn print_default_config() -> Result<()> {
    println!("# Warden Configuration File");
    println!("# Every option with its default value");
    println!();
    print!("{}", WardenConfig::default().to_toml()?);
    Ok(())
}
