use clap::Parser;
use stapled_server::{Config, Stapled};
use std::process;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// stapled - OCSP stapling cache daemon
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(name = "stapled")]
struct Cli {
    /// Path to configuration file
    #[arg(value_name = "CONFIG", default_value = "config.json")]
    config_path: String,

    /// Validate configuration and exit (doesn't start the daemon)
    #[arg(short, long)]
    validate: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Load or create configuration (without logging first)
    let config = match Config::from_file(&cli.config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing_subscriber::registry()
                .with(EnvFilter::new("info"))
                .with(tracing_subscriber::fmt::layer())
                .init();

            if cli.validate {
                eprintln!("Configuration validation failed!");
                eprintln!("   Error: {}", e);
                process::exit(1);
            }

            if std::path::Path::new(&cli.config_path).exists() {
                error!("Failed to load {}: {}", cli.config_path, e);
                process::exit(1);
            }

            warn!("Could not load config file from: {}", cli.config_path);
            info!("Creating example configuration at: {}", cli.config_path);

            if let Err(e) = Config::example().to_file(&cli.config_path) {
                error!("Error creating example config: {}", e);
                process::exit(1);
            }

            info!("Please edit {} and restart stapled", cli.config_path);
            process::exit(0);
        }
    };

    if cli.validate {
        println!("Configuration validated successfully!");
        println!();
        println!("Configuration summary:");
        println!("  Listen: {}", config.http.addr);
        println!("  Certificates: {}", config.definitions.certificates.len());
        println!(
            "  Upstream responders: {}",
            config.fetcher.upstream_responders.len()
        );
        println!("  Log level: {}", config.log_level.as_deref().unwrap_or("info"));
        match (&config.disk.cache_folder, config.dont_cache) {
            (Some(folder), false) => println!("  Cache folder: {}", folder),
            _ => println!("  Cache folder: (disabled)"),
        }
        println!();

        if !config.definitions.certificates.is_empty() {
            println!("Certificates:");
            for definition in &config.definitions.certificates {
                println!("  {}", definition.display_name());
            }
        } else if config.fetcher.upstream_responders.is_empty() {
            println!("WARNING: No certificates and no upstream responders configured!");
        }

        process::exit(0);
    }

    let log_level = config.log_level.as_deref().unwrap_or("info");
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level)))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("stapled v{}", env!("CARGO_PKG_VERSION"));
    info!("Loaded configuration from: {}", cli.config_path);

    let daemon = match Stapled::new(config).await {
        Ok(daemon) => Arc::new(daemon),
        Err(e) => {
            error!("Failed to start stapled: {}", e);
            process::exit(1);
        }
    };

    info!(
        entries = daemon.cache().len(),
        unclaimed_responses = daemon.unclaimed_responses().len(),
        "Daemon started, press Ctrl+C to stop"
    );

    tokio::select! {
        result = daemon.clone().run() => {
            if let Err(e) = result {
                error!("Responder error: {}", e);
                process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
            daemon.shutdown();
        }
    }
}
