use std::{
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use clap::Parser;
use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use fetchgate::{
    adapters::{GatewayServer, HttpClientAdapter},
    config::{ServerConfig, ServerConfigValidator, loader},
    ports::http_client::HttpClient,
    tracing_setup,
    utils::{AdmissionGate, GateError, ShutdownCause, ShutdownCoordinator, os_stop_signal},
};

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Option<Commands>,

    #[clap(flatten)]
    serve: ServeArgs,
}

#[derive(clap::Args, Debug, Default)]
struct ServeArgs {
    /// Configuration file; without one, defaults and FETCHGATE__* variables are used
    #[clap(short, long)]
    config: Option<String>,

    /// Override the configured listen address
    #[clap(short, long)]
    listen: Option<String>,

    /// Override the configured log output format
    #[clap(long, value_enum)]
    log_format: Option<LogFormat>,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum LogFormat {
    Json,
    Pretty,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Validate configuration file
    Validate {
        /// Configuration file to validate
        #[clap(short, long, default_value = "config.toml")]
        config: String,
    },
    /// Initialize a new configuration file
    Init {
        /// Output path for the new config file
        #[clap(short, long, default_value = "config.toml")]
        config: String,
    },
    /// Start the fetch server (default)
    Serve(ServeArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();

    match args.command {
        Some(Commands::Validate { config }) => validate_config_command(&config).await,
        Some(Commands::Init { config }) => init_config_command(&config).await,
        Some(Commands::Serve(serve_args)) => serve(serve_args).await,
        None => serve(args.serve).await,
    }
}

async fn serve(args: ServeArgs) -> Result<()> {
    let config_path = args.config;
    let mut config: ServerConfig = match &config_path {
        Some(path) => loader::load_config(path)
            .await
            .with_context(|| format!("Failed to load config from {path}"))?,
        None => loader::load_config_from_env().context("Failed to load config from environment")?,
    };
    if let Some(listen) = args.listen {
        config.listen_addr = listen;
    }
    if let Some(format) = args.log_format {
        config.logging.json = matches!(format, LogFormat::Json);
    }

    ServerConfigValidator::validate(&config).map_err(|e| eyre!("{e}"))?;

    tracing_setup::init_from_config(&config.logging)
        .map_err(|e| eyre!("Failed to initialize tracing: {}", e))?;

    match &config_path {
        Some(path) => tracing::info!("Loaded configuration from {path}"),
        None => tracing::info!("No config file given, using defaults and environment"),
    }

    let http_client: Arc<dyn HttpClient> = Arc::new(
        match &config.fetch.user_agent {
            Some(user_agent) => HttpClientAdapter::with_user_agent(user_agent),
            None => HttpClientAdapter::new(),
        }
        .context("Failed to create HTTP client adapter")?,
    );

    let server = GatewayServer::from_config(&config, http_client)
        .context("Failed to build fetch endpoint")?;

    let denied = Arc::new(AtomicU64::new(0));
    let gate_config = {
        let denied = denied.clone();
        config
            .admission
            .gate_config()
            .map_err(|e| eyre!(e))?
            .with_error_callback(move |err| {
                if matches!(err, GateError::AdmissionDenied(_)) {
                    denied.fetch_add(1, Ordering::Relaxed);
                }
            })
    };

    let gate = Arc::new(
        AdmissionGate::bind(config.listen_addr.as_str(), gate_config)
            .await
            .with_context(|| format!("Failed to bind to address {}", config.listen_addr))?,
    );

    let shutdown_timeout = config.shutdown.timeout().map_err(|e| eyre!(e))?;
    let coordinator = ShutdownCoordinator::with_timeout(shutdown_timeout);

    tracing::info!(
        "Starting fetchgate on {} (max connections: {}, max urls: {}, concurrency: {})",
        gate.local_addr(),
        config.admission.max_connections,
        config.fetch.max_urls,
        config.fetch.max_concurrency
    );

    let report = server
        .run(gate.clone(), &coordinator, os_stop_signal())
        .await;

    if tokio::time::timeout(shutdown_timeout, gate.wait())
        .await
        .is_err()
    {
        tracing::warn!(
            in_use = gate.in_use(),
            "Admitted connections still open after {:?}",
            shutdown_timeout
        );
    }

    tracing::info!(
        denied = denied.load(Ordering::Relaxed),
        clean = report.is_clean(),
        "Graceful shutdown completed"
    );

    match report.cause {
        ShutdownCause::ServerFailed(reason) => Err(eyre!("Server failed: {reason}")),
        ShutdownCause::StopRequested => Ok(()),
    }
}

/// Validate configuration file and exit
async fn validate_config_command(config_path: &str) -> Result<()> {
    println!("🔍 Validating configuration file: {config_path}");

    if !Path::new(config_path).exists() {
        eprintln!("❌ Error: Configuration file '{config_path}' not found");
        std::process::exit(1);
    }

    let config = match loader::load_config(config_path).await {
        Ok(config) => {
            println!("✅ Configuration parsing: OK");
            config
        }
        Err(e) => {
            eprintln!("❌ Configuration parsing failed:");
            eprintln!("   {e}");
            std::process::exit(1);
        }
    };

    match ServerConfigValidator::validate(&config) {
        Ok(()) => {
            println!("✅ Configuration validation: OK");
            println!();
            println!("📋 Configuration Summary:");
            println!("   • Listen Address: {}", config.listen_addr);
            println!("   • Max Connections: {}", config.admission.max_connections);
            println!("   • Max URLs per Request: {}", config.fetch.max_urls);
            println!("   • Fetch Concurrency: {}", config.fetch.max_concurrency);
            println!("   • Fetch Timeout: {}", config.fetch.fetch_timeout);
            println!("   • Request Deadline: {}", config.fetch.request_deadline);
            println!();
            println!("🎉 Configuration is valid and ready to use!");
            Ok(())
        }
        Err(e) => {
            eprintln!("❌ Configuration validation failed:");
            eprintln!("{e}");
            println!();
            println!("💡 Common fixes:");
            println!("   • Verify listen address format (e.g., '127.0.0.1:8080')");
            println!("   • Use humantime durations such as '500ms', '5s' or '1m'");
            println!("   • Keep fetch_timeout <= request_deadline <= join_timeout");
            std::process::exit(1);
        }
    }
}

/// Initialize a new configuration file
async fn init_config_command(config_path: &str) -> Result<()> {
    let path = Path::new(config_path);
    if path.exists() {
        eprintln!("❌ Error: Configuration file '{config_path}' already exists");
        std::process::exit(1);
    }

    let default_config = r#"# Fetchgate Configuration
# Every value can be overridden from the environment, e.g. FETCHGATE__FETCH__MAX_URLS=10

# The address to listen on
listen_addr = "0.0.0.0:8080"

[admission]
max_connections = 100
accept_timeout = "5s"

[fetch]
max_urls = 20
max_concurrency = 4
fetch_timeout = "1s"
request_deadline = "10s"
join_timeout = "30s"
max_body_bytes = 10485760
# user_agent = "fetchgate"

[shutdown]
timeout = "5s"

[logging]
level = "info"
json = true
"#;

    tokio::fs::write(path, default_config)
        .await
        .context("Failed to write config file")?;
    println!("✅ Created default configuration at: {config_path}");
    println!("   Run 'fetchgate serve --config {config_path}' to start the server");
    Ok(())
}
