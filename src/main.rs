use clap::{Parser, Subcommand};
use rewire::cert::CertificateAuthority;
use rewire::config::Config;
use rewire::proxy::ProxyServer;
use rewire::sysproxy;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(
    name = "rewire",
    about = "A rule-driven HTTP/HTTPS intercepting proxy",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file path
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Proxy listen address
    #[arg(short = 'H', long)]
    host: Option<String>,

    /// Proxy listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Rule DSL file
    #[arg(short, long)]
    rules: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Log format (text, json)
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Root CA certificate path
    #[arg(long)]
    ca_cert: Option<PathBuf>,

    /// Root CA private key path
    #[arg(long)]
    ca_key: Option<PathBuf>,

    /// Route system-wide traffic through the proxy (macOS only)
    #[arg(long)]
    system_proxy: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate default configuration file
    Init {
        /// Output file path
        #[arg(short, long, default_value = "config.yaml")]
        output: PathBuf,
    },
    /// Export the root CA certificate for trust-store import
    ExportCa {
        /// Output file path
        #[arg(short, long)]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Some(command) = cli.command {
        return handle_command(command).await;
    }

    let mut config = if cli.config.exists() {
        Config::load(&cli.config)?
    } else {
        Config::default()
    };

    if let Some(host) = cli.host {
        config.proxy.host = host;
    }
    if let Some(port) = cli.port {
        config.proxy.port = port;
    }
    if let Some(rules) = cli.rules {
        config.rules.file = rules.to_string_lossy().to_string();
    }
    if let Some(ca_cert) = cli.ca_cert {
        config.cert.ca_cert = ca_cert.to_string_lossy().to_string();
    }
    if let Some(ca_key) = cli.ca_key {
        config.cert.ca_key = ca_key.to_string_lossy().to_string();
    }
    config.logging.level = cli.log_level.clone();
    config.logging.format = cli.log_format.clone();
    config.expand_paths();

    setup_logging(&config)?;

    info!("Starting rewire");

    let ca = CertificateAuthority::new(&config.cert)?;
    info!("Root CA loaded");

    let cancel_token = CancellationToken::new();

    let proxy = ProxyServer::new(config.clone(), ca)?;

    println!();
    println!("rewire listening on http://{}:{}", config.proxy.host, config.proxy.port);
    println!("  rules file:  {}", config.rules.file);
    println!("  root CA:     {} (import into your trust store)", config.cert.ca_cert);
    println!("  reload:      edit the rules file or send SIGHUP");
    println!("  stop:        Ctrl+C");
    println!();

    // Ctrl+C initiates graceful shutdown
    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
        info!("Received Ctrl+C, initiating graceful shutdown...");
        shutdown_token.cancel();
    });

    // SIGHUP forces a rule reload
    #[cfg(unix)]
    {
        let rules = proxy.state().rules.clone();
        tokio::spawn(async move {
            use tokio::signal::unix::{signal, SignalKind};
            let Ok(mut hangup) = signal(SignalKind::hangup()) else {
                error!("Failed to install SIGHUP handler");
                return;
            };
            while hangup.recv().await.is_some() {
                info!("SIGHUP received, reloading rules");
                rules.force_reload();
            }
        });
    }

    let system_proxy = cli.system_proxy;
    if system_proxy {
        sysproxy::enable(&config.proxy.host, config.proxy.port)?;
        info!("System proxy enabled");
    }

    let result = proxy.run(cancel_token.clone()).await;

    if system_proxy {
        sysproxy::disable();
        info!("System proxy disabled");
    }

    result?;
    info!("rewire stopped");
    Ok(())
}

async fn handle_command(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Init { output } => {
            Config::create_default(&output)?;
            println!("Configuration file created: {:?}", output);
            println!("\nEdit this file to customize your proxy settings.");
        }
        Commands::ExportCa { output } => {
            let mut config = Config::default();
            config.expand_paths();
            let ca = CertificateAuthority::new(&config.cert)?;
            std::fs::write(&output, ca.ca_cert_pem())?;
            println!("Root CA certificate exported to: {:?}", output);
            println!("\nImport it into your system/browser trust store to intercept HTTPS.");
        }
    }

    Ok(())
}

fn setup_logging(config: &Config) -> anyhow::Result<()> {
    let level = match config.logging.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("hyper=warn".parse()?)
        .add_directive("rustls=warn".parse()?);

    if config.logging.format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(false).with_thread_ids(false))
            .init();
    }

    Ok(())
}
