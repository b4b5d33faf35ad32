use clap::Parser;
use log::info;
use relay_proxy::config::{LoggingConfig, RelayConfig, UpstreamConfig};
use relay_proxy::logging;
use relay_proxy::relay::RelayProxy;
use relay_proxy::server::RelayServer;
use std::path::Path;
use std::sync::Arc;
use tokio::signal;

#[derive(Parser)]
#[clap(
    version,
    about = "A forwarding HTTP/HTTPS proxy with pluggable authentication and per-request upstream relay selection"
)]
struct Args {
    #[clap(short, long, value_name = "ADDR", help = "Listen address (e.g., 127.0.0.1:3333)")]
    listen: Option<String>,

    #[clap(short, long, value_name = "FILE", help = "Configuration file path")]
    config: Option<String>,

    #[clap(long, value_name = "SECONDS", help = "Outbound connect timeout in seconds")]
    connect_timeout: Option<u64>,

    #[clap(long, value_name = "USERNAME", help = "Username required from proxy clients (Basic Auth)")]
    proxy_username: Option<String>,

    #[clap(long, value_name = "PASSWORD", help = "Password required from proxy clients (Basic Auth)")]
    proxy_password: Option<String>,

    #[clap(long, value_name = "URL", help = "Upstream relay proxy URL (e.g., http://relay.example.net:9999)")]
    upstream: Option<String>,

    #[clap(long, value_name = "USERNAME", help = "Username for upstream relay authentication")]
    upstream_username: Option<String>,

    #[clap(long, value_name = "PASSWORD", help = "Password for upstream relay authentication")]
    upstream_password: Option<String>,

    #[clap(
        long,
        value_name = "PATTERN",
        help = "Domain pattern served by the upstream relay (NO_PROXY format, can be used multiple times)"
    )]
    upstream_domain: Vec<String>,

    #[clap(long, value_name = "LEVEL", help = "Log level: trace, debug, info, warn, error")]
    log_level: Option<String>,

    #[clap(long, value_name = "FORMAT", help = "Log format: text or json")]
    log_format: Option<String>,

    #[clap(long, value_name = "FILE", help = "Generate a sample configuration file")]
    generate_config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if let Some(config_file) = &args.generate_config {
        generate_sample_config(config_file)?;
        println!("Sample configuration file generated: {}", config_file);
        return Ok(());
    }

    let config = if let Some(config_file) = &args.config {
        if !Path::new(config_file).exists() {
            anyhow::bail!("Configuration file not found: {}", config_file);
        }
        RelayConfig::from_file(config_file).map_err(|e| anyhow::anyhow!("{}", e))?
    } else {
        create_config_from_args(&args)?
    };

    logging::init(&config.logging.clone().unwrap_or_default());
    validate_config(&config)?;

    info!("Starting relay proxy...");

    let relay = Arc::new(RelayProxy::new(&config));
    let server = RelayServer::bind(config.listen_addr, relay).await?;

    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            eprintln!("Server error: {}", e);
        }
    });

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down gracefully...");
        }
        result = server_handle => {
            if let Err(e) = result {
                eprintln!("Server task error: {}", e);
            }
        }
    }

    info!("Relay proxy stopped.");
    Ok(())
}

fn generate_sample_config(file_path: &str) -> anyhow::Result<()> {
    let sample = r#"{
  "listen_addr": "127.0.0.1:3333",
  "connect_timeout_secs": 10,
  "proxy_username": "client",
  "proxy_password": "secret",
  "upstreams": [{
    "host": "relay.example.net",
    "port": 9999,
    "username": "relay-user",
    "password": "relay-pass",
    "domains": [".internal.example.com"]
  }],
  "logging": {
    "level": "info",
    "format": "text"
  }
}"#;

    std::fs::write(file_path, sample)?;
    Ok(())
}

fn create_config_from_args(args: &Args) -> anyhow::Result<RelayConfig> {
    let mut config = RelayConfig::default();

    if let Some(listen) = &args.listen {
        config.listen_addr = listen
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid listen address '{}': {}", listen, e))?;
    }
    if let Some(secs) = args.connect_timeout {
        config.connect_timeout_secs = secs;
    }
    config.proxy_username = args.proxy_username.clone();
    config.proxy_password = args.proxy_password.clone();

    if let Some(upstream) = &args.upstream {
        let url = url::Url::parse(upstream)?;
        let host = url
            .host_str()
            .ok_or_else(|| anyhow::anyhow!("Upstream URL missing host: {}", upstream))?;
        config.upstreams.push(UpstreamConfig {
            host: host.to_string(),
            port: url.port().unwrap_or(8080),
            username: args.upstream_username.clone(),
            password: args.upstream_password.clone(),
            domains: args.upstream_domain.clone(),
        });
    }

    let mut logging_config = LoggingConfig::default();
    if let Some(level) = &args.log_level {
        logging_config.level =
            Some(logging::parse_log_level(level).map_err(|e| anyhow::anyhow!("{}", e))?);
    }
    if let Some(format) = &args.log_format {
        logging_config.format =
            Some(logging::parse_log_format(format).map_err(|e| anyhow::anyhow!("{}", e))?);
    }
    config.logging = Some(logging_config);

    Ok(config)
}

fn validate_config(config: &RelayConfig) -> anyhow::Result<()> {
    if config.proxy_username.is_some() != config.proxy_password.is_some() {
        anyhow::bail!("proxy_username and proxy_password must be set together");
    }

    for upstream in &config.upstreams {
        if upstream.username.is_some() != upstream.password.is_some() {
            anyhow::bail!(
                "upstream username and password must be set together for {}:{}",
                upstream.host,
                upstream.port
            );
        }
        if upstream.port == 0 {
            anyhow::bail!("upstream port must be non-zero for {}", upstream.host);
        }
    }

    Ok(())
}
