//! Buslink - Service bus client and catalog service
//!
//! Talks to a message bus that routes addressed frames between registered
//! participants.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use buslink::catalog::{self, CatalogRequest, CatalogResponse, CatalogService, Filters};
use buslink::config::{self, Config};
use buslink::network::{BusClient, BusConnection, PendingResponse};
use buslink::protocol::Address;

/// Buslink - framed messaging over a TCP service bus
#[derive(Parser)]
#[command(name = "buslink")]
#[command(author = "Buslink Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Register on a service bus and exchange catalog requests", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Bus host (overrides config)
    #[arg(long, global = true)]
    host: Option<String>,

    /// Bus port (overrides config)
    #[arg(short, long, global = true)]
    port: Option<u16>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the product catalog service
    Serve {
        /// Address to register (up to 5 characters)
        #[arg(short, long)]
        address: Option<String>,

        /// JSON file with the product list
        #[arg(short, long)]
        data: Option<PathBuf>,
    },

    /// Send one catalog request and print the answer
    Query {
        /// Seconds to wait for the reply
        #[arg(short, long)]
        timeout: Option<u64>,

        /// Catalog service address
        #[arg(long, default_value = catalog::CATALOG_SERVICE)]
        service: String,

        #[command(subcommand)]
        query: QueryCommand,
    },

    /// Send a raw frame body to an address
    Send {
        /// Destination address (up to 5 characters)
        #[arg(short, long)]
        to: String,

        /// Wait for and print the next reply
        #[arg(short, long)]
        wait: bool,

        /// Frame body
        body: String,
    },

    /// Show current configuration
    Config {
        /// Generate sample configuration
        #[arg(long)]
        generate: bool,

        /// Output path for generated config
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum QueryCommand {
    /// List the whole catalog
    Catalog,

    /// Search products by name, brand, category, tags or variation
    Search {
        /// Search term
        #[arg(required = true)]
        term: Vec<String>,
    },

    /// Filter products
    Filter(FilterArgs),
}

#[derive(Args)]
struct FilterArgs {
    #[arg(long)]
    marca: Option<String>,
    #[arg(long)]
    categoria: Option<String>,
    #[arg(long)]
    color: Option<String>,
    #[arg(long)]
    talla: Option<String>,
    #[arg(long)]
    precio_min: Option<f64>,
    #[arg(long)]
    precio_max: Option<f64>,
}

impl QueryCommand {
    fn into_request(self) -> anyhow::Result<CatalogRequest> {
        Ok(match self {
            QueryCommand::Catalog => CatalogRequest::VerCatalogo,
            QueryCommand::Search { term } => CatalogRequest::Buscar {
                termino: term.join(" "),
            },
            QueryCommand::Filter(args) => {
                let filtros = Filters {
                    marca: args.marca,
                    categoria: args.categoria,
                    color: args.color,
                    talla: args.talla,
                    precio_min: args.precio_min.map(|p| p.to_string()),
                    precio_max: args.precio_max.map(|p| p.to_string()),
                };
                if filtros.is_empty() {
                    anyhow::bail!("No filter given");
                }
                CatalogRequest::Filtrar { filtros }
            }
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default().unwrap_or_default()
    };
    if let Some(host) = cli.host {
        config.bus.host = host;
    }
    if let Some(port) = cli.port {
        config.bus.port = port;
    }

    // Initialize logging
    let filter = if cli.verbose || config.general.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    match cli.command {
        Commands::Serve { address, data } => {
            run_service(config, address, data).await?;
        }
        Commands::Query {
            timeout,
            service,
            query,
        } => {
            let timeout = timeout.unwrap_or(config.client.request_timeout_secs);
            run_query(config, &service, query.into_request()?, timeout).await?;
        }
        Commands::Send { to, wait, body } => {
            run_send(config, &to, body, wait).await?;
        }
        Commands::Config { generate, output } => {
            if generate {
                let sample = config::generate_sample_config()?;
                if let Some(path) = output {
                    std::fs::write(&path, &sample)?;
                    println!("Configuration written to: {}", path.display());
                } else {
                    println!("{}", sample);
                }
            } else {
                println!("{}", toml::to_string_pretty(&config)?);
            }
        }
    }

    Ok(())
}

/// Run the catalog service until Ctrl+C or the bus goes away
async fn run_service(
    config: Config,
    address: Option<String>,
    data: Option<PathBuf>,
) -> anyhow::Result<()> {
    let address = match address {
        Some(name) => Address::padded(&name)?,
        None => config.service_address()?,
    };

    let service = match data.or_else(|| config.catalog.data_file.clone()) {
        Some(path) => CatalogService::load(&path)
            .with_context(|| format!("failed to load catalog from {}", path.display()))?,
        None => {
            tracing::warn!("No catalog data file configured, serving an empty catalog");
            CatalogService::default()
        }
    };

    let settings = config.bus_settings();
    tracing::info!(
        "Starting catalog service '{}' on bus {}:{}",
        address,
        settings.host,
        settings.port
    );

    let client = BusClient::connect(settings, address).await?;

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    let exit = service.serve(client, shutdown).await?;
    tracing::info!("Service stopped ({:?})", exit);

    Ok(())
}

/// Send one catalog request and print the rendered reply
async fn run_query(
    config: Config,
    service: &str,
    request: CatalogRequest,
    timeout_secs: u64,
) -> anyhow::Result<()> {
    let service = Address::padded(service)?;
    let address = config.client_address()?;
    let mut client = BusClient::connect(config.bus_settings(), address).await?;

    tracing::info!("Registered as '{}', asking '{}'", address, service);

    let response = client.request(&service, &request.to_body()?).await?;
    let body = await_reply(client, response, Duration::from_secs(timeout_secs)).await?;

    let reply = CatalogResponse::from_body(&body)?;
    print!("{}", catalog::render_response(&reply));
    Ok(())
}

/// Wait for one reply, then shut the client down whatever the outcome
async fn await_reply(
    client: BusClient,
    response: PendingResponse,
    timeout: Duration,
) -> anyhow::Result<Bytes> {
    let service = response.address();
    let waited = tokio::time::timeout(timeout, response.recv()).await;
    if waited.is_err() {
        client.correlator().cancel(&service).await;
    }

    match client.shutdown().await {
        Ok(exit) => tracing::debug!("Client stopped ({:?})", exit),
        Err(e) => tracing::warn!("Client shutdown failed: {}", e),
    }

    match waited {
        Ok(body) => body.with_context(|| format!("No reply from '{}'", service)),
        Err(_) => anyhow::bail!(
            "No reply from '{}' within {}s",
            service,
            timeout.as_secs_f32()
        ),
    }
}

/// Send a raw frame, optionally waiting for the next reply
async fn run_send(config: Config, to: &str, body: String, wait: bool) -> anyhow::Result<()> {
    let destination = Address::padded(to)?;
    let address = config.client_address()?;

    let mut conn = BusConnection::connect(&config.bus_settings()).await?;
    conn.register(address).await?;
    conn.send(&destination, body.as_bytes()).await?;
    println!(
        "Sent {} bytes to '{}' as '{}'",
        body.len(),
        destination,
        address
    );

    if wait {
        let timeout = Duration::from_secs(config.client.request_timeout_secs);
        match tokio::time::timeout(timeout, conn.recv()).await {
            Ok(frame) => {
                let frame = frame?;
                println!("[{}] {}", frame.address, frame.body_text());
            }
            Err(_) => println!("No reply within {}s", timeout.as_secs()),
        }
    }

    conn.close().await?;
    tracing::debug!("Frames on the wire: {:?}", conn.stats());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use buslink::network::BusSettings;

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::try_parse_from(["buslink", "query", "catalog"]);
        assert!(cli.is_ok());

        let cli = Cli::try_parse_from([
            "buslink", "-p", "6001", "query", "search", "zapatilla", "roja",
        ])
        .unwrap();
        assert_eq!(cli.port, Some(6001));
        match cli.command {
            Commands::Query { query, service, .. } => {
                assert_eq!(service, "prodc");
                assert_eq!(
                    query.into_request().unwrap(),
                    CatalogRequest::Buscar {
                        termino: "zapatilla roja".into()
                    }
                );
            }
            _ => panic!("expected query"),
        }
    }

    #[test]
    fn test_empty_filter_rejected() {
        let cli = Cli::try_parse_from(["buslink", "query", "filter"]).unwrap();
        match cli.command {
            Commands::Query { query, .. } => assert!(query.into_request().is_err()),
            _ => panic!("expected query"),
        }
    }

    #[test]
    fn test_send_requires_destination() {
        assert!(Cli::try_parse_from(["buslink", "send", "hola"]).is_err());
    }

    async fn client_on_loopback() -> (BusClient, tokio::net::TcpStream) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let settings = BusSettings::new("127.0.0.1", listener.local_addr().unwrap().port())
            .with_poll_interval(Duration::from_millis(20));

        let (client, accepted) = tokio::join!(
            BusClient::connect(settings, Address::generate()),
            listener.accept()
        );
        (client.unwrap(), accepted.unwrap().0)
    }

    #[tokio::test]
    async fn test_await_reply_times_out_and_cancels() {
        let (mut client, _bus) = client_on_loopback().await;
        let prodc = Address::new("prodc").unwrap();
        let response = client.request(&prodc, b"{}").await.unwrap();
        let correlator = std::sync::Arc::clone(client.correlator());

        let err = await_reply(client, response, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("within"));
        assert!(!correlator.is_pending(&prodc).await);
    }

    #[tokio::test]
    async fn test_await_reply_reports_lost_link() {
        let (mut client, bus) = client_on_loopback().await;
        let response = client
            .request(&Address::new("prodc").unwrap(), b"{}")
            .await
            .unwrap();
        drop(bus);

        let result = tokio::time::timeout(
            Duration::from_secs(2),
            await_reply(client, response, Duration::from_secs(10)),
        )
        .await
        .expect("lost link was not reported");
        assert!(result.is_err());
    }
}
