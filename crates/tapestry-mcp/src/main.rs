//! Tapestry MCP Server — knowledge-graph memory for conversational agents.
//!
//! Agents push utterances in and read structured knowledge back over
//! MCP (JSON-RPC over stdio). Background workers age and verify the
//! graph; the proactive engine queues probes and starters for the agent
//! to pull at the right moment; a localhost dashboard streams every
//! mutation over WebSocket.

use std::path::PathBuf;
use std::sync::Arc;

use tapestry_mcp::dashboard::{self, events::DashboardForwarder, state::AppState};
use tapestry_mcp::protocol::stdio::StdioTransport;
use tapestry_mcp::server::McpServer;

use tapestry_core::{Tapestry, TapestryConfig};
use tokio::sync::broadcast;
use tracing::{error, info, Level};
use tracing_subscriber::EnvFilter;

/// Parsed command-line options
struct Options {
    data_dir: Option<PathBuf>,
    config_path: Option<PathBuf>,
    dashboard_port: Option<u16>,
    no_dashboard: bool,
}

/// Parse command-line arguments. Exits on --help/--version or bad input.
fn parse_args() -> Options {
    let args: Vec<String> = std::env::args().collect();
    let mut options = Options {
        data_dir: None,
        config_path: None,
        dashboard_port: None,
        no_dashboard: false,
    };
    let mut i = 1;

    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => {
                println!("Tapestry MCP Server v{}", env!("CARGO_PKG_VERSION"));
                println!();
                println!("Knowledge-graph memory service for conversational agents (MCP).");
                println!();
                println!("USAGE:");
                println!("    tapestry-mcp [OPTIONS]");
                println!();
                println!("OPTIONS:");
                println!("    -h, --help               Print help information");
                println!("    -V, --version            Print version information");
                println!("    --data-dir <PATH>        Custom data directory");
                println!("    --config <PATH>          JSON configuration file");
                println!("    --dashboard-port <PORT>  Dashboard port (default: 3941)");
                println!("    --no-dashboard           Disable the dashboard");
                println!();
                println!("ENVIRONMENT:");
                println!("    RUST_LOG                 Log level filter (debug, info, warn, error)");
                println!("    TAPESTRY_LLM_PROVIDER    mock | anthropic");
                println!("    TAPESTRY_API_KEY         Provider API key");
                println!("    TAPESTRY_DATA_DIR        Data directory override");
                println!();
                println!("EXAMPLES:");
                println!("    tapestry-mcp");
                println!("    tapestry-mcp --config config.json --dashboard-port 4000");
                println!("    RUST_LOG=debug TAPESTRY_LLM_PROVIDER=anthropic tapestry-mcp");
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("tapestry-mcp {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--data-dir" => {
                i += 1;
                options.data_dir = Some(required_value(&args, i, "--data-dir"));
            }
            "--config" => {
                i += 1;
                options.config_path = Some(required_value(&args, i, "--config"));
            }
            "--dashboard-port" => {
                i += 1;
                let raw = required_value(&args, i, "--dashboard-port");
                match raw.to_string_lossy().parse() {
                    Ok(port) => options.dashboard_port = Some(port),
                    Err(_) => {
                        eprintln!("error: --dashboard-port requires a port number");
                        std::process::exit(1);
                    }
                }
            }
            "--no-dashboard" => {
                options.no_dashboard = true;
            }
            arg => {
                eprintln!("error: unknown argument '{}'", arg);
                eprintln!("Try 'tapestry-mcp --help' for more information.");
                std::process::exit(1);
            }
        }
        i += 1;
    }

    options
}

fn required_value(args: &[String], index: usize, flag: &str) -> PathBuf {
    match args.get(index) {
        Some(value) => PathBuf::from(value),
        None => {
            eprintln!("error: {flag} requires an argument");
            std::process::exit(1);
        }
    }
}

const DEFAULT_DASHBOARD_PORT: u16 = 3941;

#[tokio::main]
async fn main() {
    let options = parse_args();

    // Logging to stderr — stdout carries JSON-RPC frames.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_ansi(false)
        .init();

    info!("Tapestry MCP Server v{} starting...", env!("CARGO_PKG_VERSION"));

    let mut config = match TapestryConfig::load(options.config_path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };
    if let Some(dir) = options.data_dir {
        config.data_dir = Some(dir.join("tapestry.db"));
    }
    if let Some(port) = options.dashboard_port {
        config.dashboard_port = Some(port);
    }
    let dashboard_port = config.dashboard_port.unwrap_or(DEFAULT_DASHBOARD_PORT);

    let service = match Tapestry::new(config) {
        Ok(service) => Arc::new(service),
        Err(e) => {
            error!("Failed to initialize service: {}", e);
            std::process::exit(1);
        }
    };
    info!("Service initialized");

    // Background workers: queue drain, maintenance, scheduled cycles.
    let _worker_handles = service.spawn_background();

    // Dashboard: forward graph events from the bus into a broadcast
    // channel the WebSocket clients drink from.
    if !options.no_dashboard {
        let (event_tx, _) = broadcast::channel(512);
        service.subscribe(
            "dashboard",
            None,
            Arc::new(DashboardForwarder::new(event_tx.clone())),
        );
        let state = AppState::new(Arc::clone(&service), event_tx);
        tokio::spawn(async move {
            let _ = dashboard::start_background(state, dashboard_port).await;
        });
    }

    // Serve MCP over stdio until stdin closes.
    let server = McpServer::new(service);
    if let Err(e) = StdioTransport::new().run(server).await {
        error!("stdio transport failed: {}", e);
        std::process::exit(1);
    }
    info!("Tapestry MCP Server shutting down");
}
