//! Local Volume Engine
//!
//! Runs either the controller role (volume and snapshot lifecycle behind a
//! REST API) or the node role (node agent plus the node mount engine).

use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use local_volume_engine::{
    AgentClientConfig, AgentServer, AgentServerConfig, ApiServer, ApiServerConfig,
    ControllerConfig, Error, HostCommandRunner, HostMounter, HttpNodeConnector, HttpScheduler,
    LifecycleController, MemoryCatalog, NodeEngine, NodeEngineConfig, PrimitiveDriver, Result,
    SchedulerConfig,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Role this process plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Role {
    /// Volume lifecycle controller
    Controller,
    /// Node agent and mount engine
    Node,
}

/// Local Volume Engine - lifecycle of node-local persistent volumes
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Role to run
    #[arg(long, env = "ROLE", value_enum, default_value = "controller")]
    role: Role,

    /// REST API bind address
    #[arg(long, env = "API_ADDR", default_value = "0.0.0.0:8090")]
    api_addr: String,

    /// Node agent bind address (node role)
    #[arg(long, env = "AGENT_ADDR", default_value = "0.0.0.0:1736")]
    agent_addr: String,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Name of this node (node role)
    #[arg(long, env = "NODE_ID", default_value = "")]
    node_id: String,

    /// Base URL of the scheduler extender
    #[arg(long, env = "SCHEDULER_HOST", default_value = "http://local-scheduler-extender:23000")]
    scheduler_host: String,

    /// Port of the node agents
    #[arg(long, env = "LVMD_PORT", default_value = "1736")]
    agent_port: u16,

    /// Node agent addresses as node=address, comma separated (controller role)
    #[arg(long, env = "NODE_ADDRESSES", value_delimiter = ',')]
    node_addresses: Vec<String>,

    /// Snapshot size used when the snapshot class sets none, in bytes
    #[arg(long, env = "SNAPSHOT_INITIAL_SIZE", default_value = "4294967296")]
    snapshot_initial_size: u64,

    /// Run host tooling in the current mount namespace instead of entering PID 1's
    #[arg(long, env = "NO_NSENTER")]
    no_nsenter: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args)?;

    info!("Starting Local Volume Engine");
    info!("  Version: {}", local_volume_engine::VERSION);
    info!("  Role: {:?}", args.role);
    info!("  REST API: {}", args.api_addr);

    // Start health server
    let health_addr = args.health_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr).await {
            error!("Health server error: {}", e);
        }
    });

    // Start metrics server
    let metrics_addr = args.metrics_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr).await {
            error!("Metrics server error: {}", e);
        }
    });

    let api_config = ApiServerConfig {
        rest_addr: parse_addr("REST API", &args.api_addr)?,
    };

    match args.role {
        Role::Controller => run_controller(&args, api_config).await?,
        Role::Node => run_node(&args, api_config).await?,
    }

    info!("Shutdown complete");
    Ok(())
}

fn parse_addr(what: &str, addr: &str) -> Result<SocketAddr> {
    addr.parse()
        .map_err(|e| Error::Configuration(format!("Invalid {} address {}: {}", what, addr, e)))
}

// =============================================================================
// Roles
// =============================================================================

async fn run_controller(args: &Args, api_config: ApiServerConfig) -> Result<()> {
    let catalog = MemoryCatalog::new();
    catalog.register_nodes(args.node_addresses.iter().map(String::as_str))?;
    info!("  Node agents: {}", args.node_addresses.len());

    let scheduler = HttpScheduler::new(SchedulerConfig {
        base_url: args.scheduler_host.clone(),
        ..Default::default()
    })?;
    info!("  Scheduler: {}", args.scheduler_host);

    let connector = HttpNodeConnector::new(AgentClientConfig::default());
    let controller = LifecycleController::new(
        ControllerConfig {
            agent_port: args.agent_port,
            snapshot_initial_size: args.snapshot_initial_size,
            ..Default::default()
        },
        scheduler,
        connector,
        catalog,
    );

    let api_server = ApiServer::new(api_config).with_controller(controller);

    info!("Starting controller API server");
    tokio::select! {
        result = api_server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Received interrupt, shutting down");
            api_server.shutdown();
        }
    }
    Ok(())
}

async fn run_node(args: &Args, api_config: ApiServerConfig) -> Result<()> {
    if args.node_id.is_empty() {
        return Err(Error::Configuration("--node-id is required for the node role".into()));
    }
    info!("  Node: {}", args.node_id);

    let host_runner = if args.no_nsenter {
        HostCommandRunner::local()
    } else {
        HostCommandRunner::host_namespace()
    };
    let driver = PrimitiveDriver::new(Arc::new(host_runner.clone()));

    let agent_server = AgentServer::new(
        AgentServerConfig {
            bind_addr: parse_addr("node agent", &args.agent_addr)?,
        },
        driver.clone(),
    );

    let engine = NodeEngine::new(
        NodeEngineConfig {
            node_id: args.node_id.clone(),
            ..Default::default()
        },
        driver,
        Arc::new(HostMounter::new(Arc::new(host_runner))),
        MemoryCatalog::new(),
    );
    let api_server = ApiServer::new(api_config).with_node(engine);

    info!("Starting node agent and node API server");
    tokio::select! {
        result = agent_server.run() => result?,
        result = api_server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Received interrupt, shutting down");
            agent_server.shutdown();
            api_server.shutdown();
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) -> Result<()> {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "reqwest=warn", "tower=warn", "axum=info"] {
        let directive = directive
            .parse()
            .map_err(|e| Error::Configuration(format!("Invalid log directive: {}", e)))?;
        filter = filter.add_directive(directive);
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
    Ok(())
}

// =============================================================================
// Health Server
// =============================================================================

fn plain_response(status: hyper::StatusCode, body: impl Into<hyper::Body>) -> hyper::Response<hyper::Body> {
    let mut response = hyper::Response::new(body.into());
    *response.status_mut() = status;
    response
}

async fn run_health_server(addr: &str) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, std::convert::Infallible>(service_fn(|req: Request<Body>| async move {
            let response = match req.uri().path() {
                "/healthz" | "/livez" | "/readyz" => plain_response(StatusCode::OK, "ok"),
                _ => plain_response(StatusCode::NOT_FOUND, "not found"),
            };
            Ok::<_, std::convert::Infallible>(response)
        }))
    });

    let addr = parse_addr("health server", addr)?;

    info!("Health server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Health server error: {}", e)))?;

    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: &str) -> Result<()> {
    use hyper::header::{HeaderValue, CONTENT_TYPE};
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};
    use prometheus::{Encoder, TextEncoder};

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, std::convert::Infallible>(service_fn(|req: Request<Body>| async move {
            let response = match req.uri().path() {
                "/metrics" => {
                    let encoder = TextEncoder::new();
                    let metric_families = prometheus::gather();
                    let mut buffer = Vec::new();
                    match encoder.encode(&metric_families, &mut buffer) {
                        Ok(()) => {
                            let mut response = plain_response(StatusCode::OK, buffer);
                            if let Ok(value) = HeaderValue::from_str(encoder.format_type()) {
                                response.headers_mut().insert(CONTENT_TYPE, value);
                            }
                            response
                        }
                        Err(e) => plain_response(
                            StatusCode::INTERNAL_SERVER_ERROR,
                            format!("encode metrics: {}", e),
                        ),
                    }
                }
                _ => plain_response(StatusCode::NOT_FOUND, "not found"),
            };
            Ok::<_, std::convert::Infallible>(response)
        }))
    });

    let addr = parse_addr("metrics server", addr)?;

    info!("Metrics server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?;

    Ok(())
}
