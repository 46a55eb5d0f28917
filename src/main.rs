use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use hostbridge::config::{self, AppConfig};
use hostbridge::logging::{self, LogConfig};
use hostbridge::rpc::{MethodRegistry, ParamSpec, ParamType, RpcClient, RpcServer};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::info;

#[derive(Parser)]
#[command(name = "hostbridge")]
#[command(about = "Loopback JSON-RPC bridge", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file
    #[arg(long, global = true, default_value = config::DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bridge server until interrupted
    Serve(ConnectArgs),
    /// Call a method on a running bridge
    Call(CallArgs),
    /// Find a running bridge and print its status
    Ping(ConnectArgs),
    /// Print the effective configuration
    Config(ConnectArgs),
}

#[derive(Args, Serialize)]
struct ConnectArgs {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    host: Option<std::net::IpAddr>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    port: Option<u16>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    port_attempts: Option<u16>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    request_timeout_secs: Option<u64>,
}

#[derive(Args)]
struct CallArgs {
    method: String,

    /// Parameters as a JSON object or array
    params: Option<String>,

    #[command(flatten)]
    connect: ConnectArgs,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    logging::init(LogConfig {
        json: cli.json_logs,
        verbose: cli.verbose,
    });

    let connect = match &cli.command {
        Commands::Serve(args) | Commands::Ping(args) | Commands::Config(args) => args,
        Commands::Call(args) => &args.connect,
    };
    let config = AppConfig::load(&cli.config, Some(connect)).context("Failed to load configuration")?;

    match &cli.command {
        Commands::Serve(_) => run_server(config).await.context("Bridge server failed")?,
        Commands::Call(args) => run_call(config, args).await?,
        Commands::Ping(_) => run_ping(config).await?,
        Commands::Config(_) => print!("{}", config.to_toml()?),
    }

    Ok(())
}

async fn run_server(config: AppConfig) -> Result<()> {
    let mut registry = MethodRegistry::new();
    register_sample_methods(&mut registry)?;

    let server = RpcServer::new(config.server_config(), registry)?;
    let addr = server.start().await?;

    // Machine-readable line for the launching process.
    println!("RPC_PORT={}", addr.port());

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    server.stop().await;
    Ok(())
}

async fn run_call(config: AppConfig, args: &CallArgs) -> Result<()> {
    let params = match &args.params {
        Some(raw) => Some(serde_json::from_str::<Value>(raw).context("params must be valid JSON")?),
        None => None,
    };

    let client = RpcClient::new(&config.client_config())?;
    let result = client.call_value(&args.method, params).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

async fn run_ping(config: AppConfig) -> Result<()> {
    let client = RpcClient::discover(&config.client_config())
        .await
        .context("No bridge is answering")?;
    let status: Value = client.call_no_params(hostbridge::rpc::builtin::PING).await?;
    println!("bridge at {}", client.addr());
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

/// Small set of methods served by the standalone binary.
fn register_sample_methods(registry: &mut MethodRegistry) -> Result<()> {
    registry.register_described(
        "echo",
        Some("Return the given text"),
        vec![ParamSpec::required("text", ParamType::string())],
        |args| Ok(args.get::<String>("text")?),
    )?;

    registry.register_described(
        "sum",
        Some("Add up a list of numbers"),
        vec![ParamSpec::required("values", ParamType::list_of(ParamType::float()))],
        |args| Ok(args.get::<Vec<f64>>("values")?.iter().sum::<f64>()),
    )?;

    registry.register_described(
        "format_address",
        Some("Render an address as zero-padded hex"),
        vec![
            ParamSpec::required(
                "address",
                ParamType::address().annotated("number or \"0x\" string"),
            ),
            ParamSpec::optional("width", ParamType::int().annotated("digits, default 16")),
        ],
        |args| {
            let address = args.get::<u64>("address")?;
            let width = args.get::<Option<i64>>("width")?.unwrap_or(16);
            if !(1..=16).contains(&width) {
                bail!("width must be between 1 and 16, got {}", width);
            }
            Ok(json!({
                "address": address,
                "hex": format!("0x{:0width$x}", address, width = width as usize),
            }))
        },
    )?;

    Ok(())
}
