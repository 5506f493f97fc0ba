//! livefeed CLI — watch and inspect realtime event endpoints from the terminal.
//!
//! Usage:
//! ```bash
//! # Follow a subscriber's events (streaming, falling back to polling)
//! livefeed watch --url https://api.example.com --subscriber acct-42
//!
//! # One polling request
//! livefeed poll --url https://api.example.com --subscriber acct-42 --since 0
//!
//! # Probe the health endpoint
//! livefeed health --url https://api.example.com
//! ```

use std::env;
use std::process;

use tracing_subscriber::EnvFilter;

use livefeed_core::{ClientConfig, HealthProbe, WILDCARD};
use livefeed_http::{build_client, HttpConnector};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        process::exit(1);
    }

    let result = match args[1].as_str() {
        "watch" => cmd_watch(&args[2..]).await,
        "poll" => cmd_poll(&args[2..]).await,
        "health" => cmd_health(&args[2..]).await,
        "version" | "--version" | "-V" => {
            println!("livefeed {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {other}");
            print_usage();
            process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn print_usage() {
    println!("livefeed {}", env!("CARGO_PKG_VERSION"));
    println!("Watch and inspect realtime event endpoints\n");
    println!("USAGE:");
    println!("    livefeed <COMMAND>\n");
    println!("COMMANDS:");
    println!("    watch      Print events as JSON lines until Ctrl-C");
    println!("    poll       Send one polling request");
    println!("    health     Probe the health endpoint");
    println!("    version    Print version");
    println!("    help       Print this help\n");
    println!("FLAGS:");
    println!("    --url <URL>          Base URL of the event server  [required]");
    println!("    --subscriber <ID>    Subscriber id  [watch, poll]");
    println!("    --config <FILE>      JSON client config  [watch; replaces --url/--subscriber]");
    println!("    --type <TYPE>        Only print this event type  [watch]");
    println!("    --since <MS>         Start after this timestamp  [watch, poll]");
    println!("    --limit <N>          Maximum events  [poll]\n");
    println!("Logging is controlled by RUST_LOG (default: info).");
}

async fn cmd_watch(args: &[String]) -> Result<(), String> {
    let config = load_config(args)?;
    let event_type = parse_flag(args, "--type").unwrap_or_else(|| WILDCARD.to_string());
    let since = parse_number::<u64>(args, "--since")?.unwrap_or(0);

    let client = build_client(config).map_err(|e| e.to_string())?;
    client.resume_from(since);
    let _events = client.on(&event_type, |event| {
        println!("{}", serde_json::to_string(event)?);
        Ok(())
    });
    let _errors = client.on_error(|err| tracing::warn!(error = %err, "delivery error"));
    let _connection = client.on_connection(|connected| tracing::info!(connected, "connection changed"));

    client.connect();
    tokio::signal::ctrl_c().await.map_err(|e| e.to_string())?;
    client.disconnect().await;

    let health = client.connection_health();
    eprintln!(
        "stopped at watermark {} ({} transport)",
        client.watermark(),
        health.strategy
    );
    Ok(())
}

async fn cmd_poll(args: &[String]) -> Result<(), String> {
    let config = load_config(args)?;
    let since = parse_number::<u64>(args, "--since")?.unwrap_or(0);
    let limit = parse_number::<u32>(args, "--limit")?.unwrap_or(config.poll_limit);

    let connector = HttpConnector::new(&config).map_err(|e| e.to_string())?;
    let start = std::time::Instant::now();
    let events = connector
        .poll_once(since, limit)
        .await
        .map_err(|e| e.to_string())?;
    tracing::info!(count = events.len(), latency_ms = start.elapsed().as_millis() as u64, "polled");

    for event in &events {
        println!("{}", serde_json::to_string(event).map_err(|e| e.to_string())?);
    }
    Ok(())
}

async fn cmd_health(args: &[String]) -> Result<(), String> {
    let url = parse_flag(args, "--url").ok_or("--url is required")?;
    let config = ClientConfig::new(&url, "health-check");
    let connector = HttpConnector::new(&config).map_err(|e| e.to_string())?;

    println!("Probing {}...", config.health_url);
    match connector.probe().probe().await {
        Ok(latency) => {
            println!("  Status:   OK");
            println!("  Latency:  {}ms", latency.as_millis());
            Ok(())
        }
        Err(e) => {
            println!("  Status:   UNHEALTHY");
            Err(e.to_string())
        }
    }
}

fn load_config(args: &[String]) -> Result<ClientConfig, String> {
    if let Some(path) = parse_flag(args, "--config") {
        let json = std::fs::read_to_string(&path).map_err(|e| format!("{path}: {e}"))?;
        return ClientConfig::from_json_str(&json).map_err(|e| e.to_string());
    }
    let url = parse_flag(args, "--url").ok_or("--url is required")?;
    let subscriber = parse_flag(args, "--subscriber").ok_or("--subscriber is required")?;
    let config = ClientConfig::new(&url, subscriber);
    config.validate().map_err(|e| e.to_string())?;
    Ok(config)
}

fn parse_number<T: std::str::FromStr>(args: &[String], flag: &str) -> Result<Option<T>, String> {
    parse_flag(args, flag)
        .map(|v| v.parse::<T>().map_err(|_| format!("{flag} expects a number, got `{v}`")))
        .transpose()
}

fn parse_flag(args: &[String], flag: &str) -> Option<String> {
    let pos = args.iter().position(|a| a == flag)?;
    args.get(pos + 1).cloned()
}
