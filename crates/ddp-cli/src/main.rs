//! DDP CLI - connect to a DDP server and watch the session.
//!
//! Subscribes and calls methods as asked on the command line, then prints
//! every client event to stdout as one JSON object per line until Ctrl-C.
//! Logs go to stderr.

mod websocket;

use anyhow::{Context, Result};
use clap::Parser;
use ddp_core::{CallOptions, Client, ClientConfig, ClientEvent, HeartbeatConfig};
use serde_json::{json, Value};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use websocket::WebSocketConnector;

#[derive(Parser, Debug)]
#[command(name = "ddp-cli")]
#[command(about = "Command-line DDP client")]
struct Args {
    /// Server URL (http(s) URLs are mapped to ws(s) with the /websocket path)
    #[arg(short, long)]
    url: String,

    /// Subscription to start, as NAME or NAME:JSONPARAMS (repeatable)
    #[arg(long = "sub", value_name = "NAME[:JSON]")]
    subs: Vec<String>,

    /// Method to call once connected, as NAME or NAME:JSONPARAMS (repeatable)
    #[arg(long = "call", value_name = "NAME[:JSON]")]
    calls: Vec<String>,

    /// Resume token to log in with
    #[arg(long)]
    login_token: Option<String>,

    /// Disable client heartbeats
    #[arg(long)]
    no_heartbeat: bool,

    /// Also print every frame sent and received
    #[arg(long)]
    frames: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

/// Split `NAME[:JSON]` into a name and a parameter list.
///
/// A JSON array is taken as the full parameter list; any other JSON value
/// becomes the single parameter.
fn parse_invocation(arg: &str) -> Result<(String, Vec<Value>)> {
    let Some((name, raw)) = arg.split_once(':') else {
        return Ok((arg.to_string(), Vec::new()));
    };
    let value: Value = serde_json::from_str(raw)
        .with_context(|| format!("Invalid JSON parameters for {}: {}", name, raw))?;
    let params = match value {
        Value::Array(items) => items,
        other => vec![other],
    };
    Ok((name.to_string(), params))
}

fn print_event(event: &ClientEvent, frames: bool) {
    if !frames
        && matches!(
            event,
            ClientEvent::MessageSent(_) | ClientEvent::MessageReceived(_)
        )
    {
        return;
    }
    match serde_json::to_string(event) {
        // Intentional stdout: one event per line
        Ok(line) => println!("{}", line),
        Err(e) => warn!("Failed to serialize event: {}", e),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.as_str().to_lowercase()));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    let heartbeat = if args.no_heartbeat {
        None
    } else {
        Some(HeartbeatConfig::INTERVAL)
    };
    let config = ClientConfig::new(&args.url)?.with_heartbeat_interval(heartbeat);
    info!("Connecting to {}", config.url);

    let client = Client::new(config, WebSocketConnector);

    let mut events = client.events();
    let frames = args.frames;
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => print_event(&event, frames),
                Err(RecvError::Lagged(skipped)) => warn!("Dropped {} events", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    });

    client.connect()?;

    if let Some(token) = args.login_token {
        client
            .login_with_method("login", vec![json!({ "resume": token })], None)
            .await?;
    }

    for arg in &args.subs {
        let (name, params) = parse_invocation(arg)?;
        let handle = client.subscribe(&name, params).await?;
        info!("Subscribed to {} ({})", name, handle.id());
    }

    for arg in &args.calls {
        let (name, params) = parse_invocation(arg)?;
        let method = name.clone();
        let options = CallOptions::new().on_complete(move |result| match result {
            Ok(value) => info!("{} returned {}", method, value),
            Err(e) => warn!("{} failed: {}", method, e),
        });
        client.call_with(&name, params, options).await?;
    }

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, exiting");

    client.disconnect()?;
    client.shutdown()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bare_name() {
        assert_eq!(parse_invocation("posts").unwrap(), ("posts".to_string(), vec![]));
    }

    #[test]
    fn test_parse_array_params() {
        let (name, params) = parse_invocation(r#"add:[1,2]"#).unwrap();
        assert_eq!(name, "add");
        assert_eq!(params, vec![json!(1), json!(2)]);
    }

    #[test]
    fn test_parse_single_param() {
        let (name, params) = parse_invocation(r#"posts:{"limit":5}"#).unwrap();
        assert_eq!(name, "posts");
        assert_eq!(params, vec![json!({"limit": 5})]);
    }

    #[test]
    fn test_parse_invalid_json() {
        assert!(parse_invocation("posts:{oops").is_err());
    }
}
