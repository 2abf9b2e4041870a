//! Backend management commands: ping, status, start, stop, tools, call.

use std::time::Duration;

use serde_json::Value;

use crate::bridge::auto_start::{ensure_backend, is_backend_running};
use crate::bridge::client::BridgeClient;
use crate::config::BridgeConfig;
use crate::error::Result;

/// `scry ping`: report reachability without spawning anything.
pub async fn ping(config: &BridgeConfig) -> Result<()> {
    match BridgeClient::connect(config).await {
        Ok(mut client) => {
            client.ping().await?;
            println!("Backend is running at {}", config.control_addr());
        }
        Err(_) => {
            println!("Backend is not running.");
            println!("  Run 'scry start' or any tool command to start it.");
        }
    }
    Ok(())
}

/// `scry status`: full backend status.
pub async fn status(config: &BridgeConfig) -> Result<()> {
    if !is_backend_running(config).await {
        println!("Backend status: not running");
        return Ok(());
    }

    let mut client = BridgeClient::connect(config).await?;
    let status = client.status().await?;

    println!("Backend status: running");
    print_field(&status, "version", "Version");
    print_field(&status, "pid", "PID");
    println!("  Control channel: {}", config.control_addr());
    println!("  Gateway: {}", config.gateway_addr());
    if let Some(connected) = status.get("gateway_connected").and_then(Value::as_bool) {
        println!(
            "  Tabletop module: {}",
            if connected { "connected" } else { "not connected" }
        );
    }
    if let Some(jobs) = status.get("jobs") {
        println!("  Jobs: {}", serde_json::to_string(jobs)?);
    }
    Ok(())
}

/// `scry start`: ensure a backend is running.
pub async fn start(config: &BridgeConfig) -> Result<()> {
    if is_backend_running(config).await {
        println!("Backend is already running.");
        return Ok(());
    }

    let mut client = ensure_backend(config).await?;
    client.ping().await?;
    println!("Backend started at {}.", config.control_addr());
    Ok(())
}

/// `scry stop`: graceful shutdown, waiting for the port to free up.
pub async fn stop(config: &BridgeConfig) -> Result<()> {
    if !is_backend_running(config).await {
        println!("Backend is not running.");
        return Ok(());
    }

    let mut client = BridgeClient::connect(config).await?;
    client.shutdown().await?;

    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if !is_backend_running(config).await {
            println!("Backend stopped.");
            return Ok(());
        }
    }

    println!("Warning: backend may still be shutting down.");
    Ok(())
}

/// `scry tools`: print the catalogue.
pub async fn tools(config: &BridgeConfig) -> Result<()> {
    let mut client = ensure_backend(config).await?;
    let result = client.list_tools().await?;

    let Some(tools) = result.get("tools").and_then(Value::as_array) else {
        println!("{result}");
        return Ok(());
    };
    for tool in tools {
        let name = tool.get("name").and_then(Value::as_str).unwrap_or("?");
        let description = tool.get("description").and_then(Value::as_str).unwrap_or("");
        println!("{name}  {description}");
    }
    Ok(())
}

/// `scry call <name> --args <json>`: one-shot tool invocation.
pub async fn call(config: &BridgeConfig, name: &str, args: &str) -> Result<()> {
    let args: Value = serde_json::from_str(args)
        .map_err(|e| crate::error::ScryError::InvalidArgument(format!("--args: {e}")))?;

    let mut client = ensure_backend(config).await?;
    let content = client.call_tool(name, args).await?;

    // Print the text blocks; fall back to the raw payload.
    match content.get("content").and_then(Value::as_array) {
        Some(blocks) => {
            for block in blocks {
                if let Some(text) = block.get("text").and_then(Value::as_str) {
                    println!("{text}");
                }
            }
        }
        None => println!("{content}"),
    }
    Ok(())
}

fn print_field(status: &Value, key: &str, label: &str) {
    if let Some(value) = status.get(key) {
        match value.as_str() {
            Some(text) => println!("  {label}: {text}"),
            None => println!("  {label}: {value}"),
        }
    }
}
