use anyhow::{Context, Result};
use serde_json::{Value, json};
use zeus_session::Session;
use zeus_session::api::ServiceHealth;
use zeus_session::core::ClientConfig;

pub async fn status(session: &Session, json: bool) -> Result<()> {
    let status = session
        .api()
        .system_status()
        .await
        .context("failed to load system status")?;
    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!("cpu: {:.1}%", status.cpu_usage);
    println!("memory: {:.1}%", status.memory_usage);
    println!("storage: {:.1}%", status.storage_usage);
    println!("network: {:.1}%", status.network_usage);
    println!("active users: {}", status.active_users);
    if let Some(updated) = &status.last_updated {
        println!("updated: {updated}");
    }
    for (name, health) in &status.services {
        println!("  {name}: {}", health_label(*health));
    }
    let unhealthy = status.unhealthy_services();
    if !unhealthy.is_empty() {
        let names: Vec<&str> = unhealthy.iter().map(|(name, _)| *name).collect();
        println!("attention: {}", names.join(", "));
    }
    Ok(())
}

fn health_label(health: ServiceHealth) -> &'static str {
    match health {
        ServiceHealth::Online => "online",
        ServiceHealth::Offline => "offline",
        ServiceHealth::Degraded => "degraded",
        ServiceHealth::Unknown => "unknown",
    }
}

pub fn show_config(config: &ClientConfig, json: bool) -> Result<()> {
    let token_store = crate::token_store_path(config)
        .map(|path| path.display().to_string())
        .unwrap_or_else(|error| format!("unavailable ({error})"));
    let heartbeat_ms = config
        .heartbeat_interval
        .map(|interval| interval.as_millis());

    if json {
        let out = json!({
            "api_base_url": config.api_base_url,
            "api_base_url_source": config.api_base_url_source,
            "ws_base_url": config.ws_base_url,
            "ws_base_url_source": config.ws_base_url_source,
            "api_timeout_ms": config.api_timeout.as_millis(),
            "ws_connect_timeout_ms": config.ws_connect_timeout.as_millis(),
            "reconnect": {
                "base_delay_ms": config.reconnect.base_delay.as_millis(),
                "multiplier": config.reconnect.multiplier,
                "max_delay_ms": config.reconnect.max_delay.as_millis(),
                "max_attempts": config.reconnect.max_attempts,
            },
            "heartbeat_interval_ms": heartbeat_ms.map_or(Value::Null, |ms| json!(ms)),
            "dev_token_bypass": config.dev_token_policy.allows_test_prefix(),
            "token_store": token_store,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!("api: {} ({})", config.api_base_url, config.api_base_url_source);
    println!("ws: {} ({})", config.ws_base_url, config.ws_base_url_source);
    println!("api timeout: {}ms", config.api_timeout.as_millis());
    println!("ws connect timeout: {}ms", config.ws_connect_timeout.as_millis());
    println!(
        "reconnect: {}ms x{} up to {}ms, {} attempts",
        config.reconnect.base_delay.as_millis(),
        config.reconnect.multiplier,
        config.reconnect.max_delay.as_millis(),
        config.reconnect.max_attempts
    );
    match heartbeat_ms {
        Some(ms) => println!("heartbeat: {ms}ms"),
        None => println!("heartbeat: off"),
    }
    if config.dev_token_policy.allows_test_prefix() {
        println!("dev token bypass: on");
    }
    println!("token store: {token_store}");
    Ok(())
}
