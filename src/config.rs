//! Loading of server and client configuration files

use anyhow::{Context, Result};
use gank_client::ClientConfig;
use gank_control::ServerConfig;
use serde::de::DeserializeOwned;
use std::fs;
use std::path::Path;

fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let json = fs::read_to_string(path)
        .context(format!("Failed to read config file: {:?}", path))?;
    serde_json::from_str(&json).context(format!("Failed to parse config file: {:?}", path))
}

/// Read and validate a server config file
pub fn load_server_config(path: &Path) -> Result<ServerConfig> {
    let config: ServerConfig = load_json(path)?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid server config {:?}: {}", path, e))?;
    Ok(config)
}

/// Read and validate a client config file
pub fn load_client_config(path: &Path) -> Result<ClientConfig> {
    let config: ClientConfig = load_json(path)?;
    config
        .validate()
        .context(format!("Invalid client config: {:?}", path))?;
    Ok(config)
}
