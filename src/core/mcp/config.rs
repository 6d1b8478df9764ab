use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const CONFIG_ENV: &str = "MF_MCP_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "mcp.json";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct McpConfigFile {
    #[serde(rename = "mcpServers", default)]
    pub mcp_servers: BTreeMap<String, McpServerEntry>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct McpServerEntry {
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ServerTransport {
    /// Remote server over streamable HTTP, falling back to SSE.
    Url {
        url: String,
        headers: HashMap<String, String>,
    },
    /// Local child process over stdio.
    Stdio {
        command: String,
        args: Vec<String>,
        env: HashMap<String, String>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct McpServerSpec {
    pub id: String,
    pub transport: ServerTransport,
}

/// Explicit path, then `MF_MCP_CONFIG`, then `./mcp.json`.
pub fn resolve_config_path(explicit: Option<&Path>) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    if let Ok(from_env) = std::env::var(CONFIG_ENV)
        && !from_env.trim().is_empty()
    {
        return PathBuf::from(from_env);
    }
    PathBuf::from(DEFAULT_CONFIG_FILE)
}

/// Reads the config at `path`. A missing file means no servers are configured.
pub fn load_servers(path: &Path) -> Result<Vec<McpServerSpec>> {
    if !path.exists() {
        debug!("No MCP config at {}", path.display());
        return Ok(Vec::new());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read MCP config {}", path.display()))?;
    parse_servers(&raw).with_context(|| format!("Invalid MCP config {}", path.display()))
}

/// Entries with a `url` connect remotely; entries with only a `command` are launched locally.
/// Entries with neither are placeholders and are skipped.
pub fn parse_servers(raw: &str) -> Result<Vec<McpServerSpec>> {
    let file: McpConfigFile = serde_json::from_str(raw)?;
    let mut servers = Vec::new();
    for (id, entry) in file.mcp_servers {
        let url = entry.url.filter(|u| !u.trim().is_empty());
        let command = entry.command.filter(|c| !c.trim().is_empty());
        let transport = match (url, command) {
            (Some(url), _) => ServerTransport::Url {
                url,
                headers: entry.headers,
            },
            (None, Some(command)) => ServerTransport::Stdio {
                command,
                args: entry.args,
                env: entry.env,
            },
            (None, None) => {
                warn!("MCP server [{}] has neither url nor command; skipping", id);
                continue;
            }
        };
        servers.push(McpServerSpec { id, transport });
    }
    Ok(servers)
}
