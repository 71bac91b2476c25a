use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use envspot_auth::IdentityClientConfig;
use envspot_store::PgStoreOptions;

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub bind_addr: SocketAddr,
    pub db_url: String,
    pub db_max_connections: u32,
    pub db_query_timeout_ms: u64,
    pub identity_url: String,
    pub identity_timeout_ms: u64,
    pub list_buffer: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupError {
    pub code: &'static str,
    pub message: String,
}

impl std::fmt::Display for StartupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for StartupError {}

impl RegistryConfig {
    pub fn load() -> Result<Self, StartupError> {
        let mut merged = HashMap::new();

        if let Ok(config_path) = std::env::var("ENVSPOT_CONFIG_PATH") {
            let config_path = config_path.trim();
            if !config_path.is_empty() {
                let file_kv = parse_env_file(config_path)?;
                merged.extend(file_kv);
            }
        }

        merged.extend(std::env::vars());

        Self::from_kv(&merged)
    }

    pub fn from_kv(kv: &HashMap<String, String>) -> Result<Self, StartupError> {
        let bind_addr = parse_socket_addr(
            kv.get("ENVSPOT_BIND_ADDR"),
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9090),
            "ENVSPOT_BIND_ADDR",
        )?;

        let db_url = require_nonempty(kv, "ENVSPOT_DB_URL")?;
        let db_max_connections = parse_num(
            kv.get("ENVSPOT_DB_MAX_CONNECTIONS"),
            8,
            "ENVSPOT_DB_MAX_CONNECTIONS",
        )?;
        if db_max_connections == 0 {
            return Err(StartupError {
                code: "ERR_INVALID_CONFIG",
                message: "ENVSPOT_DB_MAX_CONNECTIONS must be >= 1".to_string(),
            });
        }
        let db_query_timeout_ms = parse_num(
            kv.get("ENVSPOT_DB_QUERY_TIMEOUT_MS"),
            2000,
            "ENVSPOT_DB_QUERY_TIMEOUT_MS",
        )?;

        let identity_url = require_nonempty(kv, "ENVSPOT_IDENTITY_URL")?;
        if !(identity_url.starts_with("http://") || identity_url.starts_with("https://")) {
            return Err(StartupError {
                code: "ERR_INVALID_CONFIG",
                message: "ENVSPOT_IDENTITY_URL must be an http(s) URL".to_string(),
            });
        }
        let identity_timeout_ms = parse_num(
            kv.get("ENVSPOT_IDENTITY_TIMEOUT_MS"),
            500,
            "ENVSPOT_IDENTITY_TIMEOUT_MS",
        )?;

        let list_buffer = parse_num(kv.get("ENVSPOT_LIST_BUFFER"), 16, "ENVSPOT_LIST_BUFFER")?;
        if list_buffer == 0 {
            return Err(StartupError {
                code: "ERR_INVALID_CONFIG",
                message: "ENVSPOT_LIST_BUFFER must be >= 1".to_string(),
            });
        }

        Ok(Self {
            bind_addr,
            db_url,
            db_max_connections,
            db_query_timeout_ms,
            identity_url,
            identity_timeout_ms,
            list_buffer,
        })
    }

    pub fn store_options(&self) -> PgStoreOptions {
        PgStoreOptions {
            max_connections: self.db_max_connections,
            query_timeout: Duration::from_millis(self.db_query_timeout_ms),
            list_buffer: self.list_buffer,
        }
    }

    pub fn identity_client_config(&self) -> IdentityClientConfig {
        IdentityClientConfig {
            base_url: self.identity_url.clone(),
            timeout: Duration::from_millis(self.identity_timeout_ms),
        }
    }
}

fn parse_env_file(path: &str) -> Result<HashMap<String, String>, StartupError> {
    let contents = std::fs::read_to_string(path).map_err(|_| StartupError {
        code: "ERR_CONFIG_FILE_READ",
        message: format!("failed to read config file at {}", path),
    })?;

    let mut kv = HashMap::new();

    for (idx, raw_line) in contents.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let (key, value) = line.split_once('=').ok_or_else(|| StartupError {
            code: "ERR_CONFIG_FILE_PARSE",
            message: format!("invalid config line {} (expected KEY=VALUE)", idx + 1),
        })?;

        let key = key.trim();
        if key.is_empty() {
            return Err(StartupError {
                code: "ERR_CONFIG_FILE_PARSE",
                message: format!("invalid config line {} (empty key)", idx + 1),
            });
        }

        kv.insert(key.to_string(), strip_quotes(value.trim()));
    }

    Ok(kv)
}

fn strip_quotes(s: &str) -> String {
    let bytes = s.as_bytes();
    if bytes.len() >= 2 {
        let first = bytes[0];
        let last = bytes[bytes.len() - 1];
        if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') {
            return s[1..bytes.len() - 1].to_string();
        }
    }
    s.to_string()
}

fn require_nonempty(
    kv: &HashMap<String, String>,
    key: &'static str,
) -> Result<String, StartupError> {
    match kv.get(key).map(|v| v.trim()) {
        Some(value) if !value.is_empty() => Ok(value.to_string()),
        _ => Err(StartupError {
            code: "ERR_MISSING_CONFIG",
            message: format!("missing required config key {}", key),
        }),
    }
}

fn parse_socket_addr(
    value: Option<&String>,
    default: SocketAddr,
    key: &'static str,
) -> Result<SocketAddr, StartupError> {
    match value {
        None => Ok(default),
        Some(v) if v.trim().is_empty() => Ok(default),
        Some(v) => v.trim().parse::<SocketAddr>().map_err(|_| StartupError {
            code: "ERR_INVALID_CONFIG",
            message: format!("{} must be a valid host:port socket address", key),
        }),
    }
}

fn parse_num<T: FromStr>(
    value: Option<&String>,
    default: T,
    key: &'static str,
) -> Result<T, StartupError> {
    match value {
        None => Ok(default),
        Some(v) if v.trim().is_empty() => Ok(default),
        Some(v) => v.trim().parse::<T>().map_err(|_| StartupError {
            code: "ERR_INVALID_CONFIG",
            message: format!("{} must be an integer", key),
        }),
    }
}
