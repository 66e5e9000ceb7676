//! Environment-driven configuration.
//!
//! Every knob the server reads comes from a `SOTTO_*` environment variable
//! (with `.env` support via dotenvy). The resolved [`Config`] is an
//! immutable snapshot taken once at startup and handed to each component.

use {anyhow::Context, serde::Serialize, std::net::SocketAddr};

/// Resolved server configuration.
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    /// SQLite database path, or `:memory:` for tests.
    pub db_path: String,
    /// Listen address for the HTTP/WS server.
    pub bind: SocketAddr,
    /// Redis broker URL for cross-node fan-out; `None` runs single-node.
    pub broker_url: Option<String>,
    /// 32-byte key sealing inter-node broker payloads (hex-encoded in env).
    /// Mandatory when `broker_url` is set in production.
    #[serde(skip_serializing)]
    pub broker_key: Option<[u8; 32]>,
    /// Allowed CORS origins; empty means same-origin only.
    pub cors_origins: Vec<String>,
    /// Path to the FCM service-account credentials JSON.
    pub fcm_credentials_path: Option<String>,
    /// APNs bundle id used to derive the `.voip` topic.
    pub ios_bundle_id: String,
    /// Directory for encrypted media blobs.
    pub media_dir: String,
    /// Feature flag: store media in external object storage instead of disk.
    pub external_object_storage: bool,
    /// Log filter, e.g. `info` or `sotto_gateway=debug,info`.
    pub log_filter: String,
}

impl Config {
    /// Load configuration from the process environment (and `.env` if present).
    pub fn from_env() -> anyhow::Result<Self> {
        let _ = dotenvy::dotenv();

        let db_path = var_or("SOTTO_DB_PATH", "sotto.db");
        let bind = var_or("SOTTO_BIND", "127.0.0.1:8440")
            .parse::<SocketAddr>()
            .context("SOTTO_BIND is not a valid socket address")?;

        let broker_url = std::env::var("SOTTO_BROKER_URL").ok().filter(|v| !v.is_empty());
        let broker_key = match std::env::var("SOTTO_BROKER_KEY") {
            Ok(hex_key) if !hex_key.is_empty() => Some(parse_broker_key(&hex_key)?),
            _ => None,
        };
        if broker_url.is_some() && broker_key.is_none() {
            // Multi-node without sealing is only acceptable in dev setups.
            eprintln!("warning: SOTTO_BROKER_URL set without SOTTO_BROKER_KEY; broker payloads are unsealed");
        }

        let cors_origins = var_or("SOTTO_CORS_ORIGINS", "")
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
            .collect();

        Ok(Self {
            db_path,
            bind,
            broker_url,
            broker_key,
            cors_origins,
            fcm_credentials_path: std::env::var("SOTTO_FCM_CREDENTIALS").ok().filter(|v| !v.is_empty()),
            ios_bundle_id: var_or("SOTTO_IOS_BUNDLE_ID", "chat.sotto.app"),
            media_dir: var_or("SOTTO_MEDIA_DIR", "media"),
            external_object_storage: var_or("SOTTO_EXTERNAL_STORAGE", "0") == "1",
            log_filter: var_or("SOTTO_LOG", "info"),
        })
    }

    /// In-memory defaults for tests.
    #[must_use]
    pub fn for_tests() -> Self {
        Self {
            db_path: ":memory:".into(),
            bind: "127.0.0.1:0".parse().unwrap_or_else(|_| unreachable!()),
            broker_url: None,
            broker_key: None,
            cors_origins: vec![],
            fcm_credentials_path: None,
            ios_bundle_id: "chat.sotto.app".into(),
            media_dir: "media".into(),
            external_object_storage: false,
            log_filter: "debug".into(),
        }
    }
}

fn var_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn parse_broker_key(hex_key: &str) -> anyhow::Result<[u8; 32]> {
    let bytes = hex::decode(hex_key).context("SOTTO_BROKER_KEY is not valid hex")?;
    <[u8; 32]>::try_from(bytes.as_slice())
        .map_err(|_| anyhow::anyhow!("SOTTO_BROKER_KEY must be 32 bytes (64 hex chars)"))
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broker_key_must_be_32_bytes() {
        assert!(parse_broker_key("deadbeef").is_err());
        let key = parse_broker_key(&"ab".repeat(32)).unwrap();
        assert_eq!(key.len(), 32);
    }

    #[test]
    fn test_config_is_memory_backed() {
        let cfg = Config::for_tests();
        assert_eq!(cfg.db_path, ":memory:");
        assert!(cfg.broker_url.is_none());
    }
}
