use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result, bail};
use uuid::Uuid;

use tandem_db::Limits;
use tandem_gateway::router::PresenceMode;
use tandem_types::permissions::PrivateDefault;

/// Secrets shipped in sample `.env` files. Refused at startup.
const PLACEHOLDER_SECRETS: &[&str] = &["change-me-to-a-random-string", "dev-secret-change-me"];

/// How envelopes reach other server processes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusMode {
    /// In-process only. Fine for a single process.
    Local,
    None,
    /// POST every envelope to these base URLs.
    Peers(Vec<String>),
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub addr: SocketAddr,
    pub db_path: PathBuf,
    pub jwt_secret: String,
    pub node_id: Uuid,
    pub bus: BusMode,
    pub bus_secret: String,
    pub presence: PresenceMode,
    pub private_default: PrivateDefault,
    pub limits: Limits,
    pub notification_poll_secs: u64,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str, default: &str| get(key).unwrap_or_else(|| default.to_string());

        let jwt_secret = get("TANDEM_JWT_SECRET").unwrap_or_default();
        if jwt_secret.is_empty() || PLACEHOLDER_SECRETS.contains(&jwt_secret.as_str()) {
            bail!("TANDEM_JWT_SECRET is unset or still a placeholder");
        }

        let host = var("TANDEM_HOST", "0.0.0.0");
        let port: u16 = parse("TANDEM_PORT", &var("TANDEM_PORT", "3000"))?;
        let addr: SocketAddr = format!("{}:{}", host, port)
            .parse()
            .with_context(|| format!("invalid bind address {}:{}", host, port))?;

        let node_id = match get("TANDEM_NODE_ID") {
            Some(raw) => parse("TANDEM_NODE_ID", &raw)?,
            None => Uuid::new_v4(),
        };

        let bus = match var("TANDEM_BUS", "local").as_str() {
            "local" => BusMode::Local,
            "none" => BusMode::None,
            "peers" => {
                let peers: Vec<String> = var("TANDEM_BUS_PEERS", "")
                    .split(',')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(String::from)
                    .collect();
                if peers.is_empty() {
                    bail!("TANDEM_BUS=peers needs at least one URL in TANDEM_BUS_PEERS");
                }
                BusMode::Peers(peers)
            }
            other => bail!("TANDEM_BUS must be local, none or peers (got '{}')", other),
        };
        let bus_secret = get("TANDEM_BUS_SECRET").unwrap_or_else(|| jwt_secret.clone());

        let presence: PresenceMode = parse("TANDEM_PRESENCE", &var("TANDEM_PRESENCE", "local"))?;
        // Shared presence rows are keyed by node; a stable id lets a
        // restarted node clear what its previous run left behind.
        if presence == PresenceMode::Shared && get("TANDEM_NODE_ID").is_none() {
            bail!("TANDEM_PRESENCE=shared needs a stable TANDEM_NODE_ID");
        }

        let limits = Limits {
            max_message_len: parse("TANDEM_MAX_MESSAGE_LEN", &var("TANDEM_MAX_MESSAGE_LEN", "4000"))?,
            recent_cap: parse("TANDEM_RECENT_CAP", &var("TANDEM_RECENT_CAP", "100"))?,
        };
        if limits.max_message_len == 0 || limits.recent_cap == 0 {
            bail!("message length and recent cap must be positive");
        }

        Ok(Self {
            addr,
            db_path: var("TANDEM_DB_PATH", "tandem.db").into(),
            jwt_secret,
            node_id,
            bus,
            bus_secret,
            presence,
            private_default: parse("TANDEM_PRIVATE_DEFAULT", &var("TANDEM_PRIVATE_DEFAULT", "creator_and_admins"))?,
            limits,
            notification_poll_secs: parse(
                "TANDEM_NOTIFICATION_POLL_SECS",
                &var("TANDEM_NOTIFICATION_POLL_SECS", "15"),
            )?,
        })
    }
}

fn parse<T>(key: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| anyhow::anyhow!("{}: invalid value '{}': {}", key, raw, e))
}
