//! Relay configuration sourced from environment variables.

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    str::FromStr,
    time::Duration,
};

use anyhow::{bail, Context, Result};

use crate::{
    handler::{ConnectionOptions, DisconnectPolicy, DEFAULT_MAX_FRAME_BYTES},
    mailbox::{DEFAULT_MAILBOX_CAPACITY, DEFAULT_QUEUE_CAPACITY},
    relay::RelayOptions,
    routing::{BroadcastPolicy, DeliveryStrategy},
};

/// Port the relay listens on when `NETWORK_PORT` is unset.
pub const DEFAULT_PORT: u16 = 55555;

/// Effective settings of a relay process.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelayConfig {
    /// Listener bind address.
    pub bind: SocketAddr,
    /// Relay core settings.
    pub relay: RelayOptions,
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            bind: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_PORT),
            relay: RelayOptions::default(),
        }
    }
}

impl RelayConfig {
    /// Reads the configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads the configuration through `lookup`, which returns the value of a variable if set.
    ///
    /// Unset or blank variables take their defaults. Values that fail to parse are errors.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let port = parse_var(var("NETWORK_PORT"), "NETWORK_PORT")?.unwrap_or(DEFAULT_PORT);
        let ip = parse_var(var("RELAY_BIND_ADDR"), "RELAY_BIND_ADDR")?
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));

        let queue_capacity = parse_capacity(
            var("RELAY_QUEUE_CAPACITY"),
            "RELAY_QUEUE_CAPACITY",
            DEFAULT_QUEUE_CAPACITY,
        )?;
        let mailbox_capacity = parse_capacity(
            var("RELAY_MAILBOX_CAPACITY"),
            "RELAY_MAILBOX_CAPACITY",
            DEFAULT_MAILBOX_CAPACITY,
        )?;
        let max_frame_bytes = parse_capacity(
            var("RELAY_MAX_FRAME_BYTES"),
            "RELAY_MAX_FRAME_BYTES",
            DEFAULT_MAX_FRAME_BYTES,
        )?;
        let mailbox_timeout = parse_var::<u64>(
            var("RELAY_MAILBOX_TIMEOUT_MS"),
            "RELAY_MAILBOX_TIMEOUT_MS",
        )?
        .map(Duration::from_millis);

        let disconnect_policy = var("RELAY_DISCONNECT_POLICY")
            .map(|value| parse_disconnect_policy(&value))
            .transpose()
            .context("parse RELAY_DISCONNECT_POLICY")?
            .unwrap_or_default();
        let delivery = var("RELAY_DELIVERY")
            .map(|value| parse_delivery(&value))
            .transpose()
            .context("parse RELAY_DELIVERY")?
            .unwrap_or_default();
        let broadcast_policy = var("RELAY_EMPTY_BROADCAST")
            .map(|value| parse_broadcast_policy(&value))
            .transpose()
            .context("parse RELAY_EMPTY_BROADCAST")?
            .unwrap_or_default();

        Ok(RelayConfig {
            bind: SocketAddr::new(ip, port),
            relay: RelayOptions {
                queue_capacity,
                delivery,
                broadcast_policy,
                connection: ConnectionOptions {
                    mailbox_capacity,
                    max_frame_bytes,
                    mailbox_timeout,
                    disconnect_policy,
                },
            },
        })
    }
}

fn parse_var<T>(value: Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .map(|value| value.parse::<T>())
        .transpose()
        .with_context(|| format!("parse {key}"))
}

fn parse_capacity(value: Option<String>, key: &str, default: usize) -> Result<usize> {
    match parse_var::<usize>(value, key)? {
        Some(0) => bail!("{key} must be greater than zero"),
        Some(capacity) => Ok(capacity),
        None => Ok(default),
    }
}

fn parse_disconnect_policy(value: &str) -> Result<DisconnectPolicy> {
    match value.to_ascii_lowercase().as_str() {
        "relay" => Ok(DisconnectPolicy::StopRelay),
        "connection" => Ok(DisconnectPolicy::CloseConnection),
        other => bail!("unknown disconnect policy `{other}`, expected `relay` or `connection`"),
    }
}

fn parse_broadcast_policy(value: &str) -> Result<BroadcastPolicy> {
    match value.to_ascii_lowercase().as_str() {
        "hold" => Ok(BroadcastPolicy::Hold),
        "drop" => Ok(BroadcastPolicy::Drop),
        other => bail!("unknown broadcast policy `{other}`, expected `hold` or `drop`"),
    }
}

fn parse_delivery(value: &str) -> Result<DeliveryStrategy> {
    let value = value.to_ascii_lowercase();
    match value.as_str() {
        "guaranteed" => Ok(DeliveryStrategy::Guaranteed),
        "best-effort" => Ok(DeliveryStrategy::BestEffort),
        other => match other.strip_prefix("timed:") {
            Some(ms) => {
                let ms: u64 = ms
                    .trim()
                    .parse()
                    .with_context(|| format!("parse timed delivery `{other}`"))?;
                Ok(DeliveryStrategy::TimedDelivery(Duration::from_millis(ms)))
            }
            None => bail!(
                "unknown delivery strategy `{other}`, expected `guaranteed`, `best-effort` or `timed:<ms>`"
            ),
        },
    }
}
