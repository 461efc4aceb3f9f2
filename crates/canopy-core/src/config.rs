//! Node configuration
//!
//! Every node process is configured from its environment. The protocol
//! timings default to the reference values and are only overridden in tests.

use std::time::Duration;

use crate::{CanopyError, CanopyResult, SessionToken};

/// Upstream link must open within this bound
pub const ATTACH_TIMEOUT: Duration = Duration::from_secs(4);

/// Delay before a relocation instruction is sent to an evicted occupant
pub const BUMP_GRACE: Duration = Duration::from_millis(100);

/// Delay before a viewer-facing node with no viewers shuts down
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Consecutive attach timeouts after which a node gives up and closes
pub const MAX_ATTACH_ATTEMPTS: u32 = 5;

/// Per-node configuration
#[derive(Clone, Debug)]
pub struct NodeConfig {
    /// Local listening port
    pub port: u16,
    /// Signaling endpoint
    pub signaling_host: String,
    /// Signaling authentication key
    pub signaling_key: String,
    /// Peer transport broker host
    pub transport_host: String,
    /// Peer transport broker port
    pub transport_port: u16,
    /// Maximum simultaneous downstream links
    pub fanout_capacity: usize,
    /// Shared secret identifying tree-internal links
    pub session_token: SessionToken,
    /// Static asset host
    pub file_host: String,
    pub attach_timeout: Duration,
    /// Attach timeouts tolerated in a row before closing
    pub max_attach_attempts: u32,
    pub bump_grace: Duration,
    pub shutdown_grace: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            port: 3200,
            signaling_host: String::from("ws://127.0.0.1:3000"),
            signaling_key: String::new(),
            transport_host: String::from("127.0.0.1"),
            transport_port: 9000,
            fanout_capacity: 4,
            session_token: SessionToken::new("canopy"),
            file_host: String::new(),
            attach_timeout: ATTACH_TIMEOUT,
            max_attach_attempts: MAX_ATTACH_ATTEMPTS,
            bump_grace: BUMP_GRACE,
            shutdown_grace: SHUTDOWN_GRACE,
        }
    }
}

impl NodeConfig {
    /// Load from the process environment
    pub fn from_env() -> CanopyResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup
    ///
    /// `MAX_STREAM_CONNECTIONS` and `CHILD_KEY` are required; everything else
    /// falls back to the defaults.
    pub fn from_lookup<F>(lookup: F) -> CanopyResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = NodeConfig::default();

        let fanout_capacity: usize = parse_required(&lookup, "MAX_STREAM_CONNECTIONS")?;
        if fanout_capacity == 0 {
            return Err(CanopyError::Config(
                "MAX_STREAM_CONNECTIONS must be at least 1".into(),
            ));
        }
        let session_token = lookup("CHILD_KEY")
            .filter(|v| !v.is_empty())
            .map(SessionToken::new)
            .ok_or_else(|| CanopyError::Config("CHILD_KEY is not set".into()))?;

        Ok(NodeConfig {
            port: parse_optional(&lookup, "PORT")?.unwrap_or(defaults.port),
            signaling_host: lookup("SOCKET_HOST").unwrap_or(defaults.signaling_host),
            signaling_key: lookup("SOCKET_KEY").unwrap_or(defaults.signaling_key),
            transport_host: lookup("PEER_HOST").unwrap_or(defaults.transport_host),
            transport_port: parse_optional(&lookup, "PEER_PORT")?
                .unwrap_or(defaults.transport_port),
            fanout_capacity,
            session_token,
            file_host: lookup("FILE_HOST").unwrap_or(defaults.file_host),
            ..defaults
        })
    }

    pub fn with_fanout(mut self, capacity: usize) -> Self {
        self.fanout_capacity = capacity.max(1);
        self
    }

    pub fn with_token(mut self, token: SessionToken) -> Self {
        self.session_token = token;
        self
    }

    pub fn with_attach_timeout(mut self, timeout: Duration) -> Self {
        self.attach_timeout = timeout;
        self
    }

    pub fn with_max_attach_attempts(mut self, attempts: u32) -> Self {
        self.max_attach_attempts = attempts.max(1);
        self
    }

    pub fn with_bump_grace(mut self, grace: Duration) -> Self {
        self.bump_grace = grace;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// The transport broker uses TLS on the standard port
    pub fn transport_secure(&self) -> bool {
        self.transport_port == 443
    }
}

fn parse_optional<F, T>(lookup: &F, key: &str) -> CanopyResult<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| CanopyError::Config(format!("{} is not a valid number: {:?}", key, raw))),
    }
}

fn parse_required<F, T>(lookup: &F, key: &str) -> CanopyResult<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    parse_optional(lookup, key)?.ok_or_else(|| CanopyError::Config(format!("{} is not set", key)))
}
