//! Cluster configuration

use canopy_core::{CanopyError, CanopyResult};

/// First child listens here; child `n` gets `BASE_PORT + n`
pub const BASE_PORT: u16 = 3200;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterConfig {
    /// Port of the main instance, passed through to every child
    pub main_port: u16,
    /// Number of children to keep running
    pub count: u16,
    pub program: String,
    pub args: Vec<String>,
}

impl ClusterConfig {
    pub fn from_env() -> CanopyResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// `CLUSTER_COUNT` and `CHILD_COMMAND` are required
    pub fn from_lookup<F>(lookup: F) -> CanopyResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let main_port = match lookup("MAIN_PORT") {
            Some(raw) => parse(&raw, "MAIN_PORT")?,
            None => 3000,
        };
        let count: u16 = lookup("CLUSTER_COUNT")
            .ok_or_else(|| CanopyError::Config("CLUSTER_COUNT is not set".into()))
            .and_then(|raw| parse(&raw, "CLUSTER_COUNT"))?;
        if count == 0 {
            return Err(CanopyError::Config("CLUSTER_COUNT must be at least 1".into()));
        }
        if BASE_PORT.checked_add(count - 1).is_none() {
            return Err(CanopyError::Config(format!(
                "CLUSTER_COUNT {} overflows the port range",
                count
            )));
        }

        let command = lookup("CHILD_COMMAND").unwrap_or_default();
        let mut words = command.split_whitespace().map(String::from);
        let program = words
            .next()
            .ok_or_else(|| CanopyError::Config("CHILD_COMMAND is not set".into()))?;

        Ok(ClusterConfig {
            main_port,
            count,
            program,
            args: words.collect(),
        })
    }

    pub fn child_port(&self, index: u16) -> u16 {
        BASE_PORT.saturating_add(index)
    }
}

fn parse<T: std::str::FromStr>(raw: &str, key: &str) -> CanopyResult<T> {
    raw.trim()
        .parse()
        .map_err(|_| CanopyError::Config(format!("{} is not a valid number: {:?}", key, raw)))
}
