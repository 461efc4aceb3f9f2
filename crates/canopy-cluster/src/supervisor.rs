//! Child process supervision
//!
//! Every child runs on its own task that forwards output lines and waits for
//! either the process to exit or the stop signal, in which case the process
//! is killed.

use std::process::{ExitStatus, Stdio};

use canopy_core::{CanopyError, CanopyResult};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::config::ClusterConfig;

/// How a child finished
#[derive(Debug)]
pub struct ChildExit {
    pub index: u16,
    pub port: u16,
    /// `None` when the child was killed by the supervisor
    pub status: Option<ExitStatus>,
}

/// Running cluster
pub struct Supervisor {
    tasks: JoinSet<ChildExit>,
    stop: watch::Sender<bool>,
}

impl Supervisor {
    /// Spawn every child; a spawn failure kills the ones already started
    pub fn launch(config: &ClusterConfig) -> CanopyResult<Self> {
        let (stop, _) = watch::channel(false);
        let mut supervisor = Supervisor {
            tasks: JoinSet::new(),
            stop,
        };

        for index in 0..config.count {
            let port = config.child_port(index);
            match spawn_child(config, port) {
                Ok(child) => {
                    tracing::info!(child = index, port, pid = ?child.id(), "Child started");
                    let stop = supervisor.stop.subscribe();
                    supervisor.tasks.spawn(supervise(index, port, child, stop));
                }
                Err(e) => {
                    supervisor.stop();
                    return Err(e);
                }
            }
        }
        Ok(supervisor)
    }

    /// Ask every child to stop
    pub fn stop(&self) {
        // Send fails only when no child task is listening.
        let _ = self.stop.send(true);
    }

    /// Wait until every child has exited
    pub async fn wait(&mut self) -> Vec<ChildExit> {
        let mut exits = Vec::new();
        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok(exit) => exits.push(exit),
                Err(e) => tracing::error!(error = %e, "Child task failed"),
            }
        }
        exits
    }

    /// Run until Ctrl-C or until every child has exited
    pub async fn run(mut self) -> Vec<ChildExit> {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    tracing::error!(error = %e, "Failed to listen for Ctrl-C");
                }
            }
            exits = self.wait() => return exits,
        }
        tracing::info!("Stopping cluster");
        self.stop();
        self.wait().await
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn spawn_child(config: &ClusterConfig, port: u16) -> CanopyResult<Child> {
    Command::new(&config.program)
        .args(&config.args)
        .env("PORT", port.to_string())
        .env("MAIN_PORT", config.main_port.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| {
            CanopyError::FatalLocalFailure(format!("failed to spawn {}: {}", config.program, e))
        })
}

async fn supervise(
    index: u16,
    port: u16,
    mut child: Child,
    mut stop: watch::Receiver<bool>,
) -> ChildExit {
    let mut forwards = JoinSet::new();
    if let Some(stdout) = child.stdout.take() {
        forwards.spawn(forward(index, port, stdout, false));
    }
    if let Some(stderr) = child.stderr.take() {
        forwards.spawn(forward(index, port, stderr, true));
    }

    let status = tokio::select! {
        status = child.wait() => match status {
            Ok(status) => {
                tracing::warn!(child = index, port, %status, "Child exited");
                Some(status)
            }
            Err(e) => {
                tracing::error!(child = index, port, error = %e, "Failed to wait for child");
                None
            }
        },
        _ = async { let _ = stop.wait_for(|stop| *stop).await; } => {
            if let Err(e) = child.kill().await {
                tracing::error!(child = index, port, error = %e, "Failed to kill child");
            }
            tracing::info!(child = index, port, "Child killed");
            None
        }
    };

    // Drain what the child wrote before it went away.
    while forwards.join_next().await.is_some() {}
    ChildExit {
        index,
        port,
        status,
    }
}

async fn forward<R>(index: u16, port: u16, stream: R, stderr: bool)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if stderr => tracing::warn!(child = index, port, "{}", line),
            Ok(Some(line)) => tracing::info!(child = index, port, "{}", line),
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(child = index, port, error = %e, "Output stream closed");
                break;
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config(count: u16, command: &str) -> ClusterConfig {
        let mut words = command.split(' ').map(String::from);
        ClusterConfig {
            main_port: 3000,
            count,
            program: words.next().unwrap(),
            args: words.collect(),
        }
    }

    #[tokio::test]
    async fn test_children_get_sequential_ports() {
        let mut supervisor = Supervisor::launch(&config(3, "true")).unwrap();
        let mut exits = supervisor.wait().await;
        exits.sort_by_key(|e| e.index);

        let ports: Vec<u16> = exits.iter().map(|e| e.port).collect();
        assert_eq!(ports, vec![3200, 3201, 3202]);
        assert!(exits.iter().all(|e| e.status.is_some_and(|s| s.success())));
    }

    #[tokio::test]
    async fn test_stop_kills_children() {
        let mut supervisor = Supervisor::launch(&config(2, "sleep 30")).unwrap();
        supervisor.stop();
        let exits = tokio::time::timeout(Duration::from_secs(5), supervisor.wait())
            .await
            .unwrap();
        assert_eq!(exits.len(), 2);
        assert!(exits.iter().all(|e| e.status.is_none()));
    }

    #[tokio::test]
    async fn test_spawn_failure_reported() {
        let result = Supervisor::launch(&config(2, "canopy-no-such-binary-12345"));
        assert!(matches!(result, Err(CanopyError::FatalLocalFailure(_))));
    }
}
