//! Port-forward supervisor.
//!
//! Each started mapping is one `ssh -N` child keyed by mapping id:
//!
//! - `local`:  `ssh -N -L <source_port>:<target_host>:<target_port> <gateway>`
//! - `remote`: `ssh -N -R <source_port>:<target_host>:<target_port> <gateway>`
//!
//! `ExitOnForwardFailure=yes` makes ssh exit when the bind fails, so a
//! broken forward shows up as an exit. Every transition is reported to the
//! dashboard as a tunnel-status envelope: `running` after spawn, `error`
//! when the child exits on its own, `stopped` after a stop.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::task::{TaskEnvelope, TaskKind, TunnelAction, TunnelStatusReport, TunnelTask};
use crate::tunnels::model::{MappingType, TunnelStatus};

/// Keep this much of ssh's stderr for the error report.
const STDERR_TAIL: usize = 512;

struct RunningForward {
    generation: u64,
    stop: CancellationToken,
}

#[derive(Clone)]
pub struct ForwardSupervisor {
    ssh_binary: String,
    reports: mpsc::Sender<TaskEnvelope>,
    forwards: Arc<Mutex<HashMap<u64, RunningForward>>>,
    generation: Arc<AtomicU64>,
}

impl ForwardSupervisor {
    pub fn new(ssh_binary: &str, reports: mpsc::Sender<TaskEnvelope>) -> Self {
        Self {
            ssh_binary: ssh_binary.to_string(),
            reports,
            forwards: Arc::new(Mutex::new(HashMap::new())),
            generation: Arc::new(AtomicU64::new(1)),
        }
    }

    pub async fn handle(&self, task: TunnelTask) {
        match task.action {
            TunnelAction::Start => self.start(&task).await,
            TunnelAction::Stop => self.stop(task.mapping_id).await,
            TunnelAction::Status => {
                let status = if self.forwards.lock().await.contains_key(&task.mapping_id) {
                    TunnelStatus::Running
                } else {
                    TunnelStatus::Stopped
                };
                self.report(task.mapping_id, status, String::new(), None);
            }
        }
    }

    async fn start(&self, task: &TunnelTask) {
        let id = task.mapping_id;
        self.cancel(id).await;

        let args = match ssh_args(task) {
            Ok(args) => args,
            Err(e) => {
                warn!(mapping_id = id, "Refusing forward: {e}");
                self.report(id, TunnelStatus::Error, e, None);
                return;
            }
        };
        let mut child = match Command::new(&self.ssh_binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                warn!(mapping_id = id, "Failed to spawn {}: {e}", self.ssh_binary);
                self.report(id, TunnelStatus::Error, format!("spawn failed: {e}"), None);
                return;
            }
        };
        let pid = child.id();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let stop = CancellationToken::new();
        self.forwards.lock().await.insert(
            id,
            RunningForward {
                generation,
                stop: stop.clone(),
            },
        );
        info!(mapping_id = id, "Forward started (pid {pid:?}): {}", args.join(" "));
        self.report(id, TunnelStatus::Running, String::new(), pid);

        let stderr = child.stderr.take();
        let supervisor = self.clone();
        tokio::spawn(async move {
            let stderr_tail = tokio::spawn(async move {
                let mut buf = String::new();
                if let Some(mut stderr) = stderr {
                    let _ = stderr.read_to_string(&mut buf).await;
                }
                buf
            });
            tokio::select! {
                status = child.wait() => {
                    let tail = stderr_tail.await.unwrap_or_default();
                    let exited_on_its_own = {
                        let mut forwards = supervisor.forwards.lock().await;
                        if forwards.get(&id).is_some_and(|f| f.generation == generation) {
                            forwards.remove(&id);
                            true
                        } else {
                            false
                        }
                    };
                    if exited_on_its_own {
                        let message = exit_message(status.ok(), &tail);
                        warn!(mapping_id = id, "Forward exited: {message}");
                        supervisor.report(id, TunnelStatus::Error, message, pid);
                    }
                }
                () = stop.cancelled() => {
                    let _ = child.kill().await;
                    debug!(mapping_id = id, "Forward child killed");
                }
            }
        });
    }

    async fn stop(&self, id: u64) {
        if self.cancel(id).await {
            info!(mapping_id = id, "Forward stopped");
        }
        self.report(id, TunnelStatus::Stopped, String::new(), None);
    }

    async fn cancel(&self, id: u64) -> bool {
        match self.forwards.lock().await.remove(&id) {
            Some(forward) => {
                forward.stop.cancel();
                true
            }
            None => false,
        }
    }

    /// Kill every forward (agent shutdown).
    pub async fn stop_all(&self) {
        for (_, forward) in self.forwards.lock().await.drain() {
            forward.stop.cancel();
        }
    }

    pub async fn running(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.forwards.lock().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    fn report(&self, mapping_id: u64, status: TunnelStatus, error: String, pid: Option<u32>) {
        let report = TunnelStatusReport {
            mapping_id,
            status,
            error,
            pid,
        };
        match TaskEnvelope::new(TaskKind::TunnelStatus, &report) {
            Ok(envelope) => {
                if self.reports.try_send(envelope).is_err() {
                    warn!(mapping_id, "Report queue full, dropping tunnel status");
                }
            }
            Err(e) => warn!(mapping_id, "Failed to encode tunnel status: {e}"),
        }
    }
}

fn exit_message(status: Option<std::process::ExitStatus>, stderr: &str) -> String {
    let code = status
        .and_then(|s| s.code())
        .map_or_else(|| "signal".to_string(), |c| c.to_string());
    let stderr = stderr.trim();
    let start = stderr
        .char_indices()
        .rev()
        .nth(STDERR_TAIL)
        .map_or(0, |(i, _)| i);
    if stderr.is_empty() {
        format!("ssh exited ({code})")
    } else {
        format!("ssh exited ({code}): {}", &stderr[start..])
    }
}

/// Split `user@host[:port]` into destination and port.
fn split_gateway(gateway: &str) -> (&str, Option<&str>) {
    match gateway.rsplit_once(':') {
        Some((dest, port))
            if !dest.contains(':') && !port.is_empty() && port.parse::<u16>().is_ok() =>
        {
            (dest, Some(port))
        }
        _ => (gateway, None),
    }
}

fn ssh_args(task: &TunnelTask) -> Result<Vec<String>, String> {
    let gateway = task.gateway_host.trim();
    if gateway.is_empty() {
        return Err("no tunnel gateway configured".into());
    }
    if task.source_port == 0 || task.target_port == 0 || task.target_host.is_empty() {
        return Err("incomplete forward definition".into());
    }
    let (dest, port) = split_gateway(gateway);

    let mut args = vec![
        "-N".to_string(),
        "-o".to_string(),
        "ExitOnForwardFailure=yes".to_string(),
        "-o".to_string(),
        "BatchMode=yes".to_string(),
    ];
    for (key, value) in &task.options {
        args.push("-o".to_string());
        args.push(format!("{key}={value}"));
    }
    let flag = match task.mapping_type {
        MappingType::Local => "-L",
        MappingType::Remote => "-R",
    };
    args.push(flag.to_string());
    args.push(format!(
        "{}:{}:{}",
        task.source_port, task.target_host, task.target_port
    ));
    if let Some(port) = port {
        args.push("-p".to_string());
        args.push(port.to_string());
    }
    args.push(dest.to_string());
    Ok(args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::os::unix::fs::PermissionsExt;
    use std::time::Duration;

    fn task(mapping_type: MappingType, gateway: &str) -> TunnelTask {
        TunnelTask {
            action: TunnelAction::Start,
            mapping_id: 9,
            mapping_type,
            source_port: 15432,
            target_host: "127.0.0.1".into(),
            target_port: 5432,
            gateway_host: gateway.into(),
            options: BTreeMap::from([("ServerAliveInterval".to_string(), "30".to_string())]),
        }
    }

    async fn next_report(rx: &mut mpsc::Receiver<TaskEnvelope>) -> TunnelStatusReport {
        let env = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(env.kind, TaskKind::TunnelStatus.code());
        serde_json::from_str(&env.data).unwrap()
    }

    #[test]
    fn local_forward_args() {
        let args = ssh_args(&task(MappingType::Local, "tunnel@gw.example.com:2222")).unwrap();
        assert_eq!(
            args,
            vec![
                "-N",
                "-o",
                "ExitOnForwardFailure=yes",
                "-o",
                "BatchMode=yes",
                "-o",
                "ServerAliveInterval=30",
                "-L",
                "15432:127.0.0.1:5432",
                "-p",
                "2222",
                "tunnel@gw.example.com",
            ]
        );
    }

    #[test]
    fn remote_forward_without_port() {
        let args = ssh_args(&task(MappingType::Remote, "gw")).unwrap();
        assert!(args.windows(2).any(|w| w == ["-R", "15432:127.0.0.1:5432"]));
        assert_eq!(args.last().map(String::as_str), Some("gw"));
        assert!(!args.contains(&"-p".to_string()));
    }

    #[test]
    fn missing_gateway_rejected() {
        assert!(ssh_args(&task(MappingType::Local, " ")).is_err());
    }

    #[test]
    fn exit_message_keeps_stderr_tail() {
        let long = "x".repeat(2000);
        let msg = exit_message(None, &long);
        assert!(msg.starts_with("ssh exited (signal): "));
        assert!(msg.len() < 600);
    }

    #[tokio::test]
    async fn failing_child_reports_error() {
        let (tx, mut rx) = mpsc::channel(8);
        let sup = ForwardSupervisor::new("false", tx);
        sup.handle(task(MappingType::Local, "gw")).await;
        assert_eq!(next_report(&mut rx).await.status, TunnelStatus::Running);
        let report = next_report(&mut rx).await;
        assert_eq!(report.status, TunnelStatus::Error);
        assert!(report.error.starts_with("ssh exited (1)"));
        assert!(sup.running().await.is_empty());
    }

    #[tokio::test]
    async fn stop_kills_child_and_reports_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let fake = dir.path().join("fake-ssh");
        std::fs::write(&fake, "#!/bin/sh\nexec sleep 30\n").unwrap();
        std::fs::set_permissions(&fake, std::fs::Permissions::from_mode(0o755)).unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        let sup = ForwardSupervisor::new(fake.to_str().unwrap(), tx);
        sup.handle(task(MappingType::Local, "gw")).await;
        assert_eq!(next_report(&mut rx).await.status, TunnelStatus::Running);
        assert_eq!(sup.running().await, vec![9]);

        sup.handle(TunnelTask::stop(9)).await;
        assert_eq!(next_report(&mut rx).await.status, TunnelStatus::Stopped);
        assert!(sup.running().await.is_empty());
        // no late error report from the killed child
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn stop_of_unknown_mapping_still_reports_stopped() {
        let (tx, mut rx) = mpsc::channel(8);
        let sup = ForwardSupervisor::new("ssh", tx);
        sup.handle(TunnelTask::stop(3)).await;
        let report = next_report(&mut rx).await;
        assert_eq!((report.mapping_id, report.status), (3, TunnelStatus::Stopped));
    }
}
