//! Connect/disconnect hooks
//!
//! Operators can attach a shell command to backend arrival and departure.
//! Hooks run fire-and-forget with the endpoint described in environment
//! variables; a failing hook is logged and never affects routing.

use std::sync::Arc;

use backhaul_control::Endpoint;
use tokio::process::Command;
use tracing::{debug, warn};

/// Spawn a hook command with the endpoint context in its environment.
pub fn spawn_hook(command: &str, service: &str, endpoint: &Arc<Endpoint>) {
    let mut hook = Command::new("sh");
    hook.arg("-c")
        .arg(command)
        .env("BACKHAUL_SERVICE", service)
        .env("BACKHAUL_PID", endpoint.pid.to_string())
        .env("BACKHAUL_DISPATCH_PORT", endpoint.listen_port.to_string())
        .env("BACKHAUL_REMOTE_ADDR", &endpoint.remote_addr)
        .env("BACKHAUL_REMOTE_PORT", endpoint.remote_port.to_string())
        .env("BACKHAUL_INSTANCE", endpoint.config.instance.to_string())
        .env("BACKHAUL_LABEL", &endpoint.config.label);

    let command = command.to_string();
    let service = service.to_string();
    match hook.spawn() {
        Ok(mut child) => {
            tokio::spawn(async move {
                match child.wait().await {
                    Ok(status) if status.success() => {
                        debug!("Hook '{}' for service {} finished", command, service);
                    }
                    Ok(status) => {
                        warn!(
                            "Hook '{}' for service {} exited with {}",
                            command, service, status
                        );
                    }
                    Err(e) => {
                        warn!("Hook '{}' for service {} failed: {}", command, service, e);
                    }
                }
            });
        }
        Err(e) => {
            warn!(
                "Failed to spawn hook '{}' for service {}: {}",
                command, service, e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use backhaul_proto::{Announcement, ServiceConfig};
    use std::time::Duration;

    fn test_endpoint() -> Arc<Endpoint> {
        Arc::new(Endpoint::from_announcement(Announcement {
            pid: 321,
            listen_port: 9321,
            remote_addr: "203.0.113.5".to_string(),
            remote_port: 40321,
            config: ServiceConfig {
                port: 80,
                instance: 2,
                label: "canary".to_string(),
            },
            uid: 1000,
            uname: "web".to_string(),
        }))
    }

    #[tokio::test]
    async fn hook_runs_with_endpoint_environment() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("hook.out");
        let command = format!(
            "echo \"$BACKHAUL_SERVICE $BACKHAUL_PID $BACKHAUL_DISPATCH_PORT $BACKHAUL_INSTANCE\" > {}",
            out.display()
        );

        spawn_hook(&command, "web", &test_endpoint());

        let mut content = String::new();
        for _ in 0..50 {
            content = std::fs::read_to_string(&out).unwrap_or_default();
            if !content.trim().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(content.trim(), "web 321 9321 2");
    }

    #[tokio::test]
    async fn failing_hook_is_not_fatal() {
        spawn_hook("exit 3", "web", &test_endpoint());
        spawn_hook("/nonexistent/binary", "web", &test_endpoint());
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}
