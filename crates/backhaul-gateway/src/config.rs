//! Gateway configuration file support
//!
//! Services can be declared in a `backhaul.yml` file, inline on the command
//! line with `--service NAME=PORT`, or both; inline declarations win on name
//! collisions.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Gateway configuration file format
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GatewayConfig {
    /// Directory holding control sockets and liveness lock files
    pub run_dir: Option<PathBuf>,

    /// Global default settings applied to all services
    #[serde(default)]
    pub defaults: ServiceDefaults,

    /// Service definitions
    #[serde(default)]
    pub services: Vec<ServiceSpec>,
}

/// Default settings applied to all services unless overridden
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceDefaults {
    /// Host the public listeners bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Seconds a backend may take to deliver its announcement
    #[serde(default = "default_announce_timeout")]
    pub announce_timeout_secs: u64,
}

impl Default for ServiceDefaults {
    fn default() -> Self {
        Self {
            host: default_host(),
            announce_timeout_secs: default_announce_timeout(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_announce_timeout() -> u64 {
    10
}

/// A single service definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSpec {
    /// Service name (required, must be unique); names the control socket
    pub name: String,

    /// Public TCP port clients connect to
    pub listen: u16,

    /// Override the announcement deadline for this service
    pub announce_timeout_secs: Option<u64>,

    /// Command run when a backend connects
    pub on_connect: Option<String>,

    /// Command run when a backend disconnects
    pub on_disconnect: Option<String>,
}

impl GatewayConfig {
    /// Load config from a specific file path
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        Self::parse(&content)
    }

    /// Parse config from YAML string
    pub fn parse(content: &str) -> Result<Self> {
        let config: GatewayConfig =
            serde_yaml::from_str(content).context("Failed to parse YAML config")?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    fn validate(&self) -> Result<()> {
        let mut names = std::collections::HashSet::new();
        let mut ports = std::collections::HashSet::new();
        for service in &self.services {
            if !is_valid_service_name(&service.name) {
                anyhow::bail!(
                    "Invalid service name '{}': must be alphanumeric with hyphens/underscores only",
                    service.name
                );
            }
            if !names.insert(&service.name) {
                anyhow::bail!("Duplicate service name: {}", service.name);
            }
            if service.listen == 0 {
                anyhow::bail!("Service '{}' has no listen port", service.name);
            }
            if !ports.insert(service.listen) {
                anyhow::bail!(
                    "Duplicate listen port {} (service '{}')",
                    service.listen,
                    service.name
                );
            }
        }
        Ok(())
    }

    /// Fold inline `NAME=PORT` declarations in; they replace config file
    /// entries with the same name.
    pub fn merge_inline_services(&mut self, inline: &[String]) -> Result<()> {
        for declaration in inline {
            let spec = parse_service_flag(declaration)?;
            self.services.retain(|existing| existing.name != spec.name);
            self.services.push(spec);
        }
        self.validate()
    }

    /// Find a service by name
    pub fn get_service(&self, name: &str) -> Option<&ServiceSpec> {
        self.services.iter().find(|s| s.name == name)
    }

    /// Generate a template config file content
    pub fn template() -> String {
        r#"# Backhaul Gateway Configuration
# One entry per logical service. Each service gets a control socket at
# <run_dir>/<name>.sock for backend announcements and a public TCP
# listener on its `listen` port.

# run_dir: /var/run/backhaul

defaults:
  host: "0.0.0.0"
  announce_timeout_secs: 10

services:
  - name: web
    listen: 8080

  # - name: ssh
  #   listen: 2222
  #   announce_timeout_secs: 30

  # Hooks run with BACKHAUL_SERVICE, BACKHAUL_PID, BACKHAUL_DISPATCH_PORT,
  # BACKHAUL_REMOTE_ADDR, BACKHAUL_REMOTE_PORT, BACKHAUL_INSTANCE and
  # BACKHAUL_LABEL in the environment.
  # - name: api
  #   listen: 9090
  #   on_connect: "scripts/backend-up.sh"
  #   on_disconnect: "scripts/backend-down.sh"
"#
        .to_string()
    }
}

impl ServiceSpec {
    /// Announcement deadline with the defaults applied.
    pub fn announce_timeout(&self, defaults: &ServiceDefaults) -> Duration {
        Duration::from_secs(
            self.announce_timeout_secs
                .unwrap_or(defaults.announce_timeout_secs),
        )
    }

    /// Public bind address with the defaults applied.
    pub fn bind_addr(&self, defaults: &ServiceDefaults) -> Result<SocketAddr> {
        format!("{}:{}", defaults.host, self.listen)
            .parse()
            .with_context(|| format!("Invalid bind address for service '{}'", self.name))
    }
}

/// Parse one `NAME=PORT` service declaration.
pub fn parse_service_flag(declaration: &str) -> Result<ServiceSpec> {
    let (name, port) = declaration.split_once('=').ok_or_else(|| {
        anyhow::anyhow!(
            "Invalid service declaration '{}'. Expected: NAME=PORT (e.g., web=8080)",
            declaration
        )
    })?;

    let listen: u16 = port.parse().map_err(|_| {
        anyhow::anyhow!(
            "Invalid port '{}' in service declaration '{}'",
            port,
            declaration
        )
    })?;

    Ok(ServiceSpec {
        name: name.to_string(),
        listen,
        announce_timeout_secs: None,
        on_connect: None,
        on_disconnect: None,
    })
}

/// Check if a service name is valid (alphanumeric, hyphens, underscores)
fn is_valid_service_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
}
