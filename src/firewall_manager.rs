use async_trait::async_trait;
use tokio::process::Command;
use tracing::{info, warn};

use crate::errors::{AgentError, AgentResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opens and closes host firewall rules for the game's network ports.
#[async_trait]
pub trait FirewallSync: Send + Sync {
    async fn open(&self, port: u16, protocol: Protocol, label: &str) -> AgentResult<()>;
    async fn close(&self, port: u16, protocol: Protocol) -> AgentResult<()>;
}

/// A network-facing option changing value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortBinding {
    pub option_name: String,
    pub protocol: Protocol,
    pub previous_port: Option<u16>,
    pub new_port: u16,
}

impl PortBinding {
    /// `None` for options that don't map to a firewall rule.
    pub fn for_option(option: &str, previous_port: Option<u16>, new_port: u16) -> Option<Self> {
        let protocol = match option {
            "Server Port" => Protocol::Tcp,
            "Query Port" => Protocol::Udp,
            _ => return None,
        };
        Some(Self {
            option_name: option.to_string(),
            protocol,
            previous_port,
            new_port,
        })
    }

    pub fn label(&self, description: &str) -> String {
        match self.protocol {
            Protocol::Tcp => format!("Allow {} game port", description),
            Protocol::Udp => format!("Allow {} query port", description),
        }
    }
}

/// Move the firewall rule for a changed port option.
pub async fn apply_port_change(
    firewall: &dyn FirewallSync,
    binding: &PortBinding,
    description: &str,
) -> AgentResult<()> {
    info!(
        "{} changed from {:?} to {}",
        binding.option_name, binding.previous_port, binding.new_port
    );
    if let Some(previous) = binding.previous_port {
        if previous != binding.new_port {
            firewall.close(previous, binding.protocol).await?;
        }
    }
    firewall
        .open(binding.new_port, binding.protocol, &binding.label(description))
        .await
}

#[derive(Debug, PartialEq)]
pub enum FirewallType {
    Ufw,
    Iptables,
    Firewalld,
    None,
}

/// [`FirewallSync`] backed by whichever host firewall is active.
pub struct FirewallManager;

impl FirewallManager {
    /// Detect which firewall is active on the system
    pub async fn detect_firewall() -> FirewallType {
        if let Ok(output) = Command::new("ufw").arg("status").output().await {
            let status = String::from_utf8_lossy(&output.stdout);
            if output.status.success() && status.contains("Status: active") {
                info!("Detected active UFW firewall");
                return FirewallType::Ufw;
            }
        }

        if let Ok(output) = Command::new("firewall-cmd").arg("--state").output().await {
            let status = String::from_utf8_lossy(&output.stdout);
            if output.status.success() && status.contains("running") {
                info!("Detected active firewalld");
                return FirewallType::Firewalld;
            }
        }

        if Command::new("iptables")
            .arg("-L")
            .arg("-n")
            .output()
            .await
            .is_ok()
        {
            info!("Using iptables for firewall management");
            return FirewallType::Iptables;
        }

        warn!("No firewall detected or iptables not available");
        FirewallType::None
    }

    async fn run(program: &str, args: &[&str]) -> AgentResult<std::process::Output> {
        Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|e| AgentError::FirewallError(format!("Failed to run {}: {}", program, e)))
    }

    async fn reload_firewalld() -> AgentResult<()> {
        let reload = Self::run("firewall-cmd", &["--reload"]).await?;
        if !reload.status.success() {
            let stderr = String::from_utf8_lossy(&reload.stderr);
            return Err(AgentError::FirewallError(format!(
                "firewalld reload failed: {}",
                stderr
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl FirewallSync for FirewallManager {
    async fn open(&self, port: u16, protocol: Protocol, label: &str) -> AgentResult<()> {
        let rule = format!("{}/{}", port, protocol);
        match Self::detect_firewall().await {
            FirewallType::Ufw => {
                let output = Self::run("ufw", &["allow", &rule, "comment", label]).await?;
                if !output.status.success() {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    return Err(AgentError::FirewallError(format!("UFW failed: {}", stderr)));
                }
            }
            FirewallType::Firewalld => {
                let add = format!("--add-port={}", rule);
                let output = Self::run("firewall-cmd", &["--permanent", &add]).await?;
                if !output.status.success() {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    return Err(AgentError::FirewallError(format!(
                        "firewalld failed: {}",
                        stderr
                    )));
                }
                Self::reload_firewalld().await?;
            }
            FirewallType::Iptables => {
                let port = port.to_string();
                let output = Self::run(
                    "iptables",
                    &["-I", "INPUT", "-p", protocol.as_str(), "--dport", &port, "-j", "ACCEPT"],
                )
                .await?;
                if !output.status.success() {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    warn!("iptables INPUT rule may already exist: {}", stderr);
                }
            }
            FirewallType::None => {
                warn!("No firewall detected, skipping rule for {}", rule);
                return Ok(());
            }
        }

        info!("✓ Firewall allows {} ({})", rule, label);
        Ok(())
    }

    async fn close(&self, port: u16, protocol: Protocol) -> AgentResult<()> {
        let rule = format!("{}/{}", port, protocol);
        match Self::detect_firewall().await {
            FirewallType::Ufw => {
                let output = Self::run("ufw", &["delete", "allow", &rule]).await?;
                if !output.status.success() {
                    warn!("Failed to remove UFW rule for {} (may not exist)", rule);
                }
            }
            FirewallType::Firewalld => {
                let remove = format!("--remove-port={}", rule);
                let output = Self::run("firewall-cmd", &["--permanent", &remove]).await?;
                if !output.status.success() {
                    warn!("Failed to remove firewalld rule for {} (may not exist)", rule);
                }
                Self::reload_firewalld().await?;
            }
            FirewallType::Iptables => {
                let port = port.to_string();
                let output = Self::run(
                    "iptables",
                    &["-D", "INPUT", "-p", protocol.as_str(), "--dport", &port, "-j", "ACCEPT"],
                )
                .await?;
                if !output.status.success() {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    warn!("iptables INPUT rule removal failed: {}", stderr);
                }
            }
            FirewallType::None => {}
        }

        info!("Removed firewall rule for {}", rule);
        Ok(())
    }
}
