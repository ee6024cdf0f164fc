//! Host networking primitives.

use async_trait::async_trait;
use tokio::process::Command;
use vmorch_shared::errors::{VmorchError, VmorchResult};

use super::pool::TapAddress;

/// Tap device and firewall operations on the host.
///
/// Every method acts on one named device. Implementations do not track
/// ownership; the coordinator decides what may be created or removed.
#[async_trait]
pub trait HostNetwork: Send + Sync {
    async fn create_tap(&self, dev: &str) -> VmorchResult<()>;

    async fn assign_address(&self, dev: &str, address: &TapAddress) -> VmorchResult<()>;

    async fn set_link_up(&self, dev: &str) -> VmorchResult<()>;

    /// Install forwarding and masquerade rules for traffic from `dev`.
    async fn install_nat(&self, dev: &str, egress: &str) -> VmorchResult<()>;

    /// Remove the rules added by `install_nat`.
    async fn remove_nat(&self, dev: &str, egress: &str) -> VmorchResult<()>;

    async fn destroy_tap(&self, dev: &str) -> VmorchResult<()>;
}

/// Uses the `ip` and `iptables` tools.
#[derive(Debug, Clone)]
pub struct IpCommandHost {
    ip: String,
    iptables: String,
}

impl Default for IpCommandHost {
    fn default() -> Self {
        Self {
            ip: "ip".into(),
            iptables: "iptables".into(),
        }
    }
}

impl IpCommandHost {
    pub fn new(ip: impl Into<String>, iptables: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            iptables: iptables.into(),
        }
    }

    async fn run(&self, program: &str, args: &[&str]) -> VmorchResult<()> {
        tracing::trace!(program, ?args, "Running host network command");

        let output = Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|e| VmorchError::NetworkResource(format!("{}: {}", program, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(VmorchError::NetworkResource(format!(
                "{} {} failed ({}): {}",
                program,
                args.join(" "),
                output.status,
                stderr.trim()
            )));
        }
        Ok(())
    }

    async fn iptables(&self, args: &[&str]) -> VmorchResult<()> {
        self.run(&self.iptables, args).await
    }
}

/// Rule bodies installed for one device, in install order.
fn nat_rules<'a>(dev: &'a str, egress: &'a str) -> [Vec<&'a str>; 3] {
    [
        vec!["-t", "nat", "POSTROUTING", "-o", egress, "-j", "MASQUERADE"],
        vec![
            "-t", "filter", "FORWARD", "-m", "conntrack", "--ctstate", "RELATED,ESTABLISHED", "-j",
            "ACCEPT",
        ],
        vec!["-t", "filter", "FORWARD", "-i", dev, "-o", egress, "-j", "ACCEPT"],
    ]
}

/// `-t <table> <chain> rest...` becomes `-t <table> <op> <chain> rest...`.
fn with_op<'a>(rule: &[&'a str], op: &'a str) -> Vec<&'a str> {
    let mut args = Vec::with_capacity(rule.len() + 1);
    args.extend_from_slice(&rule[..2]);
    args.push(op);
    args.extend_from_slice(&rule[2..]);
    args
}

#[async_trait]
impl HostNetwork for IpCommandHost {
    async fn create_tap(&self, dev: &str) -> VmorchResult<()> {
        self.run(&self.ip, &["tuntap", "add", dev, "mode", "tap"]).await
    }

    async fn assign_address(&self, dev: &str, address: &TapAddress) -> VmorchResult<()> {
        let cidr = address.host_cidr();
        self.run(&self.ip, &["addr", "add", cidr.as_str(), "dev", dev]).await
    }

    async fn set_link_up(&self, dev: &str) -> VmorchResult<()> {
        self.run(&self.ip, &["link", "set", dev, "up"]).await
    }

    async fn install_nat(&self, dev: &str, egress: &str) -> VmorchResult<()> {
        if let Err(e) = tokio::fs::write("/proc/sys/net/ipv4/ip_forward", b"1").await {
            tracing::warn!(error = %e, "Failed to enable IPv4 forwarding");
        }

        let rules = nat_rules(dev, egress);
        for (installed, rule) in rules.iter().enumerate() {
            if let Err(e) = self.iptables(&with_op(rule, "-A")).await {
                for done in rules[..installed].iter().rev() {
                    let _ = self.iptables(&with_op(done, "-D")).await;
                }
                return Err(e);
            }
        }
        Ok(())
    }

    async fn remove_nat(&self, dev: &str, egress: &str) -> VmorchResult<()> {
        let mut first_err = None;
        for rule in nat_rules(dev, egress).iter().rev() {
            if let Err(e) = self.iptables(&with_op(rule, "-D")).await {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    async fn destroy_tap(&self, dev: &str) -> VmorchResult<()> {
        self.run(&self.ip, &["link", "delete", dev]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_operation_placement() {
        let rules = nat_rules("tap0", "eth0");
        assert_eq!(
            with_op(&rules[0], "-A"),
            vec!["-t", "nat", "-A", "POSTROUTING", "-o", "eth0", "-j", "MASQUERADE"]
        );
        assert_eq!(
            with_op(&rules[2], "-D").join(" "),
            "-t filter -D FORWARD -i tap0 -o eth0 -j ACCEPT"
        );
    }

    #[tokio::test]
    async fn test_missing_tool_is_network_error() {
        let host = IpCommandHost::new("/nonexistent/ip", "/nonexistent/iptables");
        let err = host.create_tap("tap0").await.unwrap_err();
        assert!(matches!(err, VmorchError::NetworkResource(_)));
    }

    #[tokio::test]
    async fn test_failing_command_reports_status() {
        let host = IpCommandHost::new("false", "false");
        let err = host.set_link_up("tap0").await.unwrap_err();
        assert!(err.to_string().contains("link set tap0 up"), "{err}");
    }
}
