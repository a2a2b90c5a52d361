use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};

use crate::cancel::JobContext;
use crate::entities::{InterfaceName, NetworkInterface, INTERFACE_PREFIX};
use crate::errors::{AgentError, Result};
use crate::exec::CommandExecutor;
use crate::routing::RoutingCoordinator;

/// Applies runtime changes and writes persistent configuration for one
/// OS family. Implementations share the runtime sequence and differ in
/// how they persist.
pub trait NetworkAdapter: Send + Sync {
    fn config_dir(&self) -> &Path;
    fn configure(&self, ctx: &JobContext, iface: &NetworkInterface, name: &InterfaceName)
        -> Result<()>;
    fn validate(&self, ctx: &JobContext, name: &InterfaceName) -> Result<()>;
    fn rollback(&self, ctx: &JobContext, name: &str) -> Result<()>;
}

/// Tunables for runtime apply and persistence. Defaults keep traffic
/// symmetric when several interfaces share a CIDR.
#[derive(Debug, Clone)]
pub struct AdapterOptions {
    pub enable_policy_routing: bool,
    pub routing_table_base: u32,
    pub route_metric_base: u32,
    pub use_noprefixroute: bool,
    pub set_arp_sysctls: bool,
    pub set_loose_rp_filter: bool,
}

impl Default for AdapterOptions {
    fn default() -> Self {
        Self {
            enable_policy_routing: true,
            routing_table_base: 100,
            route_metric_base: 100,
            use_noprefixroute: true,
            set_arp_sysctls: true,
            set_loose_rp_filter: true,
        }
    }
}

impl AdapterOptions {
    pub fn normalize(mut self) -> Self {
        if self.routing_table_base == 0 {
            self.routing_table_base = 100;
        }
        if self.route_metric_base == 0 {
            self.route_metric_base = 100;
        }
        self
    }

    /// Stable table number for a logical name: base plus slot index.
    pub fn routing_table(&self, name: &str) -> u32 {
        self.routing_table_base + interface_index(name)
    }

    pub fn route_metric(&self, name: &str) -> u32 {
        self.route_metric_base + interface_index(name)
    }
}

/// Slot index of a logical name, "multinic3" gives 3. Unknown names map
/// to slot 0.
pub fn interface_index(name: &str) -> u32 {
    name.strip_prefix(INTERFACE_PREFIX)
        .and_then(|rest| rest.parse().ok())
        .unwrap_or(0)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkState {
    pub name: String,
    pub up: bool,
}

/// Runtime apply steps shared by both adapters: find the link by MAC,
/// rename, MTU, address, link up, policy routing and sysctls, in that
/// order.
pub struct LinkConfigurator {
    executor: Arc<dyn CommandExecutor>,
    routing: Arc<RoutingCoordinator>,
    opts: AdapterOptions,
}

const OP_TIMEOUT: Duration = Duration::from_secs(30);
const QUERY_TIMEOUT: Duration = Duration::from_secs(5);

impl LinkConfigurator {
    pub fn new(
        executor: Arc<dyn CommandExecutor>,
        routing: Arc<RoutingCoordinator>,
        opts: AdapterOptions,
    ) -> Self {
        Self {
            executor,
            routing,
            opts: opts.normalize(),
        }
    }

    pub fn options(&self) -> &AdapterOptions {
        &self.opts
    }

    fn exec(&self, ctx: &JobContext, command: &str, args: &[&str]) -> Result<Vec<u8>> {
        self.executor.execute_with_timeout(ctx, OP_TIMEOUT, command, args)
    }

    /// Looks up the link carrying the given MAC together with its UP
    /// state in one `ip -o link show` pass.
    pub fn find_link_by_mac(&self, ctx: &JobContext, mac: &str) -> Result<Option<LinkState>> {
        let output =
            self.executor
                .execute_with_timeout(ctx, QUERY_TIMEOUT, "ip", &["-o", "link", "show"])?;
        let text = String::from_utf8_lossy(&output);
        let mac_lower = mac.trim().to_ascii_lowercase();
        for line in text.lines() {
            if !line.to_ascii_lowercase().contains(&mac_lower) {
                continue;
            }
            let mut parts = line.splitn(3, ':');
            let _index = parts.next();
            let Some(name) = parts.next() else { continue };
            let name = name.trim().split('@').next().unwrap_or("").to_string();
            if name.is_empty() {
                continue;
            }
            let up = line.contains("state UP") || (line.contains(",UP,") && line.contains("LOWER_UP"));
            return Ok(Some(LinkState { name, up }));
        }
        Ok(None)
    }

    /// Runtime steps 1 through 7 of an apply. Returns the error of the
    /// first failing mandatory step.
    pub fn apply_runtime(
        &self,
        ctx: &JobContext,
        iface: &NetworkInterface,
        target: &InterfaceName,
    ) -> Result<()> {
        let target_name = target.as_str();
        let link = self
            .find_link_by_mac(ctx, iface.mac().as_str())?
            .ok_or_else(|| {
                AgentError::network(format!(
                    "no link found for MAC {} on this system",
                    iface.mac()
                ))
            })?;

        if link.name != target_name {
            self.rename_link(ctx, &link, target_name)?;
        }

        let mtu = iface.mtu().value();
        if mtu > 0 {
            let mtu_str = mtu.to_string();
            self.exec(ctx, "ip", &["link", "set", target_name, "mtu", &mtu_str])
                .map_err(|e| AgentError::network("failed to set MTU").with_cause(e))?;
        }

        let address = format!("{}/{}", iface.ip(), iface.cidr().prefix());
        let mut args = vec!["addr", "replace", address.as_str(), "dev", target_name];
        if self.opts.use_noprefixroute {
            args.push("noprefixroute");
        }
        self.exec(ctx, "ip", &args)
            .map_err(|e| AgentError::network("failed to set IPv4 address").with_cause(e))?;

        self.exec(ctx, "ip", &["link", "set", target_name, "up"])
            .map_err(|e| AgentError::network("failed to set link up").with_cause(e))?;

        if self.opts.enable_policy_routing {
            self.apply_policy_routing(ctx, iface, target_name)?;
        }
        self.apply_sysctls(ctx, target_name);
        Ok(())
    }

    // Renaming a live link fails on most kernels, so try in place first
    // and only bounce the link when the kernel refuses.
    fn rename_link(&self, ctx: &JobContext, link: &LinkState, target: &str) -> Result<()> {
        if self
            .exec(ctx, "ip", &["link", "set", &link.name, "name", target])
            .is_ok()
        {
            info!("renamed link {} to {}", link.name, target);
            return Ok(());
        }
        debug!("rename of {} without down failed, retrying with down", link.name);
        let _ = self.exec(ctx, "ip", &["link", "set", &link.name, "down"]);
        self.exec(ctx, "ip", &["link", "set", &link.name, "name", target])
            .map_err(|e| {
                AgentError::network(format!("failed to rename {} to {}", link.name, target))
                    .with_cause(e)
            })?;
        if link.up {
            let _ = self.exec(ctx, "ip", &["link", "set", target, "up"]);
        }
        info!("renamed link {} to {} (with down)", link.name, target);
        Ok(())
    }

    /// Installs the per-interface rule and table route under the global
    /// routing lock. Delete-then-add because `ip rule replace` is not
    /// available everywhere.
    fn apply_policy_routing(
        &self,
        ctx: &JobContext,
        iface: &NetworkInterface,
        target: &str,
    ) -> Result<()> {
        let table = self.opts.routing_table(target).to_string();
        let metric = self.opts.route_metric(target).to_string();
        let from = format!("{}/32", iface.ip());
        let src = iface.ip().to_string();
        let cidr = iface.cidr().network_string();

        self.routing.with_lock(target, || {
            if self.opts.use_noprefixroute {
                // The connected route may not exist, that is fine.
                if let Err(e) = self.exec(ctx, "ip", &["route", "del", &cidr, "dev", target]) {
                    debug!("ignored: failed to delete main-table route for {}: {}", target, e);
                }
            }

            let _ = self.exec(ctx, "ip", &["rule", "del", "from", &from, "table", &table]);
            if let Err(e) = self.exec(ctx, "ip", &["rule", "add", "from", &from, "table", &table]) {
                if !e.reason().contains("File exists") {
                    return Err(AgentError::network("failed to install policy rule").with_cause(e));
                }
            }

            self.exec(
                ctx,
                "ip",
                &[
                    "route", "replace", &cidr, "dev", target, "table", &table, "metric", &metric,
                    "src", &src,
                ],
            )
            .map_err(|e| AgentError::network("failed to install policy route").with_cause(e))?;
            Ok(())
        })
    }

    fn apply_sysctls(&self, ctx: &JobContext, target: &str) {
        if self.opts.set_loose_rp_filter {
            self.set_sysctl(ctx, &format!("net.ipv4.conf.{}.rp_filter", target), "2");
        }
        if self.opts.set_arp_sysctls {
            self.set_sysctl(ctx, &format!("net.ipv4.conf.{}.arp_ignore", target), "1");
            self.set_sysctl(ctx, &format!("net.ipv4.conf.{}.arp_announce", target), "2");
        }
    }

    fn set_sysctl(&self, ctx: &JobContext, key: &str, value: &str) {
        let assignment = format!("{}={}", key, value);
        if let Err(e) = self.exec(ctx, "sysctl", &["-w", &assignment]) {
            debug!("failed to set sysctl {} (ignored): {}", key, e);
        }
    }

    /// True iff the link reports as operationally up.
    pub fn is_link_up(&self, ctx: &JobContext, name: &str) -> Result<bool> {
        let output = self
            .executor
            .execute_with_timeout(ctx, Duration::from_secs(10), "ip", &["link", "show", name])?;
        let text = String::from_utf8_lossy(&output);
        Ok(text.contains("state UP") || (text.contains(",UP,") && text.contains("LOWER_UP")))
    }

    /// Tears down the per-interface rule and table. Best effort, errors
    /// are logged only.
    pub fn cleanup_routing(&self, ctx: &JobContext, name: &str) {
        if !self.opts.enable_policy_routing {
            return;
        }
        let table = self.opts.routing_table(name).to_string();
        let _ = self.routing.with_lock(name, || {
            if let Err(e) = self.exec(ctx, "ip", &["rule", "delete", "table", &table]) {
                debug!("failed to delete policy rule for table {} (ignored): {}", table, e);
            }
            if let Err(e) = self.exec(ctx, "ip", &["route", "flush", "table", &table]) {
                debug!("failed to flush policy routes for table {} (ignored): {}", table, e);
            }
            Ok(())
        });
        debug!("routing state for {} cleared (table {})", name, table);
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::cancel::{CancelToken, JobContext};
    use crate::testutil::{test_iface, FakeLinkSystem};

    fn ctx() -> JobContext {
        JobContext::unbounded(CancelToken::new())
    }

    #[test]
    fn test_interface_index() {
        struct Case<'a> {
            name: &'a str,
            index: u32,
        }
        let cases = [
            Case { name: "multinic0", index: 0 },
            Case { name: "multinic7", index: 7 },
            Case { name: "eth0", index: 0 },
            Case { name: "multinic", index: 0 },
        ];
        for case in cases {
            assert_eq!(interface_index(case.name), case.index, "{}", case.name);
        }
    }

    #[test]
    fn test_options_table_and_metric() {
        let opts = AdapterOptions::default().normalize();
        assert_eq!(opts.routing_table("multinic0"), 100);
        assert_eq!(opts.routing_table("multinic4"), 104);
        assert_eq!(opts.route_metric("multinic9"), 109);

        let zeroed = AdapterOptions {
            routing_table_base: 0,
            route_metric_base: 0,
            ..AdapterOptions::default()
        }
        .normalize();
        assert_eq!(zeroed.routing_table("multinic1"), 101);
    }

    #[test]
    fn test_apply_runtime_order() {
        let links = FakeLinkSystem::new();
        links.add_link("eth0", "02:00:00:00:00:01", false);
        let configurator = LinkConfigurator::new(
            links.executor(),
            Arc::new(RoutingCoordinator::new()),
            AdapterOptions::default(),
        );
        let iface = test_iface(1, "02:00:00:00:00:01", "10.0.0.2");
        let name = InterfaceName::new("multinic0").unwrap();

        configurator.apply_runtime(&ctx(), &iface, &name).unwrap();

        let calls = links.calls();
        let rename = calls
            .iter()
            .position(|c| c.join(" ") == "ip link set eth0 name multinic0")
            .expect("rename issued");
        let mtu = calls
            .iter()
            .position(|c| c.join(" ") == "ip link set multinic0 mtu 1500")
            .expect("mtu issued");
        let addr = calls
            .iter()
            .position(|c| c.join(" ").starts_with("ip addr replace 10.0.0.2/24 dev multinic0"))
            .expect("addr issued");
        let up = calls
            .iter()
            .position(|c| c.join(" ") == "ip link set multinic0 up")
            .expect("up issued");
        let route = calls
            .iter()
            .position(|c| c.join(" ").starts_with("ip route replace 10.0.0.0/24 dev multinic0 table 100"))
            .expect("policy route issued");
        assert!(rename < mtu && mtu < addr && addr < up && up < route);

        // The fake link table now carries the renamed, addressed, up link.
        let link = links.link("multinic0").unwrap();
        assert!(link.up);
        assert_eq!(link.mtu, 1500);
        assert_eq!(link.addresses, vec!["10.0.0.2/24".to_string()]);
    }

    #[test]
    fn test_apply_runtime_missing_mac_is_network_error() {
        let links = FakeLinkSystem::new();
        let configurator = LinkConfigurator::new(
            links.executor(),
            Arc::new(RoutingCoordinator::new()),
            AdapterOptions::default(),
        );
        let iface = test_iface(1, "02:00:00:00:00:01", "10.0.0.2");
        let name = InterfaceName::new("multinic0").unwrap();
        let err = configurator.apply_runtime(&ctx(), &iface, &name).unwrap_err();
        assert_eq!(err.kind(), crate::errors::ErrorKind::Network);
    }

    #[test]
    fn test_rename_falls_back_to_down() {
        let links = FakeLinkSystem::new();
        links.add_link("eth0", "02:00:00:00:00:01", true);
        links.fail_next_rename();
        let configurator = LinkConfigurator::new(
            links.executor(),
            Arc::new(RoutingCoordinator::new()),
            AdapterOptions::default(),
        );
        let iface = test_iface(1, "02:00:00:00:00:01", "10.0.0.2");
        let name = InterfaceName::new("multinic0").unwrap();

        configurator.apply_runtime(&ctx(), &iface, &name).unwrap();

        let flat: Vec<String> = links.calls().iter().map(|c| c.join(" ")).collect();
        assert!(flat.contains(&"ip link set eth0 down".to_string()), "{:?}", flat);
        assert!(links.link("multinic0").unwrap().up);
    }

    #[test]
    fn test_find_link_by_mac_reports_state() {
        let links = FakeLinkSystem::new();
        links.add_link("eth0", "02:00:00:00:00:01", true);
        links.add_link("eth1", "02:00:00:00:00:02", false);
        let configurator = LinkConfigurator::new(
            links.executor(),
            Arc::new(RoutingCoordinator::new()),
            AdapterOptions::default(),
        );

        let up = configurator
            .find_link_by_mac(&ctx(), "02:00:00:00:00:01")
            .unwrap()
            .unwrap();
        assert_eq!(up, LinkState { name: "eth0".to_string(), up: true });

        let down = configurator
            .find_link_by_mac(&ctx(), "02:00:00:00:00:02")
            .unwrap()
            .unwrap();
        assert_eq!(down, LinkState { name: "eth1".to_string(), up: false });

        assert!(configurator
            .find_link_by_mac(&ctx(), "02:00:00:00:00:99")
            .unwrap()
            .is_none());
    }
}
