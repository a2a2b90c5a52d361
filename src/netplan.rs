use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::info;
use serde::Serialize;

use crate::adapter::{interface_index, AdapterOptions, LinkConfigurator, NetworkAdapter};
use crate::cancel::JobContext;
use crate::entities::{InterfaceName, NetworkInterface};
use crate::errors::{AgentError, Result};
use crate::exec::CommandExecutor;
use crate::fsys::FileSystem;
use crate::routing::RoutingCoordinator;

pub const NETPLAN_CONFIG_DIR: &str = "/etc/netplan";

/// Ubuntu and Debian flavored adapter. Runtime changes go through `ip`,
/// persistence is a Netplan YAML written for the next boot. The file is
/// write-only, no `netplan apply` is triggered.
pub struct NetplanAdapter {
    fs: Arc<dyn FileSystem>,
    link: LinkConfigurator,
    config_dir: PathBuf,
}

#[derive(Serialize)]
struct NetplanDoc {
    network: NetplanNetwork,
}

#[derive(Serialize)]
struct NetplanNetwork {
    version: u32,
    ethernets: std::collections::BTreeMap<String, NetplanEthernet>,
}

#[derive(Serialize)]
struct NetplanEthernet {
    #[serde(rename = "match")]
    match_block: NetplanMatch,
    #[serde(rename = "set-name")]
    set_name: String,
    dhcp4: bool,
    addresses: Vec<String>,
    mtu: u32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    routes: Vec<NetplanRoute>,
    #[serde(rename = "routing-policy", skip_serializing_if = "Vec::is_empty")]
    routing_policy: Vec<NetplanRoutingPolicy>,
}

#[derive(Serialize)]
struct NetplanMatch {
    macaddress: String,
}

#[derive(Serialize)]
struct NetplanRoute {
    to: String,
    table: u32,
    metric: u32,
}

#[derive(Serialize)]
struct NetplanRoutingPolicy {
    from: String,
    table: u32,
}

impl NetplanAdapter {
    pub fn new(
        executor: Arc<dyn CommandExecutor>,
        fs: Arc<dyn FileSystem>,
        routing: Arc<RoutingCoordinator>,
        opts: AdapterOptions,
    ) -> Self {
        Self {
            fs,
            link: LinkConfigurator::new(executor, routing, opts),
            config_dir: PathBuf::from(NETPLAN_CONFIG_DIR),
        }
    }

    pub fn with_config_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config_dir = dir.into();
        self
    }

    fn config_path(&self, name: &str) -> PathBuf {
        self.config_dir
            .join(format!("9{}-{}.yaml", interface_index(name), name))
    }

    fn render(&self, iface: &NetworkInterface, name: &str) -> NetplanDoc {
        let opts = self.link.options();
        let prefix = iface.cidr().prefix();
        let address = format!("{}/{}", iface.ip(), prefix);

        let (routes, routing_policy) = if opts.enable_policy_routing {
            let table = opts.routing_table(name);
            (
                vec![NetplanRoute {
                    to: iface.cidr().network_string(),
                    table,
                    metric: opts.route_metric(name),
                }],
                vec![NetplanRoutingPolicy { from: address.clone(), table }],
            )
        } else {
            (Vec::new(), Vec::new())
        };

        let ethernet = NetplanEthernet {
            match_block: NetplanMatch {
                macaddress: iface.mac().as_str().to_string(),
            },
            set_name: name.to_string(),
            dhcp4: false,
            addresses: vec![address],
            mtu: iface.mtu().value(),
            routes,
            routing_policy,
        };

        let mut ethernets = std::collections::BTreeMap::new();
        ethernets.insert(name.to_string(), ethernet);
        NetplanDoc {
            network: NetplanNetwork { version: 2, ethernets },
        }
    }
}

impl NetworkAdapter for NetplanAdapter {
    fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    fn configure(
        &self,
        ctx: &JobContext,
        iface: &NetworkInterface,
        name: &InterfaceName,
    ) -> Result<()> {
        self.link.apply_runtime(ctx, iface, name)?;

        let doc = self.render(iface, name.as_str());
        let data = serde_yaml::to_string(&doc)
            .map_err(|e| AgentError::system("failed to marshal netplan configuration").with_cause(e))?;
        let path = self.config_path(name.as_str());
        self.fs
            .write_file(&path, data.as_bytes(), 0o600)
            .map_err(|e| AgentError::system("failed to save netplan configuration file").with_cause(e))?;
        info!(
            "netplan configuration for {} written to {} (persist-only)",
            name,
            path.display()
        );
        Ok(())
    }

    fn validate(&self, ctx: &JobContext, name: &InterfaceName) -> Result<()> {
        let sys_path = format!("/sys/class/net/{}", name);
        if !self.fs.exists(Path::new(&sys_path)) {
            return Err(AgentError::validation(format!(
                "network interface {} does not exist",
                name
            )));
        }
        if !self.link.is_link_up(ctx, name.as_str())? {
            return Err(AgentError::validation(format!(
                "network interface {} is not UP",
                name
            )));
        }
        let path = self.config_path(name.as_str());
        if !self.fs.exists(&path) {
            return Err(AgentError::validation(format!(
                "netplan file {} does not exist",
                path.display()
            )));
        }
        Ok(())
    }

    fn rollback(&self, ctx: &JobContext, name: &str) -> Result<()> {
        let path = self.config_path(name);
        if self.fs.exists(&path) {
            self.fs.remove(&path).map_err(|e| {
                AgentError::system("failed to remove netplan configuration file").with_cause(e)
            })?;
        }
        self.link.cleanup_routing(ctx, name);
        info!("netplan configuration rollback for {} completed", name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::cancel::CancelToken;
    use crate::testutil::{test_iface, FakeLinkSystem, MemFs};

    fn ctx() -> JobContext {
        JobContext::unbounded(CancelToken::new())
    }

    fn adapter_with(links: &FakeLinkSystem) -> (NetplanAdapter, Arc<MemFs>) {
        let fs = Arc::new(MemFs::new());
        let adapter = NetplanAdapter::new(
            links.executor(),
            fs.clone(),
            Arc::new(RoutingCoordinator::new()),
            AdapterOptions::default(),
        );
        (adapter, fs)
    }

    #[test]
    fn test_configure_writes_expected_yaml() {
        let links = FakeLinkSystem::new();
        links.add_link("eth0", "02:00:00:00:00:01", false);
        let (adapter, fs) = adapter_with(&links);
        let iface = test_iface(1, "02:00:00:00:00:01", "10.0.0.2");
        let name = InterfaceName::new("multinic0").unwrap();

        adapter.configure(&ctx(), &iface, &name).unwrap();

        let written = fs
            .read_file(Path::new("/etc/netplan/90-multinic0.yaml"))
            .unwrap();
        let text = String::from_utf8(written).unwrap();
        assert!(text.contains("set-name: multinic0"), "{}", text);
        assert!(text.contains("02:00:00:00:00:01"), "{}", text);
        assert!(text.contains("10.0.0.2/24"), "{}", text);
        assert!(text.contains("mtu: 1500"), "{}", text);
        assert!(text.contains("dhcp4: false"), "{}", text);
        assert!(text.contains("table: 100"), "{}", text);
        assert_eq!(fs.mode(Path::new("/etc/netplan/90-multinic0.yaml")), Some(0o600));

        // Round-trip through the serde schema used by the drift detector.
        let parsed: serde_yaml::Value = serde_yaml::from_str(&text).unwrap();
        let eth = &parsed["network"]["ethernets"]["multinic0"];
        assert_eq!(eth["addresses"][0].as_str(), Some("10.0.0.2/24"));
        assert_eq!(eth["routes"][0]["to"].as_str(), Some("10.0.0.0/24"));
        assert_eq!(eth["routing-policy"][0]["table"].as_u64(), Some(100));
    }

    #[test]
    fn test_configure_without_policy_routing_omits_routes() {
        let links = FakeLinkSystem::new();
        links.add_link("eth0", "02:00:00:00:00:01", false);
        let fs = Arc::new(MemFs::new());
        let adapter = NetplanAdapter::new(
            links.executor(),
            fs.clone(),
            Arc::new(RoutingCoordinator::new()),
            AdapterOptions {
                enable_policy_routing: false,
                ..AdapterOptions::default()
            },
        );
        let iface = test_iface(1, "02:00:00:00:00:01", "10.0.0.2");
        adapter
            .configure(&ctx(), &iface, &InterfaceName::new("multinic0").unwrap())
            .unwrap();

        let text = String::from_utf8(
            fs.read_file(Path::new("/etc/netplan/90-multinic0.yaml")).unwrap(),
        )
        .unwrap();
        assert!(!text.contains("routing-policy"), "{}", text);
        assert!(!text.contains("routes:"), "{}", text);

        let flat: Vec<String> = links.calls().iter().map(|c| c.join(" ")).collect();
        assert!(!flat.iter().any(|c| c.starts_with("ip rule add")), "{:?}", flat);
    }

    #[test]
    fn test_validate_checks_link_and_file() {
        let links = FakeLinkSystem::new();
        links.add_link("multinic0", "02:00:00:00:00:01", true);
        let (adapter, fs) = adapter_with(&links);
        let name = InterfaceName::new("multinic0").unwrap();

        // Missing /sys entry.
        let err = adapter.validate(&ctx(), &name).unwrap_err();
        assert_eq!(err.kind(), crate::errors::ErrorKind::Validation);

        fs.add_file("/sys/class/net/multinic0", b"");
        // Missing persistence file.
        let err = adapter.validate(&ctx(), &name).unwrap_err();
        assert_eq!(err.kind(), crate::errors::ErrorKind::Validation);

        fs.add_file("/etc/netplan/90-multinic0.yaml", b"network: {}");
        adapter.validate(&ctx(), &name).unwrap();

        // Link down fails validation.
        links.set_up("multinic0", false);
        assert!(adapter.validate(&ctx(), &name).is_err());
    }

    #[test]
    fn test_rollback_removes_file_and_routing() {
        let links = FakeLinkSystem::new();
        let (adapter, fs) = adapter_with(&links);
        fs.add_file("/etc/netplan/93-multinic3.yaml", b"network: {}");

        adapter.rollback(&ctx(), "multinic3").unwrap();

        assert!(!fs.exists(Path::new("/etc/netplan/93-multinic3.yaml")));
        let flat: Vec<String> = links.calls().iter().map(|c| c.join(" ")).collect();
        assert!(flat.contains(&"ip rule delete table 103".to_string()), "{:?}", flat);
        assert!(flat.contains(&"ip route flush table 103".to_string()), "{:?}", flat);
    }

    #[test]
    fn test_rollback_without_file_is_ok() {
        let links = FakeLinkSystem::new();
        let (adapter, _) = adapter_with(&links);
        adapter.rollback(&ctx(), "multinic0").unwrap();
    }
}
