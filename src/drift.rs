use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, warn};
use serde::Deserialize;

use crate::cancel::JobContext;
use crate::entities::{Cidr, NetworkInterface, INTERFACE_PREFIX};
use crate::errors::Result;
use crate::fsys::FileSystem;
use crate::metrics;
use crate::naming::NamingService;

/// Decides whether a desired interface diverges from its persisted
/// configuration or from live system state and therefore needs re-apply.
pub struct DriftDetector {
    fs: Arc<dyn FileSystem>,
    naming: Arc<NamingService>,
}

#[derive(Debug, Deserialize)]
struct NetplanFile {
    #[serde(default)]
    network: NetplanNetwork,
}

#[derive(Debug, Default, Deserialize)]
struct NetplanNetwork {
    #[serde(default)]
    ethernets: BTreeMap<String, NetplanEthernet>,
}

#[derive(Debug, Default, Deserialize)]
struct NetplanEthernet {
    #[serde(default, rename = "match")]
    match_block: NetplanMatch,
    #[serde(default)]
    addresses: Vec<String>,
    #[serde(default)]
    mtu: u32,
}

#[derive(Debug, Default, Deserialize)]
struct NetplanMatch {
    #[serde(default)]
    macaddress: String,
}

#[derive(Debug, Default, PartialEq)]
struct NetplanConfigValues {
    mac_address: String,
    address: Option<Ipv4Addr>,
    cidr: Option<String>,
    mtu: u32,
    has_addresses: bool,
}

#[derive(Debug, Default, PartialEq)]
struct IfcfgConfigValues {
    mac_address: String,
    ip_address: Option<Ipv4Addr>,
    prefix: Option<String>,
    mtu: u32,
}

impl DriftDetector {
    pub fn new(fs: Arc<dyn FileSystem>, naming: Arc<NamingService>) -> Self {
        Self { fs, naming }
    }

    /// Locates the Netplan file for a logical name: any yaml in the config
    /// directory whose name contains the logical name.
    pub fn find_netplan_file(&self, config_dir: &Path, interface_name: &str) -> Option<PathBuf> {
        let files = match self.fs.list_files(config_dir) {
            Ok(files) => files,
            Err(e) => {
                warn!("unable to scan netplan directory {}: {}", config_dir.display(), e);
                return None;
            }
        };
        files
            .into_iter()
            .find(|f| f.contains(interface_name) && f.ends_with(".yaml"))
            .map(|f| config_dir.join(f))
    }

    pub fn find_ifcfg_file(&self, config_dir: &Path, interface_name: &str) -> Option<PathBuf> {
        let path = config_dir.join(format!("ifcfg-{}", interface_name));
        if self.fs.exists(&path) {
            Some(path)
        } else {
            None
        }
    }

    pub fn find_nmconnection_file(&self, config_dir: &Path, interface_name: &str) -> Option<PathBuf> {
        let files = match self.fs.list_files(config_dir) {
            Ok(files) => files,
            Err(e) => {
                warn!(
                    "unable to scan connection directory {}: {}",
                    config_dir.display(),
                    e
                );
                return None;
            }
        };
        files
            .into_iter()
            .find(|f| f.contains(interface_name) && f.ends_with(".nmconnection"))
            .map(|f| config_dir.join(f))
    }

    /// True when the Netplan file diverges from the desired interface or
    /// the system state makes a re-apply necessary.
    pub fn is_netplan_drift(
        &self,
        ctx: &JobContext,
        iface: &NetworkInterface,
        config_path: &Path,
    ) -> bool {
        if !self.fs.exists(config_path) {
            debug!(
                "configuration file {} not found, treating as drift",
                config_path.display()
            );
            return true;
        }
        let content = match self.fs.read_file(config_path) {
            Ok(content) => content,
            Err(e) => {
                warn!(
                    "unable to read netplan file {}, treating as drift: {}",
                    config_path.display(),
                    e
                );
                return true;
            }
        };
        let values = match parse_netplan(&content) {
            Ok(values) => values,
            Err(e) => {
                warn!(
                    "unable to parse netplan file {}, treating as drift: {}",
                    config_path.display(),
                    e
                );
                return true;
            }
        };

        if !iface.mac().matches(&values.mac_address) {
            warn!(
                "MAC mismatch in {} (file {}, desired {}), treating as drift",
                config_path.display(),
                values.mac_address,
                iface.mac()
            );
            return true;
        }

        if let Some(name) = interface_name_from_path(config_path) {
            if self.system_state_drift(ctx, iface, &name) {
                return true;
            }
        }

        self.netplan_values_drift(iface, &values)
    }

    pub fn is_ifcfg_drift(&self, ctx: &JobContext, iface: &NetworkInterface, config_path: &Path) -> bool {
        let content = match self.fs.read_file(config_path) {
            Ok(content) => content,
            Err(e) => {
                warn!(
                    "unable to read ifcfg file {}, treating as drift: {}",
                    config_path.display(),
                    e
                );
                return true;
            }
        };
        let values = parse_ifcfg(&String::from_utf8_lossy(&content));

        if !iface.mac().matches(&values.mac_address) {
            warn!(
                "MAC mismatch in {} (file {}, desired {}), treating as drift",
                config_path.display(),
                values.mac_address,
                iface.mac()
            );
            return true;
        }

        if let Some(name) = interface_name_from_path(config_path) {
            if self.system_state_drift(ctx, iface, &name) {
                return true;
            }
        }

        self.ifcfg_values_drift(iface, &values)
    }

    /// Drift check against a NetworkManager keyfile, using the same value
    /// comparisons as the ifcfg variant.
    pub fn is_nmconnection_drift(
        &self,
        ctx: &JobContext,
        iface: &NetworkInterface,
        config_path: &Path,
    ) -> bool {
        let content = match self.fs.read_file(config_path) {
            Ok(content) => content,
            Err(e) => {
                warn!(
                    "unable to read keyfile {}, treating as drift: {}",
                    config_path.display(),
                    e
                );
                return true;
            }
        };
        let values = parse_nmconnection(&String::from_utf8_lossy(&content));

        if !iface.mac().matches(&values.mac_address) {
            warn!(
                "MAC mismatch in {} (file {}, desired {}), treating as drift",
                config_path.display(),
                values.mac_address,
                iface.mac()
            );
            return true;
        }

        if let Some(name) = interface_name_from_path(config_path) {
            if self.system_state_drift(ctx, iface, &name) {
                return true;
            }
        }

        self.ifcfg_values_drift(iface, &values)
    }

    fn netplan_values_drift(&self, iface: &NetworkInterface, values: &NetplanConfigValues) -> bool {
        let missing_address = !values.has_addresses;
        let ip_differs = values.address != Some(iface.ip());
        let cidr_differs = values.cidr.as_deref() != Some(iface.cidr().network_string().as_str());
        let mtu_differs = values.mtu != iface.mtu().value();

        let drifted = missing_address || ip_differs || cidr_differs || mtu_differs;
        if drifted {
            debug!(
                "netplan drift for interface {} (mac {}): file {:?}, desired {}/{} mtu {}",
                iface.id(),
                iface.mac(),
                values,
                iface.ip(),
                iface.cidr(),
                iface.mtu().value()
            );
            if missing_address {
                metrics::record_drift("missing_address");
            }
            if ip_differs {
                metrics::record_drift("ip_address");
            }
            if cidr_differs {
                metrics::record_drift("cidr");
            }
            if mtu_differs {
                metrics::record_drift("mtu");
            }
        }
        drifted
    }

    fn ifcfg_values_drift(&self, iface: &NetworkInterface, values: &IfcfgConfigValues) -> bool {
        let desired_prefix = iface.cidr().prefix().to_string();
        let ip_differs = values.ip_address != Some(iface.ip());
        let prefix_differs = match &values.prefix {
            Some(prefix) => *prefix != desired_prefix,
            None => false,
        };
        let mtu_differs = values.mtu != iface.mtu().value();

        let drifted = ip_differs || prefix_differs || mtu_differs;
        if drifted {
            debug!(
                "ifcfg drift for interface {} (mac {}): file {:?}, desired {}/{} mtu {}",
                iface.id(),
                iface.mac(),
                values,
                iface.ip(),
                desired_prefix,
                iface.mtu().value()
            );
            if ip_differs {
                metrics::record_drift("ip_address");
            }
            if prefix_differs {
                metrics::record_drift("cidr");
            }
            if mtu_differs {
                metrics::record_drift("mtu");
            }
        }
        drifted
    }

    // A desired interface whose MAC is gone from the system always needs
    // processing. An UP link is only a drift signal when it does not
    // already carry the target logical name, so an unchanged configured
    // interface short-circuits on the next run.
    fn system_state_drift(
        &self,
        ctx: &JobContext,
        iface: &NetworkInterface,
        target_name: &str,
    ) -> bool {
        let found = match self.naming.find_interface_name_by_mac(ctx, iface.mac().as_str()) {
            Ok(Some(found)) => found,
            Ok(None) => {
                warn!("MAC {} not present on system, treating as drift", iface.mac());
                return true;
            }
            Err(e) => {
                warn!("unable to check system state for {}: {}", iface.mac(), e);
                return true;
            }
        };
        if found == target_name {
            return false;
        }
        match self.naming.is_interface_up(ctx, &found) {
            Ok(true) => {
                warn!(
                    "link {} carrying MAC {} is UP under a foreign name, treating as drift",
                    found,
                    iface.mac()
                );
                true
            }
            Ok(false) => false,
            Err(e) => {
                debug!("unable to check UP state of {}, assuming safe: {}", found, e);
                false
            }
        }
    }
}

fn parse_netplan(content: &[u8]) -> Result<NetplanConfigValues> {
    let parsed: NetplanFile = serde_yaml::from_slice(content)
        .map_err(|e| crate::errors::AgentError::system("invalid netplan YAML").with_cause(e))?;
    let mut values = NetplanConfigValues::default();
    if let Some((_, eth)) = parsed.network.ethernets.into_iter().next() {
        values.mac_address = eth.match_block.macaddress;
        values.mtu = eth.mtu;
        values.has_addresses = !eth.addresses.is_empty();
        if let Some(first) = eth.addresses.first() {
            match Cidr::new(first) {
                Ok(cidr) => {
                    values.address = first
                        .split('/')
                        .next()
                        .and_then(|ip| ip.parse::<Ipv4Addr>().ok());
                    values.cidr = Some(cidr.network_string());
                }
                Err(_) => {
                    values.address = first.parse::<Ipv4Addr>().ok();
                    values.cidr = None;
                }
            }
        }
    }
    Ok(values)
}

fn parse_ifcfg(content: &str) -> IfcfgConfigValues {
    let mut values = IfcfgConfigValues::default();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim().trim_matches(|c| c == '"' || c == '\'');
        match key {
            "HWADDR" => values.mac_address = value.to_ascii_lowercase(),
            "IPADDR" => values.ip_address = value.parse().ok(),
            "PREFIX" => values.prefix = Some(value.to_string()),
            "MTU" => {
                if let Ok(mtu) = value.parse() {
                    values.mtu = mtu;
                }
            }
            _ => {}
        }
    }
    values
}

/// Pulls the values compared for drift out of a NetworkManager keyfile:
/// `mac-address` and `mtu` from [ethernet], `address1` from [ipv4].
fn parse_nmconnection(content: &str) -> IfcfgConfigValues {
    let mut values = IfcfgConfigValues::default();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with('[') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        match key.trim() {
            "mac-address" => values.mac_address = value.trim().to_ascii_lowercase(),
            "address1" => {
                let value = value.trim();
                let (ip, prefix) = match value.split_once('/') {
                    Some((ip, prefix)) => (ip, Some(prefix.to_string())),
                    None => (value, None),
                };
                values.ip_address = ip.parse().ok();
                values.prefix = prefix;
            }
            "mtu" => {
                if let Ok(mtu) = value.trim().parse() {
                    values.mtu = mtu;
                }
            }
            _ => {}
        }
    }
    values
}

/// MAC embedded in a persistence file, used for orphan detection.
pub fn mac_from_persistence_file(fs: &dyn crate::fsys::FileSystem, path: &Path) -> Option<String> {
    let content = fs.read_file(path).ok()?;
    let text = String::from_utf8_lossy(&content);
    let file_name = path.file_name()?.to_string_lossy().into_owned();
    if file_name.ends_with(".yaml") {
        let values = parse_netplan(content.as_slice()).ok()?;
        if values.mac_address.is_empty() {
            return None;
        }
        return Some(values.mac_address.to_ascii_lowercase());
    }
    if file_name.ends_with(".nmconnection") {
        let values = parse_nmconnection(&text);
        if values.mac_address.is_empty() {
            return None;
        }
        return Some(values.mac_address);
    }
    if file_name.starts_with("ifcfg-") {
        let values = parse_ifcfg(&text);
        if values.mac_address.is_empty() {
            return None;
        }
        return Some(values.mac_address);
    }
    None
}

/// Recovers the logical name from a persistence file path, e.g.
/// "90-multinic0.yaml" or "ifcfg-multinic0".
pub fn interface_name_from_path(path: &Path) -> Option<String> {
    let file_name = path.file_name()?.to_string_lossy();
    if let Some(rest) = file_name.strip_prefix("ifcfg-") {
        return Some(rest.to_string());
    }
    let stem = file_name
        .strip_suffix(".yaml")
        .or_else(|| file_name.strip_suffix(".nmconnection"))
        .or_else(|| file_name.strip_suffix(".link"))
        .unwrap_or(&file_name);
    stem.split('-')
        .find(|part| part.starts_with(INTERFACE_PREFIX))
        .map(|part| part.to_string())
}
