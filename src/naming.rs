use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::debug;

use crate::cancel::JobContext;
use crate::entities::{InterfaceName, NetworkInterface, INTERFACE_PREFIX, MAX_INTERFACES};
use crate::errors::{AgentError, Result};
use crate::exec::CommandExecutor;
use crate::fsys::FileSystem;

const SYS_CLASS_NET: &str = "/sys/class/net";

#[derive(Default)]
struct Reservations {
    // mac (lowercase) -> multinicX
    by_mac: HashMap<String, String>,
    names: HashSet<String>,
}

/// Allocates stable logical names from the fixed 10-slot pool, keyed by
/// MAC. Reservations live for the process lifetime; slots already present
/// as system links are adopted instead of reassigned.
pub struct NamingService {
    executor: Arc<dyn CommandExecutor>,
    fs: Arc<dyn FileSystem>,
    state: Mutex<Reservations>,
}

impl NamingService {
    pub fn new(executor: Arc<dyn CommandExecutor>, fs: Arc<dyn FileSystem>) -> Self {
        Self {
            executor,
            fs,
            state: Mutex::new(Reservations::default()),
        }
    }

    /// Reserves a unique multinicX name for every interface in the list.
    /// Existing links whose MAC matches keep their slot; the rest get the
    /// lowest free slot. Idempotent per MAC.
    pub fn reserve_names_for_interfaces(
        &self,
        ctx: &JobContext,
        interfaces: &[NetworkInterface],
    ) -> Result<HashMap<String, InterfaceName>> {
        let mut state = self.state.lock().expect("naming state poisoned");
        let mut result = HashMap::new();

        // Pass 1: adopt live multinicX links whose MAC is in the request.
        for i in 0..MAX_INTERFACES {
            let name = format!("{}{}", INTERFACE_PREFIX, i);
            if !self.link_exists(&name) {
                continue;
            }
            let mac = match self.mac_for_interface(ctx, &name) {
                Ok(Some(mac)) => mac.to_ascii_lowercase(),
                _ => continue,
            };
            for iface in interfaces {
                if iface.mac().matches(&mac) && !state.by_mac.contains_key(&mac) {
                    state.by_mac.insert(mac.clone(), name.clone());
                    state.names.insert(name.clone());
                    result.insert(mac.clone(), InterfaceName::new(&name)?);
                }
            }
        }

        // Pass 2: lowest free slot for the remaining MACs.
        for iface in interfaces {
            let mac = iface.mac().as_str().to_string();
            if let Some(existing) = state.by_mac.get(&mac) {
                result.insert(mac.clone(), InterfaceName::new(existing)?);
                continue;
            }
            let chosen = (0..MAX_INTERFACES)
                .map(|i| format!("{}{}", INTERFACE_PREFIX, i))
                .find(|candidate| !self.name_taken(&state, candidate));
            let chosen = chosen.ok_or_else(|| {
                AgentError::resource(format!(
                    "no interface name available ({}0-{} all in use or reserved)",
                    INTERFACE_PREFIX,
                    MAX_INTERFACES - 1
                ))
            })?;
            state.by_mac.insert(mac.clone(), chosen.clone());
            state.names.insert(chosen.clone());
            result.insert(mac, InterfaceName::new(&chosen)?);
        }

        Ok(result)
    }

    /// Resolves the logical name for a MAC: reservation first, then a live
    /// link carrying the MAC, then the lowest free slot.
    pub fn next_name_for_mac(&self, ctx: &JobContext, mac: &str) -> Result<InterfaceName> {
        let mut state = self.state.lock().expect("naming state poisoned");
        let mac_lower = mac.trim().to_ascii_lowercase();

        if let Some(name) = state.by_mac.get(&mac_lower) {
            return InterfaceName::new(name);
        }

        for i in 0..MAX_INTERFACES {
            let name = format!("{}{}", INTERFACE_PREFIX, i);
            if !self.link_exists(&name) {
                continue;
            }
            if let Ok(Some(existing)) = self.mac_for_interface(ctx, &name) {
                if existing.eq_ignore_ascii_case(&mac_lower) {
                    state.by_mac.insert(mac_lower.clone(), name.clone());
                    state.names.insert(name.clone());
                    return InterfaceName::new(&name);
                }
            }
        }

        let chosen = (0..MAX_INTERFACES)
            .map(|i| format!("{}{}", INTERFACE_PREFIX, i))
            .find(|candidate| !self.name_taken(&state, candidate))
            .ok_or_else(|| {
                AgentError::resource(format!(
                    "no interface name available ({}0-{} all in use or reserved)",
                    INTERFACE_PREFIX,
                    MAX_INTERFACES - 1
                ))
            })?;
        state.by_mac.insert(mac_lower, chosen.clone());
        state.names.insert(chosen.clone());
        InterfaceName::new(&chosen)
    }

    /// Looks up an already reserved name without touching the system.
    pub fn reserved_name(&self, mac: &str) -> Option<String> {
        let state = self.state.lock().expect("naming state poisoned");
        state.by_mac.get(&mac.trim().to_ascii_lowercase()).cloned()
    }

    /// Scans `ip -o link show` for a link carrying the given MAC.
    pub fn find_interface_name_by_mac(&self, ctx: &JobContext, mac: &str) -> Result<Option<String>> {
        let output = self.executor.execute_with_timeout(
            ctx,
            Duration::from_secs(10),
            "ip",
            &["-o", "link", "show"],
        )?;
        let text = String::from_utf8_lossy(&output);
        let mac_lower = mac.trim().to_ascii_lowercase();
        Ok(parse_link_table(&text)
            .into_iter()
            .find(|(_, link_mac)| *link_mac == mac_lower)
            .map(|(name, _)| name))
    }

    /// True iff `ip link show` reports the link as operationally up.
    pub fn is_interface_up(&self, ctx: &JobContext, name: &str) -> Result<bool> {
        let output = self.executor.execute_with_timeout(
            ctx,
            Duration::from_secs(10),
            "ip",
            &["link", "show", name],
        )?;
        Ok(output_reports_up(&String::from_utf8_lossy(&output)))
    }

    /// Reads the MAC of one interface from `ip addr show <name>`.
    pub fn mac_for_interface(&self, ctx: &JobContext, name: &str) -> Result<Option<String>> {
        let output = self.executor.execute_with_timeout(
            ctx,
            Duration::from_secs(10),
            "ip",
            &["addr", "show", name],
        )?;
        Ok(parse_link_ether(&String::from_utf8_lossy(&output)))
    }

    /// Kernel-persistent alternative names of a link, used to give
    /// leftover multinic links their original name back.
    pub fn alt_names(&self, ctx: &JobContext, name: &str) -> Result<Vec<String>> {
        let output = self.executor.execute_with_timeout(
            ctx,
            Duration::from_secs(5),
            "ip",
            &["link", "show", name],
        )?;
        let text = String::from_utf8_lossy(&output);
        let mut alts = Vec::new();
        for line in text.lines() {
            let line = line.trim();
            if let Some(rest) = line.strip_prefix("altname ") {
                if let Some(alt) = rest.split_whitespace().next() {
                    alts.push(alt.to_string());
                }
            }
        }
        Ok(alts)
    }

    pub fn rename_interface(&self, ctx: &JobContext, old: &str, new: &str) -> Result<()> {
        self.executor
            .execute_with_timeout(
                ctx,
                Duration::from_secs(5),
                "ip",
                &["link", "set", "dev", old, "name", new],
            )
            .map_err(|e| {
                AgentError::network(format!("unable to rename {} to {}", old, new)).with_cause(e)
            })?;
        Ok(())
    }

    pub fn interface_exists(&self, name: &str) -> bool {
        self.link_exists(name)
    }

    /// Live multinicX links currently present on the system.
    pub fn current_multinic_interfaces(&self) -> Vec<InterfaceName> {
        (0..MAX_INTERFACES)
            .filter_map(|i| {
                let name = format!("{}{}", INTERFACE_PREFIX, i);
                if self.link_exists(&name) {
                    InterfaceName::new(&name).ok()
                } else {
                    None
                }
            })
            .collect()
    }

    /// Node hostname with any domain suffix stripped at the first dot.
    pub fn hostname(&self, ctx: &JobContext) -> Result<String> {
        let output =
            self.executor
                .execute_with_timeout(ctx, Duration::from_secs(5), "hostname", &[])?;
        let hostname = String::from_utf8_lossy(&output).trim().to_string();
        if hostname.is_empty() {
            return Err(AgentError::system("hostname is empty"));
        }
        Ok(match hostname.split_once('.') {
            Some((short, _)) => short.to_string(),
            None => hostname,
        })
    }

    fn link_exists(&self, name: &str) -> bool {
        self.fs
            .exists(&Path::new(SYS_CLASS_NET).join(name))
    }

    fn name_taken(&self, state: &Reservations, name: &str) -> bool {
        if self.link_exists(name) {
            debug!("name {} taken by a live link", name);
            return true;
        }
        state.names.contains(name)
    }
}

/// Parses `ip -o link show` output into (name, lowercase mac) pairs.
/// Lines look like:
/// `2: ens3: <BROADCAST,...> mtu 1500 ... link/ether fa:16:3e:e8:ae:9d brd ...`
fn parse_link_table(output: &str) -> Vec<(String, String)> {
    let mut links = Vec::new();
    for line in output.lines() {
        let mut parts = line.splitn(3, ':');
        let index = parts.next().map(str::trim);
        let name = parts.next().map(str::trim);
        let rest = parts.next();
        let (Some(index), Some(name), Some(rest)) = (index, name, rest) else {
            continue;
        };
        if index.is_empty() || !index.chars().all(|c| c.is_ascii_digit()) {
            continue;
        }
        let Some(mac) = parse_link_ether(rest) else {
            continue;
        };
        // Names can carry an @if<N> suffix on some link kinds.
        let name = name.split('@').next().unwrap_or(name);
        links.push((name.to_string(), mac));
    }
    links
}

fn parse_link_ether(text: &str) -> Option<String> {
    let pos = text.find("link/ether")?;
    let mac = text[pos..].split_whitespace().nth(1)?;
    if mac.len() == 17 {
        Some(mac.to_ascii_lowercase())
    } else {
        None
    }
}

fn output_reports_up(output: &str) -> bool {
    output.contains("state UP") || (output.contains(",UP,") && output.contains("LOWER_UP"))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::cancel::CancelToken;
    use crate::errors::ErrorKind;
    use crate::testutil::{test_iface, MemFs, MockExecutor};

    fn ctx() -> JobContext {
        JobContext::unbounded(CancelToken::new())
    }

    fn service_with_links(links: Vec<(&str, &str)>) -> NamingService {
        let fs = Arc::new(MemFs::new());
        for (name, _) in &links {
            fs.add_file(&format!("{}/{}", SYS_CLASS_NET, name), b"");
        }
        let links: Vec<(String, String)> = links
            .into_iter()
            .map(|(n, m)| (n.to_string(), m.to_string()))
            .collect();
        let executor = Arc::new(MockExecutor::with_handler(move |cmd, args| {
            if cmd == "ip" && args.first() == Some(&"addr") && args.get(1) == Some(&"show") {
                let wanted = args.get(2).copied().unwrap_or_default();
                for (name, mac) in &links {
                    if name.as_str() == wanted {
                        return Ok(format!(
                            "2: {}: <BROADCAST,MULTICAST> mtu 1500\n    link/ether {} brd ff:ff:ff:ff:ff:ff",
                            name, mac
                        )
                        .into_bytes());
                    }
                }
                return Err(AgentError::system("Device does not exist"));
            }
            if cmd == "ip" && args == ["-o", "link", "show"] {
                let mut out = String::new();
                for (i, (name, mac)) in links.iter().enumerate() {
                    out.push_str(&format!(
                        "{}: {}: <BROADCAST,MULTICAST> mtu 1500 qdisc fq_codel state DOWN mode DEFAULT group default qlen 1000 \\    link/ether {} brd ff:ff:ff:ff:ff:ff\n",
                        i + 2,
                        name,
                        mac
                    ));
                }
                return Ok(out.into_bytes());
            }
            Ok(Vec::new())
        }));
        NamingService::new(executor, fs)
    }

    #[test]
    fn test_parse_link_table() {
        let output = "1: lo: <LOOPBACK,UP,LOWER_UP> mtu 65536 qdisc noqueue state UNKNOWN mode DEFAULT group default qlen 1000\\    link/loopback 00:00:00:00:00:00 brd 00:00:00:00:00:00\n\
2: ens3: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500 qdisc fq_codel state UP mode DEFAULT group default qlen 1000\\    link/ether FA:16:3E:E8:AE:9D brd ff:ff:ff:ff:ff:ff\n\
3: eth1@if4: <BROADCAST> mtu 1500 qdisc noop state DOWN mode DEFAULT group default qlen 1000\\    link/ether 02:00:00:00:00:02 brd ff:ff:ff:ff:ff:ff\n";
        let links = parse_link_table(output);
        assert_eq!(
            links,
            vec![
                ("ens3".to_string(), "fa:16:3e:e8:ae:9d".to_string()),
                ("eth1".to_string(), "02:00:00:00:00:02".to_string()),
            ]
        );
    }

    #[test]
    fn test_output_reports_up() {
        struct Case<'a> {
            output: &'a str,
            up: bool,
        }
        let cases = [
            Case {
                output: "2: eth0: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500 state UP",
                up: true,
            },
            Case {
                output: "2: eth0: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500 state UNKNOWN",
                up: true,
            },
            Case {
                output: "2: eth0: <BROADCAST,MULTICAST> mtu 1500 state DOWN",
                up: false,
            },
            Case {
                output: "2: eth0: <BROADCAST,UP> mtu 1500 state DOWN",
                up: false,
            },
        ];
        for case in cases {
            assert_eq!(output_reports_up(case.output), case.up, "{:?}", case.output);
        }
    }

    #[test]
    fn test_find_interface_name_by_mac() {
        let service = service_with_links(vec![("ens3", "fa:16:3e:e8:ae:9d")]);
        let found = service
            .find_interface_name_by_mac(&ctx(), "FA:16:3E:E8:AE:9D")
            .unwrap();
        assert_eq!(found, Some("ens3".to_string()));

        let missing = service
            .find_interface_name_by_mac(&ctx(), "02:00:00:00:00:99")
            .unwrap();
        assert_eq!(missing, None);
    }

    #[test]
    fn test_reserve_assigns_lowest_free_slots() {
        let service = service_with_links(vec![]);
        let interfaces = vec![
            test_iface(1, "02:00:00:00:00:01", "10.0.0.2"),
            test_iface(2, "02:00:00:00:00:02", "10.0.0.3"),
        ];
        let reserved = service
            .reserve_names_for_interfaces(&ctx(), &interfaces)
            .unwrap();
        assert_eq!(reserved["02:00:00:00:00:01"].as_str(), "multinic0");
        assert_eq!(reserved["02:00:00:00:00:02"].as_str(), "multinic1");
    }

    #[test]
    fn test_reserve_is_idempotent() {
        let service = service_with_links(vec![]);
        let interfaces = vec![
            test_iface(1, "02:00:00:00:00:01", "10.0.0.2"),
            test_iface(2, "02:00:00:00:00:02", "10.0.0.3"),
        ];
        let first = service
            .reserve_names_for_interfaces(&ctx(), &interfaces)
            .unwrap();
        let second = service
            .reserve_names_for_interfaces(&ctx(), &interfaces)
            .unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_reserve_adopts_existing_link() {
        // multinic1 already exists and carries the MAC of interface 1.
        let service = service_with_links(vec![("multinic1", "02:00:00:00:00:01")]);
        let interfaces = vec![
            test_iface(1, "02:00:00:00:00:01", "10.0.0.2"),
            test_iface(2, "02:00:00:00:00:02", "10.0.0.3"),
        ];
        let reserved = service
            .reserve_names_for_interfaces(&ctx(), &interfaces)
            .unwrap();
        assert_eq!(reserved["02:00:00:00:00:01"].as_str(), "multinic1");
        assert_eq!(reserved["02:00:00:00:00:02"].as_str(), "multinic0");
    }

    #[test]
    fn test_reserved_names_are_distinct() {
        let service = service_with_links(vec![]);
        let interfaces: Vec<_> = (0..10)
            .map(|i| {
                test_iface(
                    i + 1,
                    &format!("02:00:00:00:00:{:02x}", i + 1),
                    &format!("10.0.0.{}", i + 2),
                )
            })
            .collect();
        let reserved = service
            .reserve_names_for_interfaces(&ctx(), &interfaces)
            .unwrap();
        let names: HashSet<_> = reserved.values().map(|n| n.as_str().to_string()).collect();
        assert_eq!(names.len(), 10);
        for name in &names {
            assert!(name.starts_with(INTERFACE_PREFIX));
        }
    }

    #[test]
    fn test_pool_exhaustion_is_resource_error() {
        let service = service_with_links(vec![]);
        let interfaces: Vec<_> = (0..11)
            .map(|i| {
                test_iface(
                    i + 1,
                    &format!("02:00:00:00:00:{:02x}", i + 1),
                    &format!("10.0.0.{}", i + 2),
                )
            })
            .collect();
        let err = service
            .reserve_names_for_interfaces(&ctx(), &interfaces)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Resource);
    }

    #[test]
    fn test_next_name_for_mac_reuses_reservation() {
        let service = service_with_links(vec![]);
        let first = service.next_name_for_mac(&ctx(), "02:00:00:00:00:01").unwrap();
        let second = service.next_name_for_mac(&ctx(), "02:00:00:00:00:01").unwrap();
        assert_eq!(first, second);
        assert_eq!(service.reserved_name("02:00:00:00:00:01"), Some(first.as_str().to_string()));
    }

    #[test]
    fn test_next_name_for_mac_adopts_live_slot() {
        let service = service_with_links(vec![("multinic2", "02:00:00:00:00:05")]);
        let name = service.next_name_for_mac(&ctx(), "02:00:00:00:00:05").unwrap();
        assert_eq!(name.as_str(), "multinic2");
    }

    #[test]
    fn test_alt_names_parse() {
        let executor = Arc::new(MockExecutor::with_handler(|_, _| {
            Ok(b"2: multinic0: <BROADCAST> mtu 1500\n    link/ether 02:00:00:00:00:01 brd ff:ff:ff:ff:ff:ff\n    altname enp0s5\n    altname ens5\n"
                .to_vec())
        }));
        let service = NamingService::new(executor, Arc::new(MemFs::new()));
        let alts = service.alt_names(&ctx(), "multinic0").unwrap();
        assert_eq!(alts, vec!["enp0s5".to_string(), "ens5".to_string()]);
    }

    #[test]
    fn test_hostname_strips_domain() {
        let executor = Arc::new(MockExecutor::with_handler(|cmd, _| {
            assert_eq!(cmd, "hostname");
            Ok(b"node-a.cluster.local\n".to_vec())
        }));
        let service = NamingService::new(executor, Arc::new(MemFs::new()));
        assert_eq!(service.hostname(&ctx()).unwrap(), "node-a");
    }
}
