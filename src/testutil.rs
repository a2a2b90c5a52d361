//! Shared test doubles: a scripted command executor, an in-memory
//! filesystem, a fake `ip` link table and a recording repository.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::cancel::JobContext;
use crate::entities::{InterfaceStatus, NetworkInterface};
use crate::errors::{AgentError, Result};
use crate::exec::CommandExecutor;
use crate::fsys::FileSystem;
use crate::osdetect::{OsDetector, OsFamily};
use crate::repository::Repository;

type ExecHandler = dyn Fn(&str, &[&str]) -> Result<Vec<u8>> + Send + Sync;

/// CommandExecutor driven by a closure, recording every call.
pub struct MockExecutor {
    handler: Box<ExecHandler>,
    calls: Mutex<Vec<Vec<String>>>,
}

impl MockExecutor {
    pub fn with_handler<F>(handler: F) -> Self
    where
        F: Fn(&str, &[&str]) -> Result<Vec<u8>> + Send + Sync + 'static,
    {
        Self {
            handler: Box::new(handler),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }
}

impl CommandExecutor for MockExecutor {
    fn execute_with_timeout(
        &self,
        ctx: &JobContext,
        _timeout: Duration,
        command: &str,
        args: &[&str],
    ) -> Result<Vec<u8>> {
        ctx.check()?;
        let mut call = vec![command.to_string()];
        call.extend(args.iter().map(|a| a.to_string()));
        self.calls.lock().unwrap().push(call);
        (self.handler)(command, args)
    }
}

/// In-memory FileSystem keeping (content, mode) per path.
pub struct MemFs {
    files: Mutex<HashMap<PathBuf, (Vec<u8>, u32)>>,
}

impl MemFs {
    pub fn new() -> Self {
        Self {
            files: Mutex::new(HashMap::new()),
        }
    }

    pub fn add_file(&self, path: &str, data: &[u8]) {
        self.files
            .lock()
            .unwrap()
            .insert(PathBuf::from(path), (data.to_vec(), 0o644));
    }

    pub fn remove_path(&self, path: &str) {
        self.files.lock().unwrap().remove(Path::new(path));
    }

    pub fn mode(&self, path: &Path) -> Option<u32> {
        self.files.lock().unwrap().get(path).map(|(_, mode)| *mode)
    }
}

impl FileSystem for MemFs {
    fn read_file(&self, path: &Path) -> Result<Vec<u8>> {
        self.files
            .lock()
            .unwrap()
            .get(path)
            .map(|(data, _)| data.clone())
            .ok_or_else(|| AgentError::not_found(format!("unable to read {}", path.display())))
    }

    fn write_file(&self, path: &Path, data: &[u8], mode: u32) -> Result<()> {
        self.files
            .lock()
            .unwrap()
            .insert(path.to_path_buf(), (data.to_vec(), mode));
        Ok(())
    }

    fn exists(&self, path: &Path) -> bool {
        self.files.lock().unwrap().contains_key(path)
    }

    fn mkdir_all(&self, _path: &Path, _mode: u32) -> Result<()> {
        Ok(())
    }

    fn remove(&self, path: &Path) -> Result<()> {
        self.files
            .lock()
            .unwrap()
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| AgentError::not_found(format!("unable to remove {}", path.display())))
    }

    fn list_files(&self, dir: &Path) -> Result<Vec<String>> {
        let mut names: Vec<String> = self
            .files
            .lock()
            .unwrap()
            .keys()
            .filter(|p| p.parent() == Some(dir))
            .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .collect();
        names.sort();
        Ok(names)
    }
}

#[derive(Debug, Clone)]
pub struct FakeLink {
    pub name: String,
    pub mac: String,
    pub up: bool,
    pub mtu: u32,
    pub altnames: Vec<String>,
    pub addresses: Vec<String>,
}

#[derive(Default)]
struct FakeState {
    links: Vec<FakeLink>,
    calls: Vec<Vec<String>>,
    fail_next_rename: bool,
    addr_replace_failures: u32,
    addr_replace_delay: Duration,
    active_replaces: usize,
    peak_replaces: usize,
    hostname: String,
    sysfs: Option<Arc<MemFs>>,
}

/// Stateful fake of the system link table. Answers the `ip` invocations
/// the agent issues and mutates its links on `ip link set`, so renames
/// and state changes are visible to later queries in the same test.
pub struct FakeLinkSystem {
    state: Arc<Mutex<FakeState>>,
}

impl FakeLinkSystem {
    pub fn new() -> Self {
        let state = FakeState {
            hostname: "node-a".to_string(),
            ..FakeState::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Mirrors link names into /sys/class/net entries of the given fs.
    pub fn attach_sysfs(&self, fs: Arc<MemFs>) {
        let mut state = self.state.lock().unwrap();
        for link in &state.links {
            fs.add_file(&format!("/sys/class/net/{}", link.name), b"");
        }
        state.sysfs = Some(fs);
    }

    pub fn add_link(&self, name: &str, mac: &str, up: bool) {
        self.add_link_with_altnames(name, mac, up, &[]);
    }

    pub fn add_link_with_altnames(&self, name: &str, mac: &str, up: bool, altnames: &[&str]) {
        let mut state = self.state.lock().unwrap();
        state.links.push(FakeLink {
            name: name.to_string(),
            mac: mac.to_ascii_lowercase(),
            up,
            mtu: 1500,
            altnames: altnames.iter().map(|a| a.to_string()).collect(),
            addresses: Vec::new(),
        });
        if let Some(fs) = &state.sysfs {
            fs.add_file(&format!("/sys/class/net/{}", name), b"");
        }
    }

    pub fn set_up(&self, name: &str, up: bool) {
        let mut state = self.state.lock().unwrap();
        if let Some(link) = state.links.iter_mut().find(|l| l.name == name) {
            link.up = up;
        }
    }

    pub fn link(&self, name: &str) -> Option<FakeLink> {
        self.state
            .lock()
            .unwrap()
            .links
            .iter()
            .find(|l| l.name == name)
            .cloned()
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }

    pub fn fail_next_rename(&self) {
        self.state.lock().unwrap().fail_next_rename = true;
    }

    /// Makes the next N `ip addr replace` invocations fail.
    pub fn fail_addr_replace(&self, times: u32) {
        self.state.lock().unwrap().addr_replace_failures = times;
    }

    pub fn set_addr_replace_delay(&self, delay: Duration) {
        self.state.lock().unwrap().addr_replace_delay = delay;
    }

    /// Highest number of `ip addr replace` calls in flight at once.
    pub fn peak_replaces(&self) -> usize {
        self.state.lock().unwrap().peak_replaces
    }

    pub fn executor(&self) -> Arc<dyn CommandExecutor> {
        Arc::new(FakeLinkExecutor {
            state: self.state.clone(),
        })
    }
}

struct FakeLinkExecutor {
    state: Arc<Mutex<FakeState>>,
}

fn link_header(index: usize, link: &FakeLink) -> String {
    let flags = if link.up {
        "<BROADCAST,MULTICAST,UP,LOWER_UP>"
    } else {
        "<BROADCAST,MULTICAST>"
    };
    let state = if link.up { "UP" } else { "DOWN" };
    format!(
        "{}: {}: {} mtu {} qdisc fq_codel state {} mode DEFAULT group default qlen 1000",
        index + 2,
        link.name,
        flags,
        link.mtu,
        state
    )
}

fn link_detail(index: usize, link: &FakeLink) -> String {
    let mut out = format!(
        "{}\n    link/ether {} brd ff:ff:ff:ff:ff:ff\n",
        link_header(index, link),
        link.mac
    );
    for alt in &link.altnames {
        out.push_str(&format!("    altname {}\n", alt));
    }
    out
}

impl CommandExecutor for FakeLinkExecutor {
    fn execute_with_timeout(
        &self,
        ctx: &JobContext,
        _timeout: Duration,
        command: &str,
        args: &[&str],
    ) -> Result<Vec<u8>> {
        ctx.check()?;
        let mut state = self.state.lock().unwrap();
        let mut call = vec![command.to_string()];
        call.extend(args.iter().map(|a| a.to_string()));
        state.calls.push(call);

        match command {
            "hostname" => return Ok(format!("{}\n", state.hostname).into_bytes()),
            "sysctl" => return Ok(Vec::new()),
            "ip" => {}
            _ => return Ok(Vec::new()),
        }

        // ip -o link show
        if args == ["-o", "link", "show"] {
            let mut out = String::new();
            for (i, link) in state.links.iter().enumerate() {
                out.push_str(&format!(
                    "{} \\    link/ether {} brd ff:ff:ff:ff:ff:ff\n",
                    link_header(i, link),
                    link.mac
                ));
            }
            return Ok(out.into_bytes());
        }

        // ip link show <name> / ip addr show <name>
        if args.len() == 3 && (args[0] == "link" || args[0] == "addr") && args[1] == "show" {
            let name = args[2];
            return match state.links.iter().position(|l| l.name == name) {
                Some(i) => Ok(link_detail(i, &state.links[i]).into_bytes()),
                None => Err(AgentError::system(format!(
                    "Device \"{}\" does not exist.",
                    name
                ))),
            };
        }

        // ip link set ...
        if args.first() == Some(&"link") && args.get(1) == Some(&"set") {
            let rest: Vec<&str> = if args.get(2) == Some(&"dev") {
                args[3..].to_vec()
            } else {
                args[2..].to_vec()
            };
            // rename: <old> name <new>
            if rest.len() == 3 && rest[1] == "name" {
                if state.fail_next_rename {
                    state.fail_next_rename = false;
                    return Err(AgentError::system("RTNETLINK answers: Device or resource busy"));
                }
                let (old, new) = (rest[0].to_string(), rest[2].to_string());
                let sysfs = state.sysfs.clone();
                match state.links.iter_mut().find(|l| l.name == old) {
                    Some(link) => {
                        link.name = new.clone();
                        if let Some(fs) = sysfs {
                            fs.remove_path(&format!("/sys/class/net/{}", old));
                            fs.add_file(&format!("/sys/class/net/{}", new), b"");
                        }
                        return Ok(Vec::new());
                    }
                    None => {
                        return Err(AgentError::system(format!(
                            "Device \"{}\" does not exist.",
                            old
                        )))
                    }
                }
            }
            if rest.len() == 2 && (rest[1] == "up" || rest[1] == "down") {
                let up = rest[1] == "up";
                let name = rest[0];
                match state.links.iter_mut().find(|l| l.name == name) {
                    Some(link) => {
                        link.up = up;
                        return Ok(Vec::new());
                    }
                    None => {
                        return Err(AgentError::system(format!(
                            "Device \"{}\" does not exist.",
                            name
                        )))
                    }
                }
            }
            if rest.len() == 3 && rest[1] == "mtu" {
                let name = rest[0];
                let mtu: u32 = rest[2].parse().unwrap_or(0);
                match state.links.iter_mut().find(|l| l.name == name) {
                    Some(link) => {
                        link.mtu = mtu;
                        return Ok(Vec::new());
                    }
                    None => {
                        return Err(AgentError::system(format!(
                            "Device \"{}\" does not exist.",
                            name
                        )))
                    }
                }
            }
            return Ok(Vec::new());
        }

        // ip addr replace <addr> dev <name> [noprefixroute]
        if args.first() == Some(&"addr") && args.get(1) == Some(&"replace") {
            if state.addr_replace_failures > 0 {
                state.addr_replace_failures -= 1;
                return Err(AgentError::system("RTNETLINK answers: Invalid argument"));
            }
            let delay = state.addr_replace_delay;
            state.active_replaces += 1;
            state.peak_replaces = state.peak_replaces.max(state.active_replaces);
            let address = args.get(2).map(|a| a.to_string());
            let name = args.get(4).map(|n| n.to_string());
            drop(state);
            if !delay.is_zero() {
                std::thread::sleep(delay);
            }
            let mut state = self.state.lock().unwrap();
            state.active_replaces -= 1;
            if let (Some(address), Some(name)) = (address, name) {
                if let Some(link) = state.links.iter_mut().find(|l| l.name == name) {
                    link.addresses = vec![address];
                }
            }
            return Ok(Vec::new());
        }

        // rule and route operations succeed silently.
        Ok(Vec::new())
    }
}

/// Repository with a fixed interface list, recording status updates.
pub struct RecordingRepository {
    interfaces: Mutex<Vec<NetworkInterface>>,
    list_error: Mutex<Option<AgentError>>,
    pub status_updates: Mutex<Vec<(u32, InterfaceStatus)>>,
}

impl RecordingRepository {
    pub fn new(interfaces: Vec<NetworkInterface>) -> Self {
        Self {
            interfaces: Mutex::new(interfaces),
            list_error: Mutex::new(None),
            status_updates: Mutex::new(Vec::new()),
        }
    }

    pub fn fail_next_list(&self, error: AgentError) {
        *self.list_error.lock().unwrap() = Some(error);
    }

    pub fn updates(&self) -> Vec<(u32, InterfaceStatus)> {
        self.status_updates.lock().unwrap().clone()
    }
}

impl Repository for RecordingRepository {
    fn node_interfaces(&self, _ctx: &JobContext, _node_name: &str) -> Result<Vec<NetworkInterface>> {
        if let Some(err) = self.list_error.lock().unwrap().take() {
            return Err(err);
        }
        Ok(self.interfaces.lock().unwrap().clone())
    }

    fn update_interface_status(
        &self,
        _ctx: &JobContext,
        interface_id: u32,
        status: InterfaceStatus,
    ) -> Result<()> {
        self.status_updates.lock().unwrap().push((interface_id, status));
        Ok(())
    }
}

pub struct FixedDetector(pub OsFamily);

impl OsDetector for FixedDetector {
    fn detect(&self) -> Result<OsFamily> {
        Ok(self.0)
    }
}

/// Interface on node-a with a /24 derived from the address.
pub fn test_iface(id: u32, mac: &str, ip: &str) -> NetworkInterface {
    let parsed: Ipv4Addr = ip.parse().expect("test ip");
    let octets = parsed.octets();
    let cidr = format!("{}.{}.{}.0/24", octets[0], octets[1], octets[2]);
    NetworkInterface::new(id, mac, "node-a", ip, &cidr, 1500).expect("test interface")
}
