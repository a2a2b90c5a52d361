use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info};

use crate::adapter::{interface_index, AdapterOptions, LinkConfigurator, NetworkAdapter};
use crate::cancel::JobContext;
use crate::entities::{InterfaceName, NetworkInterface};
use crate::errors::{AgentError, Result};
use crate::exec::CommandExecutor;
use crate::fsys::FileSystem;
use crate::routing::RoutingCoordinator;

pub const NETWORK_MANAGER_DIR: &str = "/etc/NetworkManager/system-connections";
pub const SYSTEMD_NETWORK_DIR: &str = "/etc/systemd/network";

/// RHEL-family adapter. Runtime changes go through `ip`; persistence is a
/// systemd .link file for the rename plus a NetworkManager keyfile for
/// addressing. Files are written for the next boot, nothing is reloaded.
pub struct NetworkManagerAdapter {
    fs: Arc<dyn FileSystem>,
    link: LinkConfigurator,
    config_dir: PathBuf,
    link_dir: PathBuf,
}

impl NetworkManagerAdapter {
    pub fn new(
        executor: Arc<dyn CommandExecutor>,
        fs: Arc<dyn FileSystem>,
        routing: Arc<RoutingCoordinator>,
        opts: AdapterOptions,
    ) -> Self {
        Self {
            fs,
            link: LinkConfigurator::new(executor, routing, opts),
            config_dir: PathBuf::from(NETWORK_MANAGER_DIR),
            link_dir: PathBuf::from(SYSTEMD_NETWORK_DIR),
        }
    }

    pub fn with_dirs(mut self, config_dir: impl Into<PathBuf>, link_dir: impl Into<PathBuf>) -> Self {
        self.config_dir = config_dir.into();
        self.link_dir = link_dir.into();
        self
    }

    fn link_path(&self, name: &str) -> PathBuf {
        self.link_dir
            .join(format!("9{}-{}.link", interface_index(name), name))
    }

    fn connection_path(&self, name: &str) -> PathBuf {
        self.config_dir
            .join(format!("9{}-{}.nmconnection", interface_index(name), name))
    }

    fn render_link(&self, iface: &NetworkInterface, name: &str) -> String {
        format!(
            "[Match]\nMACAddress={}\n[Link]\nName={}\n",
            iface.mac(),
            name
        )
    }

    fn render_connection(&self, iface: &NetworkInterface, name: &str) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "[connection]");
        let _ = writeln!(out, "id={}", name);
        let _ = writeln!(out, "type=ethernet");
        let _ = writeln!(out, "interface-name={}", name);
        let _ = writeln!(out, "autoconnect=true");
        let _ = writeln!(out);
        let _ = writeln!(out, "[ethernet]");
        let _ = writeln!(out, "mac-address={}", iface.mac());
        if iface.mtu().value() > 0 {
            let _ = writeln!(out, "mtu={}", iface.mtu().value());
        }
        let _ = writeln!(out);
        let _ = writeln!(out, "[ipv4]");
        let _ = writeln!(out, "method=manual");
        let _ = writeln!(out, "address1={}/{}", iface.ip(), iface.cidr().prefix());
        let _ = writeln!(out, "never-default=true");
        let _ = writeln!(out);
        let _ = writeln!(out, "[ipv6]");
        let _ = writeln!(out, "method=ignore");
        out
    }
}

impl NetworkAdapter for NetworkManagerAdapter {
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

        let link_path = self.link_path(name.as_str());
        self.fs
            .write_file(
                &link_path,
                self.render_link(iface, name.as_str()).as_bytes(),
                0o644,
            )
            .map_err(|e| AgentError::system("failed to write .link file").with_cause(e))?;

        let connection_path = self.connection_path(name.as_str());
        self.fs
            .write_file(
                &connection_path,
                self.render_connection(iface, name.as_str()).as_bytes(),
                0o600,
            )
            .map_err(|e| AgentError::system("failed to write .nmconnection file").with_cause(e))?;

        info!(
            "persist files for {} written: {} and {} (no immediate reload)",
            name,
            link_path.display(),
            connection_path.display()
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
        let link_path = self.link_path(name.as_str());
        let connection_path = self.connection_path(name.as_str());
        if !self.fs.exists(&link_path) || !self.fs.exists(&connection_path) {
            return Err(AgentError::validation(format!(
                "persist files for {} not found",
                name
            )));
        }
        Ok(())
    }

    fn rollback(&self, ctx: &JobContext, name: &str) -> Result<()> {
        for path in [self.link_path(name), self.connection_path(name)] {
            if !self.fs.exists(&path) {
                continue;
            }
            if let Err(e) = self.fs.remove(&path) {
                debug!("error removing {} (ignored): {}", path.display(), e);
            }
        }
        self.link.cleanup_routing(ctx, name);
        info!("network manager rollback for {} completed (files removed)", name);
        Ok(())
    }
}
