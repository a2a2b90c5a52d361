use std::path::PathBuf;
use std::sync::Arc;

use log::debug;
use serde::Deserialize;

use crate::cancel::JobContext;
use crate::entities::{InterfaceStatus, NetworkInterface};
use crate::errors::{AgentError, Result};
use crate::fsys::FileSystem;

/// Provider of the desired interface list for a node. The scheduler side
/// (Kubernetes CR, SQL) stays behind this port.
pub trait Repository: Send + Sync {
    fn node_interfaces(&self, ctx: &JobContext, node_name: &str) -> Result<Vec<NetworkInterface>>;
    fn update_interface_status(
        &self,
        ctx: &JobContext,
        interface_id: u32,
        status: InterfaceStatus,
    ) -> Result<()>;
}

/// Desired state for one node as delivered by the scheduler.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    #[serde(rename = "nodeName")]
    pub node_name: String,
    #[serde(default)]
    pub interfaces: Vec<NodeInterfaceSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeInterfaceSpec {
    #[serde(default)]
    pub id: u32,
    #[serde(rename = "macAddress")]
    pub mac_address: String,
    pub address: String,
    pub cidr: String,
    pub mtu: u32,
}

/// How to obtain a node's config. Kept separate from the repository so a
/// different backend only swaps this out.
pub trait NodeConfigSource: Send + Sync {
    fn node_config(&self, ctx: &JobContext, node_name: &str) -> Result<Option<NodeConfig>>;
}

#[derive(Debug, Deserialize)]
struct NodeConfigFile {
    #[serde(default)]
    nodes: Vec<NodeConfig>,
}

/// Reads node configs from one declarative YAML file:
///
/// ```yaml
/// nodes:
///   - nodeName: node-a
///     interfaces:
///       - id: 1
///         macAddress: "02:00:00:00:00:01"
///         address: 10.0.0.2
///         cidr: 10.0.0.0/24
///         mtu: 1500
/// ```
pub struct FileConfigSource {
    fs: Arc<dyn FileSystem>,
    path: PathBuf,
}

impl FileConfigSource {
    pub fn new(fs: Arc<dyn FileSystem>, path: impl Into<PathBuf>) -> Self {
        Self { fs, path: path.into() }
    }
}

impl NodeConfigSource for FileConfigSource {
    fn node_config(&self, ctx: &JobContext, node_name: &str) -> Result<Option<NodeConfig>> {
        ctx.check()?;
        let content = self.fs.read_file(&self.path)?;
        let file: NodeConfigFile = serde_yaml::from_slice(&content).map_err(|e| {
            AgentError::configuration(format!("unable to parse {}", self.path.display()))
                .with_cause(e)
        })?;
        Ok(file.nodes.into_iter().find(|n| n.node_name == node_name))
    }
}

/// Repository backed by a NodeConfigSource. Status updates are a no-op
/// here, the scheduler owns status in this model.
pub struct NodeConfigRepository {
    source: Arc<dyn NodeConfigSource>,
}

impl NodeConfigRepository {
    pub fn new(source: Arc<dyn NodeConfigSource>) -> Self {
        Self { source }
    }
}

impl Repository for NodeConfigRepository {
    fn node_interfaces(&self, ctx: &JobContext, node_name: &str) -> Result<Vec<NetworkInterface>> {
        let config = self
            .source
            .node_config(ctx, node_name)
            .map_err(|e| AgentError::system("failed to get node config").with_cause(e))?
            .ok_or_else(|| {
                AgentError::not_found(format!("node config not found for node {}", node_name))
            })?;

        let mut out = Vec::with_capacity(config.interfaces.len());
        for (i, spec) in config.interfaces.iter().enumerate() {
            let id = if spec.id == 0 { i as u32 + 1 } else { spec.id };
            let iface = NetworkInterface::new(
                id,
                &spec.mac_address,
                &config.node_name,
                &spec.address,
                &spec.cidr,
                spec.mtu,
            )?;
            out.push(iface);
        }
        Ok(out)
    }

    fn update_interface_status(
        &self,
        _ctx: &JobContext,
        interface_id: u32,
        status: InterfaceStatus,
    ) -> Result<()> {
        debug!(
            "interface {} status {} (recorded by the scheduler, no-op here)",
            interface_id,
            status.as_str()
        );
        Ok(())
    }
}
