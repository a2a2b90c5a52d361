use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info, warn};

use crate::adapter::NetworkAdapter;
use crate::cancel::{CancelToken, JobContext};
use crate::drift::{interface_name_from_path, mac_from_persistence_file};
use crate::entities::INTERFACE_PREFIX;
use crate::errors::{AgentError, Result};
use crate::fsys::FileSystem;
use crate::metrics;
use crate::naming::NamingService;
use crate::osdetect::{OsDetector, OsFamily};
use crate::repository::Repository;

pub const LEGACY_IFCFG_DIR: &str = "/etc/sysconfig/network-scripts";

#[derive(Debug, Clone)]
pub struct CleanupInput {
    pub node_name: String,
    /// Remove every multinic persistence file regardless of orphan
    /// status. Used by the dedicated cleanup job.
    pub full_cleanup: bool,
}

#[derive(Debug, Default)]
pub struct CleanupOutput {
    pub deleted_interfaces: Vec<String>,
    pub total_deleted: usize,
    pub errors: Vec<AgentError>,
}

/// Detects and removes orphaned persistence state: files whose embedded
/// MAC no longer appears in the desired list, plus leftover multinicX
/// links renamed back to a free altname.
pub struct CleanupEngine {
    repository: Arc<dyn Repository>,
    adapter: Arc<dyn NetworkAdapter>,
    naming: Arc<NamingService>,
    fs: Arc<dyn FileSystem>,
    detector: Arc<dyn OsDetector>,
    legacy_ifcfg_dir: PathBuf,
}

impl CleanupEngine {
    pub fn new(
        repository: Arc<dyn Repository>,
        adapter: Arc<dyn NetworkAdapter>,
        naming: Arc<NamingService>,
        fs: Arc<dyn FileSystem>,
        detector: Arc<dyn OsDetector>,
    ) -> Self {
        Self {
            repository,
            adapter,
            naming,
            fs,
            detector,
            legacy_ifcfg_dir: PathBuf::from(LEGACY_IFCFG_DIR),
        }
    }

    pub fn with_legacy_ifcfg_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.legacy_ifcfg_dir = dir.into();
        self
    }

    pub fn execute(&self, cancel: &CancelToken, input: &CleanupInput) -> Result<CleanupOutput> {
        let family = self.detector.detect()?;
        let ctx = JobContext::unbounded(cancel.clone());

        let mut output = CleanupOutput::default();
        let candidates = self.candidate_files(family);

        let targets = if input.full_cleanup {
            info!("cleanup mode: removing all multinic interface files");
            candidates
        } else {
            self.orphaned_files(&ctx, &input.node_name, candidates)?
        };

        if targets.is_empty() {
            debug!("no multinic persistence files to delete");
        }

        let mut rolled_back: HashSet<String> = HashSet::new();
        for path in targets {
            let Some(name) = interface_name_from_path(&path) else {
                continue;
            };
            if !rolled_back.insert(name.clone()) {
                // Both files of a NetworkManager pair map to one rollback.
                continue;
            }
            match self.adapter.rollback(&ctx, &name) {
                Ok(()) => {
                    info!("removed orphaned configuration for {} ({})", name, path.display());
                    output.deleted_interfaces.push(name);
                    output.total_deleted += 1;
                    metrics::metrics().orphaned_deleted_total.inc();
                }
                Err(e) => {
                    warn!("failed to remove configuration {} for {}: {}", path.display(), name, e);
                    output.errors.push(e);
                }
            }
        }

        self.release_leftover_links(&ctx);
        Ok(output)
    }

    /// Every multinic persistence file present for the detected family.
    fn candidate_files(&self, family: OsFamily) -> Vec<PathBuf> {
        let mut files = Vec::new();
        match family {
            OsFamily::Netplan => {
                self.collect_matching(self.adapter.config_dir(), &mut files, |name| {
                    is_multinic_netplan_file(name)
                });
            }
            OsFamily::NetworkManager => {
                self.collect_matching(self.adapter.config_dir(), &mut files, |name| {
                    is_multinic_nmconnection_file(name)
                });
                // Older installs used network-scripts; the directory is
                // absent on RHEL9+ and that is fine.
                self.collect_matching(&self.legacy_ifcfg_dir, &mut files, |name| {
                    is_multinic_ifcfg_file(name)
                });
            }
        }
        files
    }

    fn collect_matching<F>(&self, dir: &Path, out: &mut Vec<PathBuf>, matches: F)
    where
        F: Fn(&str) -> bool,
    {
        match self.fs.list_files(dir) {
            Ok(names) => {
                out.extend(names.into_iter().filter(|n| matches(n)).map(|n| dir.join(n)));
            }
            Err(e) => {
                debug!("directory {} not scanned: {}", dir.display(), e);
            }
        }
    }

    /// Files whose embedded MAC is not in the node's desired list.
    fn orphaned_files(
        &self,
        ctx: &JobContext,
        node_name: &str,
        candidates: Vec<PathBuf>,
    ) -> Result<Vec<PathBuf>> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let interfaces = self
            .repository
            .node_interfaces(ctx, node_name)
            .map_err(|e| AgentError::system("failed to get active interfaces").with_cause(e))?;
        let active_macs: HashSet<String> = interfaces
            .iter()
            .map(|i| i.mac().as_str().to_string())
            .collect();
        debug!(
            "orphan detection for {}: {} active MACs, {} candidate files",
            node_name,
            active_macs.len(),
            candidates.len()
        );

        let mut orphaned = Vec::new();
        for path in candidates {
            let mac = match mac_from_persistence_file(self.fs.as_ref(), &path) {
                Some(mac) => mac,
                None => {
                    warn!("unable to extract MAC from {}, skipping", path.display());
                    continue;
                }
            };
            if !active_macs.contains(&mac) {
                info!(
                    "found orphaned persistence file {} (mac {})",
                    path.display(),
                    mac
                );
                orphaned.push(path);
            }
        }
        Ok(orphaned)
    }

    /// Renames leftover DOWN multinicX links back to their first free
    /// altname. UP links keep their name, renaming them would disrupt
    /// traffic.
    fn release_leftover_links(&self, ctx: &JobContext) {
        for name in self.naming.current_multinic_interfaces() {
            let name = name.as_str();
            match self.naming.is_interface_up(ctx, name) {
                Ok(true) => {
                    warn!("skip renaming UP interface {} (keeping current name)", name);
                    continue;
                }
                Ok(false) => {}
                Err(e) => {
                    debug!("unable to check UP state of {}, skipping rename: {}", name, e);
                    continue;
                }
            }
            let alts = match self.naming.alt_names(ctx, name) {
                Ok(alts) => alts,
                Err(e) => {
                    debug!("unable to read altnames of {}: {}", name, e);
                    continue;
                }
            };
            let Some(target) = alts.into_iter().find(|alt| !self.naming.interface_exists(alt))
            else {
                debug!("no free altname for {}, skipping", name);
                continue;
            };
            match self.naming.rename_interface(ctx, name, &target) {
                Ok(()) => info!("renamed leftover interface {} to {}", name, target),
                Err(e) => warn!("failed to rename {} to {}: {}", name, target, e),
            }
        }
    }
}

fn is_multinic_netplan_file(name: &str) -> bool {
    name.starts_with('9') && name.contains('-') && name.contains(INTERFACE_PREFIX) && name.ends_with(".yaml")
}

fn is_multinic_nmconnection_file(name: &str) -> bool {
    name.starts_with('9')
        && name.contains('-')
        && name.contains(INTERFACE_PREFIX)
        && name.ends_with(".nmconnection")
}

fn is_multinic_ifcfg_file(name: &str) -> bool {
    name.starts_with("ifcfg-multinic")
}
