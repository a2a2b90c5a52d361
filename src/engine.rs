use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::adapter::NetworkAdapter;
use crate::cancel::{CancelToken, JobContext};
use crate::drift::DriftDetector;
use crate::entities::{
    InterfaceFailure, InterfaceName, InterfaceResult, InterfaceStatus, NetworkInterface,
    INTERFACE_PREFIX,
};
use crate::errors::{AgentError, Result};
use crate::metrics;
use crate::naming::NamingService;
use crate::osdetect::{OsDetector, OsFamily};
use crate::pool::{JobStatus, WorkerPoolBuilder};
use crate::repository::Repository;

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub max_concurrent_tasks: usize,
    pub max_retries: u32,
    pub retry_backoff_base: Duration,
    pub retry_backoff_multiplier: f64,
    pub op_timeout: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 5,
            max_retries: 3,
            retry_backoff_base: Duration::from_millis(100),
            retry_backoff_multiplier: 2.0,
            op_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReconcileInput {
    pub node_name: String,
}

#[derive(Debug, Default)]
pub struct ReconcileOutput {
    pub processed: usize,
    pub failed: usize,
    pub total: usize,
    pub failures: Vec<InterfaceFailure>,
    pub results: Vec<InterfaceResult>,
}

/// Top level per-node reconciliation: fetch desired state, reserve
/// names, then drive every interface through preflight, drift decision,
/// apply and validation on a bounded worker pool.
pub struct ReconcileEngine {
    repository: Arc<dyn Repository>,
    adapter: Arc<dyn NetworkAdapter>,
    naming: Arc<NamingService>,
    drift: Arc<DriftDetector>,
    detector: Arc<dyn OsDetector>,
    settings: EngineSettings,
}

impl ReconcileEngine {
    pub fn new(
        repository: Arc<dyn Repository>,
        adapter: Arc<dyn NetworkAdapter>,
        naming: Arc<NamingService>,
        drift: Arc<DriftDetector>,
        detector: Arc<dyn OsDetector>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            repository,
            adapter,
            naming,
            drift,
            detector,
            settings,
        }
    }

    pub fn execute(&self, cancel: &CancelToken, input: &ReconcileInput) -> Result<ReconcileOutput> {
        let family = self
            .detector
            .detect()
            .map_err(|e| AgentError::system("failed to detect OS family").with_cause(e))?;

        let run_ctx = JobContext::unbounded(cancel.clone());
        let interfaces = self
            .repository
            .node_interfaces(&run_ctx, &input.node_name)
            .map_err(|e| AgentError::system("failed to get node interfaces").with_cause(e))?;

        debug!(
            "retrieved {} interfaces for node {} (family {})",
            interfaces.len(),
            input.node_name,
            family
        );

        // Reserve names up front to rule out duplicate assignment races.
        // Failure here is not fatal, jobs resolve names individually.
        if let Err(e) = self
            .naming
            .reserve_names_for_interfaces(&run_ctx, &interfaces)
        {
            warn!(
                "failed to reserve names for interfaces, proceeding without preallocation: {}",
                e
            );
        }

        let total = interfaces.len();
        if total == 0 {
            return Ok(ReconcileOutput::default());
        }

        let processed = Arc::new(AtomicUsize::new(0));
        let failed = Arc::new(AtomicUsize::new(0));
        let failures: Arc<Mutex<Vec<InterfaceFailure>>> = Arc::new(Mutex::new(Vec::new()));
        let results: Arc<Mutex<Vec<InterfaceResult>>> = Arc::new(Mutex::new(Vec::new()));

        let runner = Arc::new(JobRunner {
            repository: self.repository.clone(),
            adapter: self.adapter.clone(),
            naming: self.naming.clone(),
            drift: self.drift.clone(),
            family,
        });

        let max_retries = self.settings.max_retries;
        let backoff_base = self.settings.retry_backoff_base;
        let backoff_multiplier = self.settings.retry_backoff_multiplier;

        let hook_repository = self.repository.clone();
        let hook_naming = self.naming.clone();
        let hook_cancel = cancel.clone();
        let hook_processed = processed.clone();
        let hook_failed = failed.clone();
        let hook_failures = failures.clone();
        let hook_results = results.clone();

        let workers = total.min(self.settings.max_concurrent_tasks).max(1);
        let mut pool = WorkerPoolBuilder::new("reconcile", workers)
            .queue_capacity(total)
            .job_timeout(self.settings.op_timeout)
            .retry_policy(move |_: &NetworkInterface, err: &AgentError, attempt| {
                if err.is_retryable() && attempt < max_retries {
                    Some(backoff_base.mul_f64(backoff_multiplier.powi(attempt as i32)))
                } else {
                    None
                }
            })
            .panic_handler(|iface: &NetworkInterface, message| {
                error!(
                    "panic while processing interface {} ({}): {}",
                    iface.id(),
                    iface.mac(),
                    message
                );
            })
            .after_hook(move |iface: &NetworkInterface, status, _duration, _attempts, err| {
                let name = hook_naming
                    .reserved_name(iface.mac().as_str())
                    .unwrap_or_default();
                match status {
                    JobStatus::Success => {
                        hook_processed.fetch_add(1, Ordering::SeqCst);
                        hook_results.lock().expect("results poisoned").push(InterfaceResult {
                            id: iface.id(),
                            mac: iface.mac().as_str().to_string(),
                            name,
                            status: InterfaceStatus::Configured.as_str().to_string(),
                        });
                    }
                    JobStatus::Failed | JobStatus::Panic => {
                        hook_failed.fetch_add(1, Ordering::SeqCst);
                        let (error_type, reason) = match err {
                            Some(err) => {
                                metrics::record_error(err.label());
                                (err.label().to_string(), err.reason())
                            }
                            None => {
                                metrics::record_error("unknown");
                                ("unknown".to_string(), "job panicked".to_string())
                            }
                        };
                        let hook_ctx = JobContext::unbounded(hook_cancel.clone());
                        if let Err(update_err) = hook_repository.update_interface_status(
                            &hook_ctx,
                            iface.id(),
                            InterfaceStatus::Failed,
                        ) {
                            error!("failed to update interface status: {}", update_err);
                        }
                        hook_failures.lock().expect("failures poisoned").push(InterfaceFailure {
                            id: iface.id(),
                            mac: iface.mac().as_str().to_string(),
                            name,
                            error_type,
                            reason,
                        });
                    }
                }
            })
            .spawn(cancel.clone(), move |ctx, iface: &NetworkInterface| {
                runner.process(ctx, iface)
            });

        for iface in interfaces {
            pool.submit(iface);
        }
        pool.stop();

        let taken_failures = std::mem::take(&mut *failures.lock().expect("failures poisoned"));
        let taken_results = std::mem::take(&mut *results.lock().expect("results poisoned"));

        Ok(ReconcileOutput {
            processed: processed.load(Ordering::SeqCst),
            failed: failed.load(Ordering::SeqCst),
            total,
            failures: taken_failures,
            results: taken_results,
        })
    }
}

/// Per-job pipeline shared by the pool workers.
struct JobRunner {
    repository: Arc<dyn Repository>,
    adapter: Arc<dyn NetworkAdapter>,
    naming: Arc<NamingService>,
    drift: Arc<DriftDetector>,
    family: OsFamily,
}

impl JobRunner {
    fn process(&self, ctx: &JobContext, iface: &NetworkInterface) -> Result<()> {
        ctx.check()?;
        self.preflight(ctx, iface)?;

        let name = self.naming.next_name_for_mac(ctx, iface.mac().as_str())?;

        if !self.needs_processing(ctx, iface, &name) {
            debug!(
                "interface {} ({}) already matches desired state as {}, skipping",
                iface.id(),
                iface.mac(),
                name
            );
            return Ok(());
        }

        iface.validate()?;

        info!(
            "starting interface configuration: id={} name={} mac={}",
            iface.id(),
            name,
            iface.mac()
        );

        if let Err(err) = self.adapter.configure(ctx, iface, &name) {
            self.rollback(ctx, &name, "configuration");
            return Err(err);
        }

        if let Err(err) = self.post_validate(ctx, iface, &name) {
            self.rollback(ctx, &name, "validation");
            return Err(err);
        }

        self.repository
            .update_interface_status(ctx, iface.id(), InterfaceStatus::Configured)?;
        Ok(())
    }

    /// Refuses to touch links that could carry live traffic: the MAC must
    /// be present, and its link must not be UP unless it already carries
    /// a multinic name (roll-forward of our own state is safe).
    fn preflight(&self, ctx: &JobContext, iface: &NetworkInterface) -> Result<()> {
        let found = self
            .naming
            .find_interface_name_by_mac(ctx, iface.mac().as_str())?;
        let found = match found {
            Some(found) => found,
            None => {
                return Err(AgentError::validation(format!(
                    "preflight: MAC {} not present on system",
                    iface.mac()
                )))
            }
        };
        if found.starts_with(INTERFACE_PREFIX) {
            return Ok(());
        }
        let up = self.naming.is_interface_up(ctx, &found).unwrap_or_else(|e| {
            debug!("unable to check UP state of {}, assuming down: {}", found, e);
            false
        });
        if up {
            return Err(AgentError::validation(format!(
                "preflight: link {} carrying MAC {} is UP, refusing to modify",
                found,
                iface.mac()
            )));
        }
        Ok(())
    }

    fn needs_processing(
        &self,
        ctx: &JobContext,
        iface: &NetworkInterface,
        name: &InterfaceName,
    ) -> bool {
        let config_dir = self.adapter.config_dir();
        match self.family {
            OsFamily::Netplan => {
                let path = self
                    .drift
                    .find_netplan_file(config_dir, name.as_str())
                    .unwrap_or_else(|| {
                        config_dir.join(format!("9{}-{}.yaml", name.index(), name.as_str()))
                    });
                self.drift.is_netplan_drift(ctx, iface, &path)
            }
            OsFamily::NetworkManager => {
                if let Some(path) = self.drift.find_ifcfg_file(config_dir, name.as_str()) {
                    return self.drift.is_ifcfg_drift(ctx, iface, &path);
                }
                match self.drift.find_nmconnection_file(config_dir, name.as_str()) {
                    Some(path) => self.drift.is_nmconnection_drift(ctx, iface, &path),
                    None => true,
                }
            }
        }
    }

    // MTU and address propagation can lag, so success is judged on MAC
    // presence, link state and the persistence files only.
    fn post_validate(
        &self,
        ctx: &JobContext,
        iface: &NetworkInterface,
        name: &InterfaceName,
    ) -> Result<()> {
        match self
            .naming
            .find_interface_name_by_mac(ctx, iface.mac().as_str())
        {
            Ok(Some(_)) => {}
            Ok(None) => {
                return Err(AgentError::network(format!(
                    "MAC {} not present on system after apply",
                    iface.mac()
                )))
            }
            Err(err) => return Err(err),
        }
        self.adapter
            .validate(ctx, name)
            .map_err(|e| AgentError::network("interface validation failed after apply").with_cause(e))
    }

    fn rollback(&self, ctx: &JobContext, name: &InterfaceName, stage: &str) {
        match self.adapter.rollback(ctx, name.as_str()) {
            Ok(()) => info!("rollback for {} completed (stage: {})", name, stage),
            Err(err) => error!("rollback for {} failed (stage: {}): {}", name, stage, err),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use pretty_assertions::assert_eq;

    use crate::fsys::FileSystem;
    use super::*;
    use crate::adapter::AdapterOptions;
    use crate::netplan::NetplanAdapter;
    use crate::routing::RoutingCoordinator;
    use crate::testutil::{test_iface, FakeLinkSystem, FixedDetector, MemFs, RecordingRepository};

    struct Harness {
        links: FakeLinkSystem,
        fs: Arc<MemFs>,
        repository: Arc<RecordingRepository>,
        engine: ReconcileEngine,
    }

    fn harness(interfaces: Vec<NetworkInterface>, settings: EngineSettings) -> Harness {
        let links = FakeLinkSystem::new();
        let fs = Arc::new(MemFs::new());
        links.attach_sysfs(fs.clone());
        let executor = links.executor();
        let repository = Arc::new(RecordingRepository::new(interfaces));
        let naming = Arc::new(NamingService::new(executor.clone(), fs.clone()));
        let drift = Arc::new(DriftDetector::new(fs.clone(), naming.clone()));
        let adapter = Arc::new(NetplanAdapter::new(
            executor,
            fs.clone(),
            Arc::new(RoutingCoordinator::new()),
            AdapterOptions::default(),
        ));
        let engine = ReconcileEngine::new(
            repository.clone(),
            adapter,
            naming,
            drift,
            Arc::new(FixedDetector(OsFamily::Netplan)),
            settings,
        );
        Harness { links, fs, repository, engine }
    }

    fn fast_settings() -> EngineSettings {
        EngineSettings {
            retry_backoff_base: Duration::from_millis(1),
            ..EngineSettings::default()
        }
    }

    fn input() -> ReconcileInput {
        ReconcileInput { node_name: "node-a".to_string() }
    }

    #[test]
    fn test_single_interface_clean_slot() {
        let h = harness(vec![test_iface(1, "02:00:00:00:00:01", "10.0.0.2")], fast_settings());
        h.links.add_link("eth0", "02:00:00:00:00:01", false);

        let output = h.engine.execute(&CancelToken::new(), &input()).unwrap();

        assert_eq!((output.processed, output.failed, output.total), (1, 0, 1));
        assert_eq!(output.results.len(), 1);
        assert_eq!(output.results[0].name, "multinic0");
        assert_eq!(output.results[0].status, "Configured");
        assert!(output.failures.is_empty());

        let text = String::from_utf8(
            h.fs.read_file(Path::new("/etc/netplan/90-multinic0.yaml")).unwrap(),
        )
        .unwrap();
        assert!(text.contains("set-name: multinic0"), "{}", text);
        assert!(text.contains("10.0.0.2/24"), "{}", text);
        assert!(text.contains("mtu: 1500"), "{}", text);

        assert_eq!(h.repository.updates(), vec![(1, InterfaceStatus::Configured)]);
        assert!(h.links.link("multinic0").unwrap().up);
    }

    #[test]
    fn test_second_run_short_circuits() {
        let h = harness(vec![test_iface(1, "02:00:00:00:00:01", "10.0.0.2")], fast_settings());
        h.links.add_link("eth0", "02:00:00:00:00:01", false);

        let first = h.engine.execute(&CancelToken::new(), &input()).unwrap();
        assert_eq!((first.processed, first.failed), (1, 0));

        h.links.clear_calls();
        let second = h.engine.execute(&CancelToken::new(), &input()).unwrap();
        assert_eq!((second.processed, second.failed, second.total), (1, 0, 1));

        let flat: Vec<String> = h.links.calls().iter().map(|c| c.join(" ")).collect();
        assert!(
            !flat.iter().any(|c| c.starts_with("ip addr replace")),
            "second run must not re-apply: {:?}",
            flat
        );
        assert!(
            !flat.iter().any(|c| c.contains(" name ")),
            "second run must not rename: {:?}",
            flat
        );
    }

    #[test]
    fn test_transient_failure_is_retried() {
        let mut settings = fast_settings();
        settings.max_retries = 2;
        let h = harness(vec![test_iface(1, "02:00:00:00:00:01", "10.0.0.2")], settings);
        h.links.add_link("eth0", "02:00:00:00:00:01", false);
        h.links.fail_addr_replace(1);

        let output = h.engine.execute(&CancelToken::new(), &input()).unwrap();

        assert_eq!((output.processed, output.failed), (1, 0));
        // The repository never saw a Failed transition.
        assert_eq!(h.repository.updates(), vec![(1, InterfaceStatus::Configured)]);
    }

    #[test]
    fn test_preflight_blocks_up_foreign_link() {
        let h = harness(vec![test_iface(1, "02:00:00:00:00:01", "10.0.0.2")], fast_settings());
        h.links.add_link("eth0", "02:00:00:00:00:01", true);

        let output = h.engine.execute(&CancelToken::new(), &input()).unwrap();

        assert_eq!((output.processed, output.failed, output.total), (0, 1, 1));
        let failure = &output.failures[0];
        assert_eq!(failure.error_type, "validation");
        assert!(failure.reason.starts_with("preflight"), "{}", failure.reason);
        assert!(!h.fs.exists(Path::new("/etc/netplan/90-multinic0.yaml")));
        assert_eq!(h.repository.updates(), vec![(1, InterfaceStatus::Failed)]);
    }

    #[test]
    fn test_missing_mac_fails_preflight() {
        let h = harness(vec![test_iface(1, "02:00:00:00:00:01", "10.0.0.2")], fast_settings());

        let output = h.engine.execute(&CancelToken::new(), &input()).unwrap();

        assert_eq!((output.processed, output.failed), (0, 1));
        assert_eq!(output.failures[0].error_type, "validation");
        assert!(output.failures[0].reason.starts_with("preflight"));
    }

    #[test]
    fn test_concurrency_cap_is_respected() {
        let interfaces: Vec<_> = (0..10u32)
            .map(|i| {
                test_iface(
                    i + 1,
                    &format!("02:00:00:00:00:{:02x}", i + 1),
                    &format!("10.0.{}.2", i),
                )
            })
            .collect();
        let mut settings = fast_settings();
        settings.max_concurrent_tasks = 3;
        let h = harness(interfaces, settings);
        for i in 0..10u32 {
            h.links
                .add_link(&format!("eth{}", i), &format!("02:00:00:00:00:{:02x}", i + 1), false);
        }
        h.links.set_addr_replace_delay(Duration::from_millis(30));

        let output = h.engine.execute(&CancelToken::new(), &input()).unwrap();

        assert_eq!((output.processed, output.failed, output.total), (10, 0, 10));
        assert!(
            h.links.peak_replaces() <= 3,
            "peak concurrency {} exceeds the cap",
            h.links.peak_replaces()
        );
    }

    #[test]
    fn test_eleventh_interface_exhausts_pool() {
        let interfaces: Vec<_> = (0..11u32)
            .map(|i| {
                test_iface(
                    i + 1,
                    &format!("02:00:00:00:00:{:02x}", i + 1),
                    &format!("10.0.{}.2", i),
                )
            })
            .collect();
        let h = harness(interfaces, fast_settings());
        for i in 0..11u32 {
            h.links
                .add_link(&format!("eth{}", i), &format!("02:00:00:00:00:{:02x}", i + 1), false);
        }

        let output = h.engine.execute(&CancelToken::new(), &input()).unwrap();

        assert_eq!((output.processed, output.failed, output.total), (10, 1, 11));
        assert_eq!(output.failures.len(), 1);
        assert!(
            output.failures[0].reason.contains("no interface name available"),
            "{}",
            output.failures[0].reason
        );
    }

    #[test]
    fn test_drift_fix_rewrites_file() {
        let h = harness(
            vec![NetworkInterface::new(
                1,
                "02:00:00:00:00:01",
                "node-a",
                "1.1.1.1",
                "1.1.1.0/24",
                1500,
            )
            .unwrap()],
            fast_settings(),
        );
        h.links.add_link("eth0", "02:00:00:00:00:01", false);
        h.fs.add_file(
            "/etc/netplan/90-multinic0.yaml",
            b"network:\n  version: 2\n  ethernets:\n    multinic0:\n      match:\n        macaddress: \"02:00:00:00:00:01\"\n      set-name: multinic0\n      dhcp4: false\n      addresses:\n      - 1.1.1.2/24\n      mtu: 1400\n",
        );

        let output = h.engine.execute(&CancelToken::new(), &input()).unwrap();

        assert_eq!((output.processed, output.failed), (1, 0));
        let text = String::from_utf8(
            h.fs.read_file(Path::new("/etc/netplan/90-multinic0.yaml")).unwrap(),
        )
        .unwrap();
        assert!(text.contains("1.1.1.1/24"), "{}", text);
        assert!(text.contains("mtu: 1500"), "{}", text);
        assert!(!text.contains("1.1.1.2/24"), "{}", text);
    }

    #[test]
    fn test_empty_interface_list() {
        let h = harness(vec![], fast_settings());
        let output = h.engine.execute(&CancelToken::new(), &input()).unwrap();
        assert_eq!((output.processed, output.failed, output.total), (0, 0, 0));
    }

    #[test]
    fn test_repository_error_is_system() {
        let h = harness(vec![], fast_settings());
        h.repository
            .fail_next_list(AgentError::not_found("node config not found"));
        let err = h.engine.execute(&CancelToken::new(), &input()).unwrap_err();
        assert_eq!(err.kind(), crate::errors::ErrorKind::System);
    }

    #[test]
    fn test_counts_always_sum_to_total() {
        // A mix of processable and failing interfaces.
        let interfaces = vec![
            test_iface(1, "02:00:00:00:00:01", "10.0.0.2"),
            test_iface(2, "02:00:00:00:00:02", "10.0.1.2"),
            test_iface(3, "02:00:00:00:00:03", "10.0.2.2"),
        ];
        let h = harness(interfaces, fast_settings());
        h.links.add_link("eth0", "02:00:00:00:00:01", false);
        h.links.add_link("eth1", "02:00:00:00:00:02", true);
        // MAC 03 is absent entirely.

        let output = h.engine.execute(&CancelToken::new(), &input()).unwrap();

        assert_eq!(output.processed + output.failed, output.total);
        assert_eq!(output.processed, 1);
        assert_eq!(output.failed, 2);
    }
}
