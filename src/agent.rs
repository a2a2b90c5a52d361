use std::path::Path;
use std::sync::Arc;
use std::thread;

use anyhow::{bail, Context};
use chrono::Utc;
use log::{error, info, warn};
use serde::Serialize;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;

use crate::adapter::{AdapterOptions, NetworkAdapter};
use crate::cancel::{CancelToken, JobContext};
use crate::cleanup::{CleanupEngine, CleanupInput, CleanupOutput};
use crate::config::{AgentAction, AgentConfig, RunMode};
use crate::drift::DriftDetector;
use crate::engine::{EngineSettings, ReconcileEngine, ReconcileInput, ReconcileOutput};
use crate::entities::InterfaceFailure;
use crate::exec::{CommandExecutor, RealCommandExecutor};
use crate::fsys::{FileSystem, RealFileSystem};
use crate::logger::init_from_env;
use crate::naming::NamingService;
use crate::netman::NetworkManagerAdapter;
use crate::netplan::NetplanAdapter;
use crate::osdetect::{OsDetector, OsFamily, OsReleaseDetector};
use crate::repository::{FileConfigSource, NodeConfigRepository, Repository};
use crate::routing::RoutingCoordinator;

pub const TERMINATION_LOG_PATH: &str = "/dev/termination-log";

/// Entry point for the binary: logging, config, wiring, run.
pub fn run() -> anyhow::Result<()> {
    init_from_env().map_err(|e| anyhow::anyhow!("unable to initialize logger: {e}"))?;
    let config = AgentConfig::from_env()?;
    let app = Application::new(config)?;
    app.install_signal_handler()?;
    app.run()
}

/// Summary of one job run, written to the termination log for the
/// scheduler to surface.
#[derive(Debug, Serialize)]
pub struct RunSummary {
    pub node: String,
    pub processed: usize,
    pub failed: usize,
    pub total: usize,
    pub failures: Vec<InterfaceFailure>,
    pub deleted_total: usize,
    pub delete_errors: usize,
    pub timestamp: String,
}

pub struct Application {
    config: AgentConfig,
    cancel: CancelToken,
    fs: Arc<dyn FileSystem>,
    naming: Arc<NamingService>,
    engine: ReconcileEngine,
    cleanup: CleanupEngine,
}

impl Application {
    pub fn new(config: AgentConfig) -> anyhow::Result<Self> {
        let executor: Arc<dyn CommandExecutor> = Arc::new(RealCommandExecutor::new());
        let fs: Arc<dyn FileSystem> = Arc::new(RealFileSystem::new());
        Self::with_ports(config, executor, fs)
    }

    /// Wires the engines against explicit ports. The OS family picks the
    /// adapter; everything else is shared.
    pub fn with_ports(
        config: AgentConfig,
        executor: Arc<dyn CommandExecutor>,
        fs: Arc<dyn FileSystem>,
    ) -> anyhow::Result<Self> {
        let detector: Arc<dyn OsDetector> = Arc::new(OsReleaseDetector::new(fs.clone()));
        let family = detector.detect().context("failed to detect OS family")?;
        info!("operating system detected: {}", family);

        let routing = Arc::new(RoutingCoordinator::new());
        let opts = AdapterOptions::default();
        let adapter: Arc<dyn NetworkAdapter> = match family {
            OsFamily::Netplan => Arc::new(NetplanAdapter::new(
                executor.clone(),
                fs.clone(),
                routing,
                opts,
            )),
            OsFamily::NetworkManager => Arc::new(NetworkManagerAdapter::new(
                executor.clone(),
                fs.clone(),
                routing,
                opts,
            )),
        };

        let naming = Arc::new(NamingService::new(executor.clone(), fs.clone()));
        let drift = Arc::new(DriftDetector::new(fs.clone(), naming.clone()));
        let source = Arc::new(FileConfigSource::new(fs.clone(), config.node_config_path.clone()));
        let repository: Arc<dyn Repository> = Arc::new(NodeConfigRepository::new(source));

        let settings = EngineSettings {
            max_concurrent_tasks: config.max_concurrent_tasks,
            max_retries: config.max_retries,
            op_timeout: config.op_timeout,
            ..EngineSettings::default()
        };
        let engine = ReconcileEngine::new(
            repository.clone(),
            adapter.clone(),
            naming.clone(),
            drift,
            detector.clone(),
            settings,
        );
        let cleanup = CleanupEngine::new(repository, adapter, naming.clone(), fs.clone(), detector);

        Ok(Self {
            config,
            cancel: CancelToken::new(),
            fs,
            naming,
            engine,
            cleanup,
        })
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// SIGINT and SIGTERM cancel the run; in-flight jobs observe the
    /// cancellation at their next suspension point.
    pub fn install_signal_handler(&self) -> anyhow::Result<()> {
        let mut signals =
            Signals::new([SIGINT, SIGTERM]).context("unable to install signal handler")?;
        let cancel = self.cancel.clone();
        thread::Builder::new()
            .name("signals".to_string())
            .spawn(move || {
                if let Some(signal) = signals.forever().next() {
                    info!("received shutdown signal {}", signal);
                    cancel.cancel();
                }
            })
            .context("unable to spawn signal thread")?;
        Ok(())
    }

    pub fn run(&self) -> anyhow::Result<()> {
        let node_name = self.resolve_node_name()?;
        match self.config.run_mode {
            RunMode::Job => {
                info!("multinic agent started (run mode: job)");
                let result = match self.config.action {
                    AgentAction::Cleanup => self.run_cleanup_job(&node_name),
                    AgentAction::Configure => self.run_once(&node_name),
                };
                self.delay_job_exit();
                result
            }
            RunMode::Service => {
                info!(
                    "multinic agent started (run mode: service, poll interval {:?})",
                    self.config.poll_interval
                );
                self.run_service(&node_name)
            }
        }
    }

    fn run_service(&self, node_name: &str) -> anyhow::Result<()> {
        loop {
            if self.cancel.is_cancelled() {
                info!("shutting down polling loop");
                return Ok(());
            }
            if let Err(e) = self.run_once(node_name) {
                error!("failed to process network configurations: {:#}", e);
            }
            if !self.cancel.sleep(self.config.poll_interval) {
                info!("shutting down polling loop");
                return Ok(());
            }
        }
    }

    fn run_cleanup_job(&self, node_name: &str) -> anyhow::Result<()> {
        let output = self.cleanup.execute(
            &self.cancel,
            &CleanupInput {
                node_name: node_name.to_string(),
                full_cleanup: true,
            },
        )?;
        info!(
            "cleanup completed: {} deleted, {} errors",
            output.total_deleted,
            output.errors.len()
        );
        for err in &output.errors {
            warn!("error during interface deletion: {}", err);
        }
        Ok(())
    }

    /// One reconciliation pass: orphan cleanup first (non-fatal), then
    /// the configure engine, then the termination summary.
    fn run_once(&self, node_name: &str) -> anyhow::Result<()> {
        let delete_output = match self.cleanup.execute(
            &self.cancel,
            &CleanupInput {
                node_name: node_name.to_string(),
                full_cleanup: false,
            },
        ) {
            Ok(output) => output,
            Err(e) => {
                error!("failed to process orphaned interface deletion: {}", e);
                CleanupOutput {
                    errors: vec![e],
                    ..CleanupOutput::default()
                }
            }
        };

        let output = self.engine.execute(
            &self.cancel,
            &ReconcileInput {
                node_name: node_name.to_string(),
            },
        )?;

        let result = run_result(&output, self.config.complete_on_partial_failure);

        if output.processed > 0 || output.failed > 0 || delete_output.total_deleted > 0 {
            let fields = format!(
                "processed={} failed={} total={} deleted={} delete_errors={}",
                output.processed,
                output.failed,
                output.total,
                delete_output.total_deleted,
                delete_output.errors.len()
            );
            match &result {
                Ok(()) => info!("network processing completed: {}", fields),
                Err(e) => error!("network processing completed with failures: {} ({})", fields, e),
            }
            self.write_termination_summary(node_name, &output, &delete_output);
        }

        for err in &delete_output.errors {
            warn!("error during interface deletion: {}", err);
        }

        result
    }

    // Best effort only. A summary that cannot be written must never fail
    // the job itself.
    fn write_termination_summary(
        &self,
        node_name: &str,
        output: &ReconcileOutput,
        delete_output: &CleanupOutput,
    ) {
        let summary = RunSummary {
            node: node_name.to_string(),
            processed: output.processed,
            failed: output.failed,
            total: output.total,
            failures: output.failures.clone(),
            deleted_total: delete_output.total_deleted,
            delete_errors: delete_output.errors.len(),
            timestamp: Utc::now().to_rfc3339(),
        };
        match serde_json::to_vec(&summary) {
            Ok(data) => {
                if let Err(e) = self.fs.write_file(Path::new(TERMINATION_LOG_PATH), &data, 0o644) {
                    warn!("unable to write termination summary: {}", e);
                }
            }
            Err(e) => warn!("unable to serialize termination summary: {}", e),
        }
    }

    fn resolve_node_name(&self) -> anyhow::Result<String> {
        if let Some(name) = &self.config.node_name {
            return Ok(name.clone());
        }
        let ctx = JobContext::unbounded(self.cancel.clone());
        let hostname = self
            .naming
            .hostname(&ctx)
            .context("unable to resolve node name")?;
        Ok(hostname)
    }

    fn delay_job_exit(&self) {
        if self.config.job_exit_delay.is_zero() {
            return;
        }
        info!("delaying job exit for {:?}", self.config.job_exit_delay);
        thread::sleep(self.config.job_exit_delay);
    }

}

/// Exit policy: full failure is always an error; partial failure is an
/// error only when the permissive policy is off.
fn run_result(output: &ReconcileOutput, complete_on_partial_failure: bool) -> anyhow::Result<()> {
    if output.failed == 0 {
        return Ok(());
    }
    if output.processed == 0 {
        bail!(
            "network configuration failed for {}/{} interfaces",
            output.failed,
            output.total
        );
    }
    if !complete_on_partial_failure {
        bail!(
            "network configuration partially failed: {}/{} interfaces",
            output.failed,
            output.total
        );
    }
    Ok(())
}
