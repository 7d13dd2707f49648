//! Controller Lifecycle.
//!
//! Startup runs attach, seed, header, then spawns the sampler and reporter.
//! Shutdown cancels both loops, waits for each to return and only then
//! releases the interface attachments, so no record write can follow a
//! detach.

use std::future::Future;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use titrate_common::{
    DatapathAttach, InterfaceResolver, KernelStateBridge, ShaperError, ShaperResult, ShapingConfig,
};

use crate::attach::{AttachmentManager, ReleaseSummary};
use crate::loops::{CountersSnapshot, TickPolicy};
use crate::policy::Policy;
use crate::reporter::Reporter;
use crate::sampler::Sampler;
use crate::stats::SharedStats;

/// Everything the lifecycle needs from configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerSettings {
    pub shaping: ShapingConfig,
    pub interfaces: Vec<String>,
    pub avg_samples: usize,
    pub sample_period: Duration,
    pub report_period: Duration,
    pub tick_policy: TickPolicy,
}

/// Final accounting returned by [`Controller::shutdown`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub sampler: CountersSnapshot,
    pub reporter: CountersSnapshot,
    pub release: ReleaseSummary,
}

/// A running controller: attached interfaces plus the two loop tasks.
pub struct Controller<D: DatapathAttach> {
    policy: Policy,
    attachments: AttachmentManager<D>,
    cancel: CancellationToken,
    sampler: JoinHandle<CountersSnapshot>,
    reporter: JoinHandle<CountersSnapshot>,
}

impl<D: DatapathAttach> Controller<D> {
    /// Bootstraps the datapath and starts both loops.
    ///
    /// Must be called from within a tokio runtime. Any error returned here
    /// is fatal; attachments made before the failure have already been
    /// released.
    pub fn start<W>(
        settings: &ControllerSettings,
        mut bridge: KernelStateBridge,
        datapath: D,
        resolver: &dyn InterfaceResolver,
        sink: W,
    ) -> ShaperResult<Self>
    where
        W: Write + Send + 'static,
    {
        if settings.interfaces.iter().all(|name| name.trim().is_empty()) {
            return Err(ShaperError::EmptyInterfaceList);
        }

        let mut attachments = AttachmentManager::new(datapath);
        let attached = attachments.attach_all(resolver, &settings.interfaces)?;
        info!(attached, "Interfaces attached");

        if let Err(e) = bridge.seed(&settings.shaping) {
            abort_cleanup(&mut attachments);
            return Err(e);
        }

        let policy = Policy::from_config(&settings.shaping);
        let stats = Arc::new(SharedStats::new());
        let (sampler_maps, reporter_maps) = bridge.split();

        let mut reporter = Reporter::new(
            reporter_maps,
            policy,
            Arc::clone(&stats),
            sink,
            Instant::now(),
        );
        if let Err(e) = reporter.write_header() {
            abort_cleanup(&mut attachments);
            return Err(e.into());
        }

        let sampler = Sampler::new(sampler_maps, settings.avg_samples, policy, stats);

        let cancel = CancellationToken::new();
        let sampler = tokio::spawn(sampler.run(
            settings.sample_period,
            settings.tick_policy,
            cancel.child_token(),
        ));
        let reporter = tokio::spawn(reporter.run(
            settings.report_period,
            settings.tick_policy,
            cancel.child_token(),
        ));

        info!(policy = policy.name(), "Controller started");
        Ok(Self {
            policy,
            attachments,
            cancel,
            sampler,
            reporter,
        })
    }

    pub fn policy(&self) -> Policy {
        self.policy
    }

    /// Attachments currently held.
    pub fn attachments(&self) -> &[crate::attach::InterfaceAttachment] {
        self.attachments.attachments()
    }

    /// Waits for `shutdown` to resolve, then shuts down.
    pub async fn run_until<F>(self, shutdown: F) -> ShutdownReport
    where
        F: Future<Output = ()>,
    {
        shutdown.await;
        info!("Termination requested");
        self.shutdown().await
    }

    /// Stops both loops, waits for them, then releases every attachment.
    pub async fn shutdown(mut self) -> ShutdownReport {
        self.cancel.cancel();

        let sampler = join_loop("sampler", self.sampler).await;
        let reporter = join_loop("reporter", self.reporter).await;
        let release = self.attachments.release_all();

        if release.failed > 0 {
            warn!(
                released = release.released,
                failed = release.failed,
                "Some attachments could not be released"
            );
        }
        info!(
            released = release.released,
            sampler_ticks = sampler.ticks,
            reporter_rows = reporter.rows_emitted,
            "Controller stopped"
        );
        ShutdownReport {
            sampler,
            reporter,
            release,
        }
    }
}

async fn join_loop(name: &'static str, handle: JoinHandle<CountersSnapshot>) -> CountersSnapshot {
    match handle.await {
        Ok(counters) => counters,
        Err(e) => {
            error!(task = name, error = %e, "Control loop ended abnormally");
            CountersSnapshot::default()
        }
    }
}

fn abort_cleanup<D: DatapathAttach>(attachments: &mut AttachmentManager<D>) {
    let summary = attachments.release_all();
    warn!(
        released = summary.released,
        failed = summary.failed,
        "Startup aborted, attachments released"
    );
}
