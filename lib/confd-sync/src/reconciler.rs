use std::sync::Arc;

use confd_common::telemetry::MetricsRegistry;
use confd_discovery::{RegistrySnapshot, RegistrySubscription};
use confd_error::{FailureScope, ScopedFailure};
use metrics::{counter, gauge, Counter, Gauge};
use snafu::{ResultExt as _, Snafu};
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    committer::{CommitError, CommitOutcome, ConfigCommitter},
    document::{CheckDocument, EncodingError},
    family::CheckFamily,
    reload::{ReloadError, ReloadTrigger},
};

/// A reconciliation pass failed.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum ReconcileError {
    #[snafu(display("Failed to encode {} check document: {}", family, source))]
    Encoding {
        family: &'static str,
        source: EncodingError,
    },

    #[snafu(display("Failed to commit {} check configuration: {}", family, source))]
    Commit {
        family: &'static str,
        source: CommitError,
    },

    #[snafu(display("Failed to reload agent after {} configuration change: {}", family, source))]
    Reload {
        family: &'static str,
        source: ReloadError,
    },
}

impl ScopedFailure for ReconcileError {
    fn scope(&self) -> FailureScope {
        match self {
            Self::Encoding { source, .. } => source.scope(),
            Self::Commit { source, .. } => source.scope(),
            Self::Reload { source, .. } => source.scope(),
        }
    }
}

struct Telemetry {
    instances: Gauge,
    passes: Counter,
    commits: Counter,
    skipped_entries: Counter,
}

impl Telemetry {
    fn new(family: &'static str, metrics: &MetricsRegistry) -> Self {
        metrics.scoped(|| Self {
            instances: gauge!("check_instances", "family" => family),
            passes: counter!("reconcile_passes_total", "family" => family),
            commits: counter!("config_commits_total", "family" => family),
            skipped_entries: counter!("skipped_entries_total", "family" => family),
        })
    }
}

/// Keeps one check family's configuration file in line with the service registry.
pub struct Reconciler<F> {
    family: F,
    committer: ConfigCommitter,
    reload: Arc<ReloadTrigger>,
    telemetry: Telemetry,
}

impl<F: CheckFamily> Reconciler<F> {
    pub fn new(family: F, committer: ConfigCommitter, reload: Arc<ReloadTrigger>, metrics: &MetricsRegistry) -> Self {
        let telemetry = Telemetry::new(family.name(), metrics);
        Self {
            family,
            committer,
            reload,
            telemetry,
        }
    }

    /// Runs a single pass against `snapshot`.
    ///
    /// Services whose instance cannot be built are left out of the document. The agent is reloaded only when the
    /// file content changed.
    ///
    /// # Errors
    ///
    /// If the document cannot be encoded or committed, or the agent cannot be reloaded after a change, an error is
    /// returned.
    pub async fn reconcile(&mut self, snapshot: &RegistrySnapshot) -> Result<CommitOutcome, ReconcileError> {
        let family = self.family.name();
        self.telemetry.passes.increment(1);

        let mut instances = Vec::new();
        for record in snapshot.records() {
            let Some(project) = self.family.project_of(record) else {
                continue;
            };

            match self.family.build_instance(project, record).await {
                Ok(Some(instance)) => instances.push(instance),
                Ok(None) => {}
                Err(e) => {
                    self.telemetry.skipped_entries.increment(1);
                    warn!(family, project, service_id = %record.id, error = %e, "Skipping service for this pass.");
                }
            }
        }

        self.telemetry.instances.set(instances.len() as f64);

        let document = CheckDocument::new(instances);
        let rendered = document.render().context(Encoding { family })?;
        let outcome = self.committer.commit(&rendered).await.context(Commit { family })?;

        if outcome.is_committed() {
            self.telemetry.commits.increment(1);
            self.reload.trigger(family).await.context(Reload { family })?;
        } else {
            debug!(family, instances = document.instances().len(), "Check configuration unchanged.");
        }

        Ok(outcome)
    }

    /// Runs a pass for every new snapshot until `shutdown` is cancelled or the subscription ends.
    ///
    /// A pass already running when `shutdown` fires is allowed to finish.
    ///
    /// # Errors
    ///
    /// If a pass fails in a way the process cannot recover from, the error is returned. Other failures are logged and
    /// the next snapshot starts a fresh pass.
    pub async fn run(
        mut self, mut subscription: RegistrySubscription, shutdown: CancellationToken,
    ) -> Result<(), ReconcileError> {
        let family = self.family.name();
        info!(family, path = %self.committer.path().display(), "Reconciler started.");

        loop {
            let snapshot = select! {
                biased;

                _ = shutdown.cancelled() => break,
                maybe_snapshot = subscription.changed() => match maybe_snapshot {
                    Some(snapshot) => snapshot,
                    None => break,
                },
            };

            if let Err(e) = self.reconcile(&snapshot).await {
                if e.scope().is_fatal() {
                    error!(family, error = %e, "Reconciler failed.");
                    return Err(e);
                }
                warn!(family, error = %e, "Reconciliation pass abandoned.");
            }
        }

        info!(family, "Reconciler stopped.");
        Ok(())
    }
}
