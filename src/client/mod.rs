use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::runtime::completions::Settled;
use crate::runtime::{RunSpec, Runtime, Shared};
use crate::{Error, FailureDetails, INITIAL_EXECUTION_ID, OrchestrationStatus, Result, decode_payload, encode_payload};

/// Externally observed status of a tracked run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeStatus {
    Running,
    Completed,
    Failed,
    Suspended,
}

/// Result of waiting on a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub instance_id: String,
    pub status: RuntimeStatus,
    pub output: Option<String>,
    pub failure: Option<FailureDetails>,
}

impl RunOutcome {
    fn running(instance_id: &str) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            status: RuntimeStatus::Running,
            output: None,
            failure: None,
        }
    }

    fn settled(instance_id: &str, settled: Settled) -> Self {
        let (status, output, failure) = match settled {
            Settled::Completed(output) => (RuntimeStatus::Completed, Some(output), None),
            Settled::Failed(details) => (RuntimeStatus::Failed, None, Some(details)),
            Settled::Canceled => (RuntimeStatus::Suspended, None, None),
        };
        Self {
            instance_id: instance_id.to_string(),
            status,
            output,
            failure,
        }
    }

    /// Decode the output of a completed run.
    pub fn output_as<T: DeserializeOwned>(&self) -> Result<T> {
        match &self.output {
            Some(raw) => decode_payload(raw),
            None => Err(Error::type_mismatch(format!(
                "instance {} has no output (status {:?})",
                self.instance_id, self.status
            ))),
        }
    }
}

/// Snapshot of a live or finished run, including child runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceInfo {
    pub instance_id: String,
    pub orchestration_name: String,
    pub execution_id: u64,
    pub parent_instance: Option<String>,
    pub status: OrchestrationStatus,
    pub output: Option<String>,
    pub failure: Option<FailureDetails>,
    pub custom_status: Option<String>,
    /// Id of the continue-as-new successor, once the run has been retired.
    pub successor: Option<String>,
}

/// Control-plane handle: start runs, wait on them, raise events, suspend/resume.
#[derive(Clone)]
pub struct Client {
    shared: Arc<Shared>,
}

impl Client {
    /// Create a client bound to a runtime.
    pub fn new(rt: &Runtime) -> Self {
        Self::from_shared(rt.shared().clone())
    }

    pub(crate) fn from_shared(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Start a run of `orchestration` and return its instance id without waiting.
    ///
    /// A fresh UUID is generated when `instance` is `None`. An unregistered name still yields an
    /// id; the run then fails with category `Unregistered`. Reusing the id of a run that is still
    /// executing (including a suspended one) fails with `InstanceAlreadyRunning`.
    pub fn schedule(&self, orchestration: &str, input: impl Into<String>, instance: Option<&str>) -> Result<String> {
        if self.shared.is_shut_down() {
            return Err(Error::Shutdown);
        }
        let instance = instance
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let ctx = self.shared.create_context(RunSpec {
            instance: instance.clone(),
            orchestration: orchestration.to_string(),
            input: input.into(),
            parent_instance: None,
            root_instance: instance.clone(),
            execution_id: INITIAL_EXECUTION_ID,
            settings: self.shared.settings(),
        })?;
        self.shared.launch_tracked(ctx);
        debug!(
            target: "duroxide_sim::runtime",
            instance_id = %instance,
            orchestration_name = %orchestration,
            "Orchestration scheduled"
        );
        Ok(instance)
    }

    /// Start a run with typed input (serialized to JSON).
    pub fn schedule_typed<In: Serialize>(&self, orchestration: &str, input: &In, instance: Option<&str>) -> Result<String> {
        let payload = encode_payload(input)?;
        self.schedule(orchestration, payload, instance)
    }

    /// Start a run under a caller-chosen instance id.
    pub async fn start_orchestration(&self, instance: &str, orchestration: &str, input: impl Into<String>) -> Result<()> {
        self.schedule(orchestration, input, Some(instance)).map(|_| ())
    }

    /// Wait until the run settles as Completed, Failed or Suspended.
    pub async fn wait_for_completion(&self, instance: &str) -> Result<RunOutcome> {
        let pending = self
            .shared
            .completions
            .get(instance)
            .ok_or_else(|| Error::instance_not_found(instance))?;
        let settled = pending.wait().await;
        Ok(RunOutcome::settled(instance, settled))
    }

    /// Like [`wait_for_completion`](Self::wait_for_completion) but gives up after `timeout`.
    pub async fn wait_for_completion_timeout(&self, instance: &str, timeout: Duration) -> Result<RunOutcome> {
        match tokio::time::timeout(timeout, self.wait_for_completion(instance)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(Error::Timeout {
                instance: instance.to_string(),
            }),
        }
    }

    /// Succeeds as soon as the run is tracked, reporting `Running`.
    pub async fn wait_for_start(&self, instance: &str) -> Result<RunOutcome> {
        if self.shared.completions.contains(instance) {
            Ok(RunOutcome::running(instance))
        } else {
            Err(Error::instance_not_found(instance))
        }
    }

    /// Deliver an event to a live run (top-level or child). Buffered if the run is not waiting.
    pub async fn raise_event(&self, instance: &str, event_name: impl Into<String>, payload: impl Into<String>) -> Result<()> {
        let ctx = self
            .shared
            .instances
            .get(instance)
            .ok_or_else(|| Error::instance_not_found(instance))?;
        ctx.send_event(event_name, payload);
        Ok(())
    }

    /// Force the run's observed outcome to `Suspended`. Work already in flight keeps running.
    pub async fn suspend(&self, instance: &str, reason: impl Into<String>) -> Result<()> {
        let pending = self
            .shared
            .completions
            .get(instance)
            .ok_or_else(|| Error::instance_not_found(instance))?;
        let applied = pending.resolve(Settled::Canceled);
        if applied {
            if let Some(ctx) = self.shared.instances.get(instance) {
                ctx.mark_canceled();
            }
        }
        debug!(
            target: "duroxide_sim::runtime",
            instance_id = %instance,
            reason = %reason.into(),
            applied = applied,
            "Suspend requested"
        );
        Ok(())
    }

    /// No-op for known runs.
    pub async fn resume(&self, instance: &str, reason: impl Into<String>) -> Result<()> {
        if !self.shared.completions.contains(instance) && !self.shared.instances.contains(instance) {
            return Err(Error::instance_not_found(instance));
        }
        debug!(target: "duroxide_sim::runtime", instance_id = %instance, reason = %reason.into(), "Resume requested");
        Ok(())
    }

    /// Wait for every tracked top-level run, including successors started while waiting.
    pub async fn wait_for_all(&self) -> Vec<RunOutcome> {
        let mut outcomes: Vec<RunOutcome> = Vec::new();
        loop {
            let ids = self.shared.completions.ids();
            if ids.len() <= outcomes.len() {
                return outcomes;
            }
            for id in &ids[outcomes.len()..] {
                let outcome = match self.shared.completions.get(id) {
                    Some(pending) => RunOutcome::settled(id, pending.wait().await),
                    None => RunOutcome::settled(id, Settled::Failed(FailureDetails::from(&Error::Shutdown))),
                };
                outcomes.push(outcome);
            }
        }
    }

    /// Ids of tracked top-level runs (including continue-as-new successors), in start order.
    pub fn list_instances(&self) -> Vec<String> {
        self.shared.completions.ids()
    }

    /// Ids of every run ever created, children included, in creation order.
    pub fn list_all_instances(&self) -> Vec<String> {
        self.shared.instances.ids()
    }

    pub fn get_instance_info(&self, instance: &str) -> Result<InstanceInfo> {
        self.shared
            .instances
            .get(instance)
            .map(|ctx| ctx.info())
            .ok_or_else(|| Error::instance_not_found(instance))
    }
}
