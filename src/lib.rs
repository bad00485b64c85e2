//! # duroxide-sim
//!
//! An in-process engine that runs durable-style orchestrations to completion inside a test
//! process, without a durable backend. Orchestrations call activities, wait on timers and
//! external events, start child orchestrations and continue as new; every suspension point is
//! resolved with in-memory primitives on the tokio worker pool.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use duroxide_sim::{ActivityContext, ActivityRegistry, OrchestrationContext, OrchestrationRegistry, Runtime};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let activities = ActivityRegistry::builder()
//!     .register("Greet", |_ctx: ActivityContext, name: String| async move { Ok(format!("Hello, {name}!")) })
//!     .build();
//!
//! let orchestrations = OrchestrationRegistry::builder()
//!     .register("HelloWorld", |ctx: OrchestrationContext, name: String| async move {
//!         ctx.trace_info("greeting");
//!         ctx.schedule_activity("Greet", name).into_activity().await
//!     })
//!     .build();
//!
//! let rt = Runtime::start(activities, orchestrations).await;
//! let client = rt.client();
//! let id = client.schedule("HelloWorld", "World", None)?;
//! let outcome = client.wait_for_completion(&id).await?;
//! assert_eq!(outcome.output.as_deref(), Some("Hello, World!"));
//! rt.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Racing and fan-out
//!
//! `select2`/`select` resolve to the first ready branch and cancel the others (a losing timer
//! stops, a losing event wait unregisters). `join` waits for all branches and returns their
//! outputs in the order given.
//!
//! ## Test configuration
//!
//! [`RuntimeOptions`] carries a timer override (collapses every timer), pre-seeded event
//! payloads and a pluggable clock. Each run snapshots these when it starts and shares the
//! snapshot with its children.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Serialize, de::DeserializeOwned};
use std::sync::Arc;
use std::time::Duration;

pub mod client;
pub mod error;
pub mod futures;
pub mod logging;
pub mod runtime;

pub use client::{Client, InstanceInfo, RunOutcome, RuntimeStatus};
pub use error::{Error, FailureDetails, Result};
pub use futures::{DurableFuture, DurableOutput, JoinFuture, SelectFuture};
pub use runtime::mailbox::MailboxScope;
pub use runtime::registry::{ActivityRegistry, OrchestrationRegistry};
pub use runtime::timers::Clock;
pub use runtime::{OrchestrationStatus, Runtime, RuntimeOptions};

use crate::_typed_codec::Codec;
use crate::futures::Kind;
use crate::runtime::completions::Settled;
use crate::runtime::mailbox::MailboxKey;
use crate::runtime::timers::TimerRequest;
use crate::runtime::{RunSpec, Shared};

/// Execution id of the first run of an instance; each continue-as-new increments it.
pub const INITIAL_EXECUTION_ID: u64 = 1;

// Internal codec utilities for typed I/O (kept private; public API remains unchanged)
mod _typed_codec {
    use serde::{Serialize, de::DeserializeOwned};
    use serde_json::Value;
    pub trait Codec {
        fn encode<T: Serialize>(v: &T) -> Result<String, String>;
        fn decode<T: DeserializeOwned>(s: &str) -> Result<T, String>;
    }
    pub struct Json;
    impl Codec for Json {
        fn encode<T: Serialize>(v: &T) -> Result<String, String> {
            // Strings travel raw unless the raw text would itself parse as JSON
            match serde_json::to_value(v) {
                Ok(Value::String(s)) if serde_json::from_str::<Value>(&s).is_err() => Ok(s),
                Ok(Value::String(s)) => serde_json::to_string(&s).map_err(|e| e.to_string()),
                Ok(val) => serde_json::to_string(&val).map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            }
        }
        fn decode<T: DeserializeOwned>(s: &str) -> Result<T, String> {
            match serde_json::from_str::<T>(s) {
                Ok(v) => Ok(v),
                Err(_) => {
                    // Fallback: treat raw string as JSON string value
                    let val = Value::String(s.to_string());
                    serde_json::from_value(val).map_err(|e| e.to_string())
                }
            }
        }
    }
}

/// Encode a value with the payload codec (strings pass through unchanged).
pub fn encode_payload<T: Serialize>(value: &T) -> Result<String> {
    _typed_codec::Json::encode(value).map_err(Error::type_mismatch)
}

/// Decode a payload produced by [`encode_payload`] or written by hand.
pub fn decode_payload<T: DeserializeOwned>(payload: &str) -> Result<T> {
    _typed_codec::Json::decode(payload).map_err(Error::type_mismatch)
}

/// Retry configuration accepted by `schedule_activity_with_retry`.
///
/// The engine makes exactly one attempt regardless of the policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub first_retry_interval: Duration,
    pub backoff_coefficient_pct: u32,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, first_retry_interval: Duration) -> Self {
        Self {
            max_attempts,
            first_retry_interval,
            backoff_coefficient_pct: 100,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(1, Duration::ZERO)
    }
}

/// Context handed to activity bodies.
#[derive(Debug, Clone)]
pub struct ActivityContext {
    instance_id: String,
    execution_id: u64,
    orchestration_name: String,
    activity_name: String,
}

impl ActivityContext {
    pub(crate) fn new(
        instance_id: String,
        execution_id: u64,
        orchestration_name: String,
        activity_name: String,
    ) -> Self {
        Self {
            instance_id,
            execution_id,
            orchestration_name,
            activity_name,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn execution_id(&self) -> u64 {
        self.execution_id
    }

    pub fn orchestration_name(&self) -> &str {
        &self.orchestration_name
    }

    pub fn activity_name(&self) -> &str {
        &self.activity_name
    }

    pub fn trace_info(&self, message: impl Into<String>) {
        tracing::info!(
            target: "duroxide_sim::activity",
            instance_id = %self.instance_id,
            execution_id = self.execution_id,
            orchestration_name = %self.orchestration_name,
            activity_name = %self.activity_name,
            "{}",
            message.into()
        );
    }

    pub fn trace_warn(&self, message: impl Into<String>) {
        tracing::warn!(
            target: "duroxide_sim::activity",
            instance_id = %self.instance_id,
            execution_id = self.execution_id,
            orchestration_name = %self.orchestration_name,
            activity_name = %self.activity_name,
            "{}",
            message.into()
        );
    }

    pub fn trace_error(&self, message: impl Into<String>) {
        tracing::error!(
            target: "duroxide_sim::activity",
            instance_id = %self.instance_id,
            execution_id = self.execution_id,
            orchestration_name = %self.orchestration_name,
            activity_name = %self.activity_name,
            "{}",
            message.into()
        );
    }

    pub fn trace_debug(&self, message: impl Into<String>) {
        tracing::debug!(
            target: "duroxide_sim::activity",
            instance_id = %self.instance_id,
            execution_id = self.execution_id,
            orchestration_name = %self.orchestration_name,
            activity_name = %self.activity_name,
            "{}",
            message.into()
        );
    }
}

#[derive(Debug)]
struct RunState {
    status: OrchestrationStatus,
    output: Option<String>,
    failure: Option<FailureDetails>,
    custom_status: Option<String>,
    next_child: u64,
    successor: Option<String>,
    successor_outcome: Option<Settled>,
    // True until the run's task has returned, whatever its status says.
    active: bool,
}

struct CtxInner {
    instance_id: String,
    orchestration_name: String,
    input: String,
    parent_instance: Option<String>,
    root_instance: String,
    execution_id: u64,
    settings: Arc<RuntimeOptions>,
    rt: Arc<Shared>,
    state: Mutex<RunState>,
}

/// Handle an orchestration uses to reach every suspension point.
///
/// One context exists per run (top-level, child, or continue-as-new successor). Cloning is
/// cheap and every clone refers to the same run.
#[derive(Clone)]
pub struct OrchestrationContext {
    inner: Arc<CtxInner>,
}

impl std::fmt::Debug for OrchestrationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrchestrationContext")
            .field("instance_id", &self.inner.instance_id)
            .field("orchestration_name", &self.inner.orchestration_name)
            .field("execution_id", &self.inner.execution_id)
            .field("status", &self.status())
            .finish()
    }
}

impl OrchestrationContext {
    pub(crate) fn new(spec: RunSpec, rt: Arc<Shared>) -> Self {
        Self {
            inner: Arc::new(CtxInner {
                instance_id: spec.instance,
                orchestration_name: spec.orchestration,
                input: spec.input,
                parent_instance: spec.parent_instance,
                root_instance: spec.root_instance,
                execution_id: spec.execution_id,
                settings: spec.settings,
                rt,
                state: Mutex::new(RunState {
                    status: OrchestrationStatus::Running,
                    output: None,
                    failure: None,
                    custom_status: None,
                    next_child: 0,
                    successor: None,
                    successor_outcome: None,
                    active: true,
                }),
            }),
        }
    }

    // ===== Identity =====

    pub fn instance_id(&self) -> &str {
        &self.inner.instance_id
    }

    pub fn orchestration_name(&self) -> &str {
        &self.inner.orchestration_name
    }

    pub fn execution_id(&self) -> u64 {
        self.inner.execution_id
    }

    /// Id of the parent run for child orchestrations, `None` at top level.
    pub fn parent_instance(&self) -> Option<&str> {
        self.inner.parent_instance.as_deref()
    }

    /// Raw input of this run.
    pub fn input(&self) -> &str {
        &self.inner.input
    }

    /// Input decoded to `T`.
    pub fn get_input<T: DeserializeOwned>(&self) -> Result<T> {
        decode_payload(&self.inner.input)
    }

    /// Reads the configured clock on every call.
    pub fn current_time(&self) -> DateTime<Utc> {
        self.inner.settings.clock.now()
    }

    pub fn new_guid(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }

    pub fn set_custom_status(&self, status: impl Into<String>) {
        self.inner.state.lock().custom_status = Some(status.into());
    }

    pub fn custom_status(&self) -> Option<String> {
        self.inner.state.lock().custom_status.clone()
    }

    pub fn status(&self) -> OrchestrationStatus {
        self.inner.state.lock().status
    }

    // ===== Tracing =====

    pub fn trace_info(&self, message: impl Into<String>) {
        tracing::info!(
            target: "duroxide_sim::orchestration",
            instance_id = %self.inner.instance_id,
            execution_id = self.inner.execution_id,
            orchestration_name = %self.inner.orchestration_name,
            "{}",
            message.into()
        );
    }

    pub fn trace_warn(&self, message: impl Into<String>) {
        tracing::warn!(
            target: "duroxide_sim::orchestration",
            instance_id = %self.inner.instance_id,
            execution_id = self.inner.execution_id,
            orchestration_name = %self.inner.orchestration_name,
            "{}",
            message.into()
        );
    }

    pub fn trace_error(&self, message: impl Into<String>) {
        tracing::error!(
            target: "duroxide_sim::orchestration",
            instance_id = %self.inner.instance_id,
            execution_id = self.inner.execution_id,
            orchestration_name = %self.inner.orchestration_name,
            "{}",
            message.into()
        );
    }

    pub fn trace_debug(&self, message: impl Into<String>) {
        tracing::debug!(
            target: "duroxide_sim::orchestration",
            instance_id = %self.inner.instance_id,
            execution_id = self.inner.execution_id,
            orchestration_name = %self.inner.orchestration_name,
            "{}",
            message.into()
        );
    }

    // ===== Suspension points =====

    /// Call an activity once. Failures of any kind surface as `Error::ActivityFailed` with
    /// attempt 1.
    pub fn schedule_activity(&self, name: impl Into<String>, input: impl Into<String>) -> DurableFuture {
        DurableFuture::new(
            self.clone(),
            Kind::Activity {
                name: name.into(),
                input: input.into(),
            },
        )
    }

    pub fn schedule_activity_typed<In: Serialize>(&self, name: impl Into<String>, input: &In) -> DurableFuture {
        match encode_payload(input) {
            Ok(payload) => self.schedule_activity(name, payload),
            Err(err) => DurableFuture::failed(self.clone(), Kind::Activity { name: name.into(), input: String::new() }, err),
        }
    }

    /// Same as [`schedule_activity`](Self::schedule_activity); the policy is accepted and
    /// ignored.
    pub fn schedule_activity_with_retry(
        &self,
        name: impl Into<String>,
        input: impl Into<String>,
        policy: RetryPolicy,
    ) -> DurableFuture {
        let name = name.into();
        if policy.max_attempts > 1 {
            tracing::debug!(
                target: "duroxide_sim::runtime",
                instance_id = %self.inner.instance_id,
                activity_name = %name,
                requested_attempts = policy.max_attempts,
                "Retry policy ignored; activity runs once"
            );
        }
        self.schedule_activity(name, input)
    }

    /// Timer that fires after `delay` (or after the configured override).
    pub fn schedule_timer(&self, delay: Duration) -> DurableFuture {
        DurableFuture::new(
            self.clone(),
            Kind::Timer {
                request: TimerRequest::After(delay),
            },
        )
    }

    /// Timer that fires at `fire_at` as measured by the run's clock (or after the override).
    pub fn create_timer(&self, fire_at: DateTime<Utc>) -> DurableFuture {
        DurableFuture::new(
            self.clone(),
            Kind::Timer {
                request: TimerRequest::FireAt(fire_at),
            },
        )
    }

    /// Wait for an external event raised by the client, `send_event` or `raise_event_to`.
    pub fn schedule_wait(&self, name: impl Into<String>) -> DurableFuture {
        DurableFuture::new(self.clone(), Kind::External { name: name.into() })
    }

    /// Wait for an external event and decode its payload to `T`.
    ///
    /// Shorthand for `schedule_wait(name).into_event_typed::<T>()`; use `schedule_wait` when the
    /// wait has to take part in a `select` or `join`.
    pub fn schedule_wait_typed<T: DeserializeOwned + Send + 'static>(
        &self,
        name: impl Into<String>,
    ) -> impl std::future::Future<Output = Result<T>> + Send + 'static {
        self.schedule_wait(name).into_event_typed::<T>()
    }

    /// Run a child orchestration to completion and resolve to its output.
    ///
    /// The child gets id `<this instance>::sub::<n>` and shares this run's settings snapshot.
    /// A child failure surfaces as `Error::ActivityFailed` named after the child orchestration.
    pub fn schedule_sub_orchestration(&self, name: impl Into<String>, input: impl Into<String>) -> DurableFuture {
        let child = {
            let mut state = self.inner.state.lock();
            state.next_child += 1;
            format!("{}::sub::{}", self.inner.instance_id, state.next_child)
        };
        DurableFuture::new(
            self.clone(),
            Kind::SubOrchestration {
                name: name.into(),
                instance: child,
                input: input.into(),
            },
        )
    }

    pub fn schedule_sub_orchestration_typed<In: Serialize>(&self, name: impl Into<String>, input: &In) -> DurableFuture {
        match encode_payload(input) {
            Ok(payload) => self.schedule_sub_orchestration(name, payload),
            Err(err) => {
                let kind = Kind::SubOrchestration {
                    name: name.into(),
                    instance: String::new(),
                    input: String::new(),
                };
                DurableFuture::failed(self.clone(), kind, err)
            }
        }
    }

    /// Deliver `payload` to this run's own mailbox scope.
    pub fn send_event(&self, name: impl Into<String>, payload: impl Into<String>) {
        let name = name.into();
        let key = MailboxKey::new(self.inner.settings.mailbox_scope, &self.inner.instance_id, name.clone());
        let delivery = self.inner.rt.mailbox.send(key, payload.into());
        tracing::debug!(
            target: "duroxide_sim::runtime",
            instance_id = %self.inner.instance_id,
            event_name = %name,
            delivery = ?delivery,
            "Event sent"
        );
    }

    /// Raise an event on another live run, as `Client::raise_event` does.
    pub fn raise_event_to(&self, instance: &str, name: impl Into<String>, payload: impl Into<String>) -> Result<()> {
        let target = self
            .inner
            .rt
            .instances
            .get(instance)
            .ok_or_else(|| Error::instance_not_found(instance))?;
        target.send_event(name, payload);
        Ok(())
    }

    /// Retire this run and start a fresh run of the same orchestration with `input`.
    ///
    /// Resolves to the successor chain's final output, so the usual pattern is
    /// `return ctx.continue_as_new(next).await;`.
    pub async fn continue_as_new(&self, input: impl Into<String>) -> Result<String> {
        let rt = self.inner.rt.clone();
        let execution_id = self.inner.execution_id + 1;
        let successor_id = format!("{}::can::{}", self.inner.root_instance, execution_id);
        let successor = rt.create_context(RunSpec {
            instance: successor_id.clone(),
            orchestration: self.inner.orchestration_name.clone(),
            input: input.into(),
            parent_instance: self.inner.parent_instance.clone(),
            root_instance: self.inner.root_instance.clone(),
            execution_id,
            settings: self.inner.settings.clone(),
        })?;
        {
            let mut state = self.inner.state.lock();
            if state.status == OrchestrationStatus::Running {
                state.status = OrchestrationStatus::ContinuedAsNew;
            }
            state.successor = Some(successor_id.clone());
        }
        tracing::debug!(
            target: "duroxide_sim::runtime",
            instance_id = %self.inner.instance_id,
            successor_instance = %successor_id,
            execution_id = execution_id,
            "Continuing as new"
        );

        let settled = if self.inner.parent_instance.is_none() {
            rt.launch_tracked(successor).wait().await
        } else {
            rt.run_detached(successor).await
        };
        self.inner.state.lock().successor_outcome = Some(settled.clone());

        match settled {
            Settled::Completed(output) => Ok(output),
            Settled::Failed(details) => Err(Error::Orchestration {
                message: details.message,
            }),
            Settled::Canceled => Err(Error::canceled(format!("continued run {successor_id}"))),
        }
    }

    pub async fn continue_as_new_typed<In: Serialize>(&self, input: &In) -> Result<String> {
        let payload = encode_payload(input)?;
        self.continue_as_new(payload).await
    }

    // ===== Composition =====

    /// Resolve to the first of two futures; the loser is canceled.
    pub fn select2(&self, a: DurableFuture, b: DurableFuture) -> SelectFuture {
        SelectFuture::new(vec![a, b])
    }

    /// Resolve to the first ready future (lowest index on ties); every loser is canceled.
    pub fn select(&self, futures: Vec<DurableFuture>) -> SelectFuture {
        SelectFuture::new(futures)
    }

    /// Resolve once every future has, keeping the given order.
    pub fn join(&self, futures: Vec<DurableFuture>) -> JoinFuture {
        JoinFuture::new(futures)
    }

    // ===== Runtime-internal accessors =====

    pub(crate) fn runtime(&self) -> Arc<Shared> {
        self.inner.rt.clone()
    }

    pub(crate) fn settings(&self) -> Arc<RuntimeOptions> {
        self.inner.settings.clone()
    }

    /// Record the terminal outcome; a run that is already terminal keeps its status.
    pub(crate) fn finish(&self, result: std::result::Result<String, FailureDetails>) {
        let mut state = self.inner.state.lock();
        if state.status.is_terminal() {
            return;
        }
        match result {
            Ok(output) => {
                state.status = OrchestrationStatus::Completed;
                state.output = Some(output);
            }
            Err(details) => {
                state.status = OrchestrationStatus::Failed;
                state.failure = Some(details);
            }
        }
    }

    pub(crate) fn mark_canceled(&self) {
        let mut state = self.inner.state.lock();
        if !state.status.is_terminal() {
            state.status = OrchestrationStatus::Canceled;
        }
    }

    /// Whether the run's task is still executing. A suspended run stays active until its body
    /// returns.
    pub(crate) fn is_active(&self) -> bool {
        self.inner.state.lock().active
    }

    pub(crate) fn deactivate(&self) {
        self.inner.state.lock().active = false;
    }

    pub(crate) fn successor_outcome(&self) -> Option<Settled> {
        self.inner.state.lock().successor_outcome.clone()
    }

    pub(crate) fn info(&self) -> InstanceInfo {
        let state = self.inner.state.lock();
        InstanceInfo {
            instance_id: self.inner.instance_id.clone(),
            orchestration_name: self.inner.orchestration_name.clone(),
            execution_id: self.inner.execution_id,
            parent_instance: self.inner.parent_instance.clone(),
            status: state.status,
            output: state.output.clone(),
            failure: state.failure.clone(),
            custom_status: state.custom_status.clone(),
            successor: state.successor.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_strings_travel_raw() {
        assert_eq!(encode_payload(&"Hello, World!").unwrap(), "Hello, World!");
        assert_eq!(decode_payload::<String>("Hello, World!").unwrap(), "Hello, World!");
    }

    #[test]
    fn strings_that_look_like_json_round_trip_unchanged() {
        for original in ["\"quoted\"", "null", "42", "true", "[1,2]", "{\"a\":1}", " 7 ", ""] {
            let encoded = encode_payload(&original).unwrap();
            assert_eq!(decode_payload::<String>(&encoded).unwrap(), original, "via {encoded:?}");
        }
    }

    #[test]
    fn optional_strings_keep_some_and_none_apart() {
        let some = encode_payload(&Some("null".to_string())).unwrap();
        let none = encode_payload(&None::<String>).unwrap();
        assert_ne!(some, none);
        assert_eq!(decode_payload::<Option<String>>(&some).unwrap(), Some("null".to_string()));
        assert_eq!(decode_payload::<Option<String>>(&none).unwrap(), None);
    }

    #[test]
    fn hand_written_text_still_decodes_as_a_string() {
        assert_eq!(decode_payload::<String>("op-42").unwrap(), "op-42");
        assert_eq!(decode_payload::<u32>("42").unwrap(), 42);
        assert!(matches!(decode_payload::<u32>("forty-two"), Err(Error::TypeMismatch { .. })));
    }
}
