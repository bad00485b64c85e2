//! In-process runtime: owns the registries and the shared run state, launches runs and drives
//! them to a terminal outcome.
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, warn};

use crate::{ActivityContext, Error, FailureDetails, OrchestrationContext};

pub(crate) mod completions;
pub(crate) mod dispatch;
pub(crate) mod instances;
pub mod mailbox;
pub mod registry;
pub mod timers;

use async_trait::async_trait;
pub use completions::Settled;
use completions::{CompletionMap, PendingCompletion};
use instances::InstanceRegistry;
use mailbox::{EventMailbox, MailboxKey, MailboxScope};
pub use registry::{ActivityRegistry, OrchestrationRegistry};
use timers::Clock;

/// Default artificial delay before every activity body runs.
pub const DEFAULT_ACTIVITY_DISPATCH_DELAY: Duration = Duration::from_millis(10);

/// Configuration options for the Runtime.
///
/// Every run snapshots the options when it starts and hands the same snapshot to all of its
/// descendants, so changing a setting never affects a run already in flight.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Collapse every timer to this fixed delay regardless of the requested fire time.
    pub timer_override: Option<Duration>,
    /// Payloads buffered into the mailbox before a run starts, by event name.
    pub event_payloads: HashMap<String, String>,
    /// Source of `OrchestrationContext::current_time`.
    pub clock: Clock,
    /// Delay inserted before each activity body so concurrent races behave realistically.
    /// Default: 10ms
    pub activity_dispatch_delay: Duration,
    pub mailbox_scope: MailboxScope,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            timer_override: None,
            event_payloads: HashMap::new(),
            clock: Clock::system(),
            activity_dispatch_delay: DEFAULT_ACTIVITY_DISPATCH_DELAY,
            mailbox_scope: MailboxScope::PerInstance,
        }
    }
}

impl RuntimeOptions {
    pub fn with_timer_override(mut self, delay: Duration) -> Self {
        self.timer_override = Some(delay);
        self
    }

    pub fn with_event_payload(mut self, name: impl Into<String>, payload: impl Into<String>) -> Self {
        self.event_payloads.insert(name.into(), payload.into());
        self
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_activity_dispatch_delay(mut self, delay: Duration) -> Self {
        self.activity_dispatch_delay = delay;
        self
    }

    pub fn with_mailbox_scope(mut self, scope: MailboxScope) -> Self {
        self.mailbox_scope = scope;
        self
    }
}

/// Lifecycle of a single run as recorded on its context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestrationStatus {
    Running,
    Completed,
    Failed,
    /// Force-resolved by `Client::suspend`.
    Canceled,
    /// Retired by `continue_as_new`; the successor carries on under a new id.
    ContinuedAsNew,
}

impl OrchestrationStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, OrchestrationStatus::Running)
    }
}

/// Trait implemented by orchestration handlers that can be invoked by the runtime.
#[async_trait]
pub trait OrchestrationHandler: Send + Sync {
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> crate::Result<String>;
}

/// Function wrapper that implements `OrchestrationHandler`.
pub struct FnOrchestration<F, Fut>(pub F)
where
    F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = crate::Result<String>> + Send + 'static;

#[async_trait]
impl<F, Fut> OrchestrationHandler for FnOrchestration<F, Fut>
where
    F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = crate::Result<String>> + Send + 'static,
{
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> crate::Result<String> {
        (self.0)(ctx, input).await
    }
}

/// Trait implemented by activity handlers. Errors are plain strings; the orchestration sees
/// them wrapped as `Error::ActivityFailed`.
#[async_trait]
pub trait ActivityHandler: Send + Sync {
    async fn invoke(&self, ctx: ActivityContext, input: String) -> Result<String, String>;
}

/// Function wrapper that implements `ActivityHandler`.
pub struct FnActivity<F, Fut>(pub F)
where
    F: Fn(ActivityContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static;

#[async_trait]
impl<F, Fut> ActivityHandler for FnActivity<F, Fut>
where
    F: Fn(ActivityContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
{
    async fn invoke(&self, ctx: ActivityContext, input: String) -> Result<String, String> {
        (self.0)(ctx, input).await
    }
}

/// Identity of a run about to be created.
pub(crate) struct RunSpec {
    pub(crate) instance: String,
    pub(crate) orchestration: String,
    pub(crate) input: String,
    pub(crate) parent_instance: Option<String>,
    pub(crate) root_instance: String,
    pub(crate) execution_id: u64,
    pub(crate) settings: Arc<RuntimeOptions>,
}

/// State shared by the runtime, the client and every context.
pub(crate) struct Shared {
    pub(crate) orchestrations: OrchestrationRegistry,
    pub(crate) activities: ActivityRegistry,
    pub(crate) mailbox: EventMailbox,
    pub(crate) instances: InstanceRegistry,
    pub(crate) completions: CompletionMap,
    settings: RwLock<Arc<RuntimeOptions>>,
    tasks: Mutex<Vec<AbortHandle>>,
    shut_down: AtomicBool,
}

impl Shared {
    pub(crate) fn settings(&self) -> Arc<RuntimeOptions> {
        self.settings.read().clone()
    }

    fn update_settings(&self, f: impl FnOnce(&mut RuntimeOptions)) {
        let mut guard = self.settings.write();
        let mut next = RuntimeOptions::clone(&guard);
        f(&mut next);
        *guard = Arc::new(next);
    }

    pub(crate) fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    fn remember(&self, handle: AbortHandle) {
        let mut tasks = self.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);
    }

    /// Spawn `fut` on the shared pool; the task is aborted on shutdown.
    pub(crate) fn spawn<T: Send + 'static>(
        &self,
        fut: impl std::future::Future<Output = T> + Send + 'static,
    ) -> JoinHandle<T> {
        let handle = tokio::spawn(fut);
        self.remember(handle.abort_handle());
        handle
    }

    /// Build a context for `spec`, register it, and buffer its pre-seeded payloads.
    ///
    /// Fails with `InstanceAlreadyRunning` while an earlier run under the same id is still
    /// active. Reusing the id of a finished run drops whatever that run left in its mailbox.
    pub(crate) fn create_context(self: &Arc<Self>, spec: RunSpec) -> crate::Result<OrchestrationContext> {
        let scope = spec.settings.mailbox_scope;
        let seeds = spec.settings.event_payloads.clone();
        let ctx = OrchestrationContext::new(spec, self.clone());
        if !self.instances.try_insert(ctx.clone()) {
            return Err(Error::InstanceAlreadyRunning {
                instance: ctx.instance_id().to_string(),
            });
        }
        match scope {
            MailboxScope::PerInstance => {
                self.mailbox.clear_instance(ctx.instance_id());
                for (name, payload) in seeds {
                    self.mailbox
                        .send(MailboxKey::new(scope, ctx.instance_id(), name), payload);
                }
            }
            // Shared seeds are buffered once, when the runtime starts or the payload is set.
            MailboxScope::Shared => {}
        }
        Ok(ctx)
    }

    /// Track `ctx` as a top-level run and launch it.
    pub(crate) fn launch_tracked(self: &Arc<Self>, ctx: OrchestrationContext) -> Arc<PendingCompletion> {
        let pending = self.completions.track(ctx.instance_id());
        let shared = self.clone();
        let completion = pending.clone();
        self.spawn(async move {
            let instance = ctx.instance_id().to_string();
            let settled = shared.execute(ctx).await;
            if !completion.resolve(settled) {
                debug!(
                    target: "duroxide_sim::runtime",
                    instance_id = %instance,
                    "Run settled after its completion was already resolved (suspended)"
                );
            }
        });
        pending
    }

    /// Run `ctx` to completion on its own task and return its outcome.
    pub(crate) async fn run_detached(self: &Arc<Self>, ctx: OrchestrationContext) -> Settled {
        let shared = self.clone();
        match self.spawn(async move { shared.execute(ctx).await }).await {
            Ok(settled) => settled,
            Err(_) => Settled::Failed(FailureDetails::from(&Error::Shutdown)),
        }
    }

    /// Drive `ctx` to its outcome, then release its instance id for reuse.
    pub(crate) async fn execute(self: Arc<Self>, ctx: OrchestrationContext) -> Settled {
        let settled = self.drive(&ctx).await;
        ctx.deactivate();
        settled
    }

    /// Resolve the orchestration, invoke it and record the outcome on the context.
    async fn drive(self: &Arc<Self>, ctx: &OrchestrationContext) -> Settled {
        let name = ctx.orchestration_name().to_string();
        let instance = ctx.instance_id().to_string();

        let Some(handler) = self.orchestrations.resolve(&name) else {
            let details = FailureDetails::from(&Error::Unregistered { name: name.clone() });
            warn!(
                target: "duroxide_sim::runtime",
                instance_id = %instance,
                orchestration_name = %name,
                error = %details.message,
                "Orchestration not registered"
            );
            ctx.finish(Err(details.clone()));
            return Settled::Failed(details);
        };

        debug!(
            target: "duroxide_sim::runtime",
            instance_id = %instance,
            orchestration_name = %name,
            execution_id = ctx.execution_id(),
            parent_instance = ?ctx.parent_instance(),
            "Orchestration started"
        );
        let start = Instant::now();

        let input = ctx.input().to_string();
        let invocation = {
            let ctx = ctx.clone();
            self.spawn(async move { handler.invoke(ctx, input).await })
        };
        let result = match invocation.await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(err)) => Err(FailureDetails::from(&err)),
            Err(join_err) if join_err.is_panic() => Err(FailureDetails::from_panic(join_err.into_panic().as_ref())),
            Err(_) => Err(FailureDetails::from(&Error::Shutdown)),
        };

        // A retired run reports whatever its successor chain ended with.
        if let Some(settled) = ctx.successor_outcome() {
            return settled;
        }

        ctx.finish(result.clone());
        let duration_ms = start.elapsed().as_millis() as u64;
        match result {
            Ok(output) => {
                debug!(
                    target: "duroxide_sim::runtime",
                    instance_id = %instance,
                    orchestration_name = %name,
                    outcome = "completed",
                    duration_ms = duration_ms,
                    "Orchestration completed"
                );
                Settled::Completed(output)
            }
            Err(details) => {
                warn!(
                    target: "duroxide_sim::runtime",
                    instance_id = %instance,
                    orchestration_name = %name,
                    outcome = "failed",
                    error_category = %details.category,
                    error = %details.message,
                    duration_ms = duration_ms,
                    "Orchestration failed"
                );
                Settled::Failed(details)
            }
        }
    }
}

/// In-process runtime that runs orchestrations and activities against in-memory state.
pub struct Runtime {
    shared: Arc<Shared>,
}

impl Runtime {
    /// Start a new runtime with default options.
    pub async fn start(activities: ActivityRegistry, orchestrations: OrchestrationRegistry) -> Arc<Self> {
        Self::start_with_options(activities, orchestrations, RuntimeOptions::default()).await
    }

    /// Start a new runtime with custom options.
    pub async fn start_with_options(
        activities: ActivityRegistry,
        orchestrations: OrchestrationRegistry,
        options: RuntimeOptions,
    ) -> Arc<Self> {
        // Install a default subscriber if none set (ok to call many times)
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
            .try_init();

        let shared = Arc::new(Shared {
            orchestrations,
            activities,
            mailbox: EventMailbox::new(),
            instances: InstanceRegistry::default(),
            completions: CompletionMap::default(),
            settings: RwLock::new(Arc::new(options.clone())),
            tasks: Mutex::new(Vec::new()),
            shut_down: AtomicBool::new(false),
        });

        if options.mailbox_scope == MailboxScope::Shared {
            for (name, payload) in options.event_payloads {
                shared.mailbox.send(MailboxKey::new(MailboxScope::Shared, "", name), payload);
            }
        }

        debug!(
            target: "duroxide_sim::runtime",
            orchestrations = shared.orchestrations.count(),
            activities = shared.activities.count(),
            "Runtime started"
        );

        Arc::new(Self { shared })
    }

    /// A client bound to this runtime.
    pub fn client(&self) -> crate::Client {
        crate::Client::from_shared(self.shared.clone())
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    /// Collapse every timer of runs started from now on to `delay` (`None` restores real timers).
    pub fn set_timer_override(&self, delay: Option<Duration>) {
        self.shared.update_settings(|s| s.timer_override = delay);
    }

    /// Pre-seed a payload for `name`, consumed by the first matching wait of each later run.
    pub fn set_event_payload(&self, name: impl Into<String>, payload: impl Into<String>) {
        let name = name.into();
        let payload = payload.into();
        let scope = self.shared.settings().mailbox_scope;
        if scope == MailboxScope::Shared {
            self.shared
                .mailbox
                .send(MailboxKey::new(scope, "", name.clone()), payload.clone());
        }
        self.shared.update_settings(|s| {
            s.event_payloads.insert(name, payload);
        });
    }

    pub fn set_clock(&self, clock: Clock) {
        self.shared.update_settings(|s| s.clock = clock);
    }

    /// Stop the runtime: abort in-flight tasks, fail pending completions with `Shutdown`, and
    /// drop all instance and mailbox state.
    pub async fn shutdown(self: Arc<Self>) {
        self.shared.shut_down.store(true, Ordering::SeqCst);
        let tasks: Vec<AbortHandle> = self.shared.tasks.lock().drain(..).collect();
        let aborted = tasks.iter().filter(|t| !t.is_finished()).count();
        for t in tasks {
            t.abort();
        }
        let forced = self
            .shared
            .completions
            .drain_with(Settled::Failed(FailureDetails::from(&Error::Shutdown)));
        self.shared.instances.clear();
        self.shared.mailbox.clear();
        debug!(
            target: "duroxide_sim::runtime",
            aborted_tasks = aborted,
            forced_completions = forced,
            "Runtime shut down"
        );
    }
}
