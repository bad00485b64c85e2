//! Resolution of the suspension points an orchestration can await.
//!
//! Each function runs when the corresponding `DurableFuture` is first polled and produces the
//! value that future resolves to.
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::completions::Settled;
use super::mailbox::MailboxKey;
use super::timers::{TimerRequest, sleep_or_cancel};
use super::{RunSpec, Shared};
use crate::{ActivityContext, Error, OrchestrationContext, Result};

pub(crate) async fn dispatch_call_activity(ctx: &OrchestrationContext, name: String, input: String) -> Result<String> {
    let rt = ctx.runtime();
    let settings = ctx.settings();
    let instance = ctx.instance_id().to_string();

    // Yield before the body runs so timer/event races see a realistic interleaving.
    tokio::time::sleep(settings.activity_dispatch_delay).await;

    let Some(handler) = rt.activities.resolve(&name) else {
        debug!(target: "duroxide_sim::runtime", instance_id = %instance, activity_name = %name, "Activity not registered");
        return Err(Error::activity_failed(&name, format!("unregistered:{name}")));
    };

    let activity_ctx = ActivityContext::new(
        instance.clone(),
        ctx.execution_id(),
        ctx.orchestration_name().to_string(),
        name.clone(),
    );
    debug!(target: "duroxide_sim::runtime", instance_id = %instance, activity_name = %name, "Activity started");
    let start_time = Instant::now();

    let joined = rt.spawn(async move { handler.invoke(activity_ctx, input).await }).await;
    let duration_ms = start_time.elapsed().as_millis() as u64;
    let result = match joined {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(cause)) => Err(Error::activity_failed(&name, cause)),
        Err(e) if e.is_panic() => {
            let details = crate::FailureDetails::from_panic(e.into_panic().as_ref());
            Err(Error::activity_failed(&name, details.message))
        }
        Err(_) => Err(Error::activity_failed(&name, "activity task aborted")),
    };
    debug!(
        target: "duroxide_sim::runtime",
        instance_id = %instance,
        activity_name = %name,
        outcome = if result.is_ok() { "success" } else { "failed" },
        duration_ms = duration_ms,
        "Activity finished"
    );
    result
}

pub(crate) async fn dispatch_create_timer(
    ctx: &OrchestrationContext,
    request: TimerRequest,
    cancel: &CancellationToken,
) -> Result<()> {
    let settings = ctx.settings();
    let delay = request.effective_delay(settings.timer_override, &settings.clock);
    debug!(
        target: "duroxide_sim::runtime",
        instance_id = %ctx.instance_id(),
        delay_ms = delay.as_millis() as u64,
        overridden = settings.timer_override.is_some(),
        "Timer scheduled"
    );
    sleep_or_cancel(delay, cancel).await
}

pub(crate) async fn dispatch_wait_external(
    ctx: &OrchestrationContext,
    name: String,
    cancel: &CancellationToken,
) -> Result<String> {
    let key = MailboxKey::new(ctx.settings().mailbox_scope, ctx.instance_id(), name.clone());
    debug!(target: "duroxide_sim::runtime", instance_id = %ctx.instance_id(), event_name = %name, "Waiting for external event");
    ctx.runtime().mailbox.wait(key, cancel).await
}

pub(crate) async fn dispatch_start_sub_orchestration(
    ctx: &OrchestrationContext,
    name: String,
    child_instance: String,
    input: String,
) -> Result<String> {
    let rt: Arc<Shared> = ctx.runtime();
    let child = rt.create_context(RunSpec {
        instance: child_instance.clone(),
        orchestration: name.clone(),
        input,
        parent_instance: Some(ctx.instance_id().to_string()),
        root_instance: child_instance.clone(),
        execution_id: crate::INITIAL_EXECUTION_ID,
        settings: ctx.settings(),
    })
    .map_err(|err| Error::activity_failed(&name, err.to_string()))?;
    debug!(
        target: "duroxide_sim::runtime",
        instance_id = %ctx.instance_id(),
        orchestration_name = %name,
        child_instance = %child_instance,
        "Starting child orchestration"
    );
    match rt.run_detached(child).await {
        Settled::Completed(output) => Ok(output),
        Settled::Failed(details) => Err(Error::activity_failed(&name, details.message)),
        Settled::Canceled => Err(Error::activity_failed(&name, "child orchestration canceled")),
    }
}
