use ::futures::future::{BoxFuture, FutureExt, join_all};
use serde::de::DeserializeOwned;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio_util::sync::CancellationToken;

use crate::runtime::dispatch;
use crate::runtime::timers::TimerRequest;
use crate::{Error, OrchestrationContext, Result, decode_payload};

/// Value a [`DurableFuture`] resolves to, tagged by the kind of suspension.
#[derive(Debug, Clone)]
pub enum DurableOutput {
    Activity(Result<String>),
    Timer(Result<()>),
    External(Result<String>),
    SubOrchestration(Result<String>),
}

impl DurableOutput {
    fn kind_name(&self) -> &'static str {
        match self {
            DurableOutput::Activity(_) => "activity",
            DurableOutput::Timer(_) => "timer",
            DurableOutput::External(_) => "external event",
            DurableOutput::SubOrchestration(_) => "sub-orchestration",
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) enum Kind {
    Activity { name: String, input: String },
    Timer { request: TimerRequest },
    External { name: String },
    SubOrchestration { name: String, instance: String, input: String },
}

impl Kind {
    fn output_for(&self, err: Error) -> DurableOutput {
        match self {
            Kind::Activity { .. } => DurableOutput::Activity(Err(err)),
            Kind::Timer { .. } => DurableOutput::Timer(Err(err)),
            Kind::External { .. } => DurableOutput::External(Err(err)),
            Kind::SubOrchestration { .. } => DurableOutput::SubOrchestration(Err(err)),
        }
    }
}

/// A single suspension point of an orchestration.
///
/// Nothing happens until the future is first polled (or joined into a `select`/`join`).
/// Activities and child orchestrations then run on their own tasks, so dropping the future does
/// not stop them. Timers and external waits stop when their cancellation token fires.
pub struct DurableFuture {
    ctx: OrchestrationContext,
    kind: Kind,
    cancel: CancellationToken,
    preset: Option<Error>,
    running: Option<BoxFuture<'static, DurableOutput>>,
}

impl DurableFuture {
    pub(crate) fn new(ctx: OrchestrationContext, kind: Kind) -> Self {
        Self {
            ctx,
            kind,
            cancel: CancellationToken::new(),
            preset: None,
            running: None,
        }
    }

    /// A future that resolves to `err` without doing any work.
    pub(crate) fn failed(ctx: OrchestrationContext, kind: Kind, err: Error) -> Self {
        Self {
            preset: Some(err),
            ..Self::new(ctx, kind)
        }
    }

    /// Tie this future to `token`: canceling `token` resolves a timer or external wait to
    /// `Error::Canceled`. Has no effect on activities or child orchestrations.
    pub fn with_cancellation(mut self, token: &CancellationToken) -> Self {
        self.cancel = token.child_token();
        self
    }

    /// Token that cancels this future (also fired when it loses a `select`).
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
    }

    pub(crate) fn ensure_started(&mut self) {
        if self.running.is_none() {
            self.running = Some(self.start());
        }
    }

    fn start(&mut self) -> BoxFuture<'static, DurableOutput> {
        if let Some(err) = self.preset.take() {
            return ::futures::future::ready(self.kind.output_for(err)).boxed();
        }
        let ctx = self.ctx.clone();
        let cancel = self.cancel.clone();
        match self.kind.clone() {
            Kind::Activity { name, input } => {
                let task_name = name.clone();
                let handle = self
                    .ctx
                    .runtime()
                    .spawn(async move { dispatch::dispatch_call_activity(&ctx, name, input).await });
                async move {
                    let result = handle
                        .await
                        .unwrap_or_else(|_| Err(Error::activity_failed(task_name, "activity task aborted")));
                    DurableOutput::Activity(result)
                }
                .boxed()
            }
            Kind::Timer { request } => {
                async move { DurableOutput::Timer(dispatch::dispatch_create_timer(&ctx, request, &cancel).await) }.boxed()
            }
            Kind::External { name } => {
                async move { DurableOutput::External(dispatch::dispatch_wait_external(&ctx, name, &cancel).await) }.boxed()
            }
            Kind::SubOrchestration { name, instance, input } => {
                let task_name = name.clone();
                let handle = self.ctx.runtime().spawn(async move {
                    dispatch::dispatch_start_sub_orchestration(&ctx, name, instance, input).await
                });
                async move {
                    let result = handle
                        .await
                        .unwrap_or_else(|_| Err(Error::activity_failed(task_name, "child orchestration aborted")));
                    DurableOutput::SubOrchestration(result)
                }
                .boxed()
            }
        }
    }

    // ===== Adapters =====

    pub async fn into_activity(self) -> Result<String> {
        match self.await {
            DurableOutput::Activity(r) => r,
            other => Err(mismatch("activity", &other)),
        }
    }

    pub async fn into_activity_typed<T: DeserializeOwned>(self) -> Result<T> {
        let raw = self.into_activity().await?;
        decode_payload(&raw)
    }

    pub async fn into_timer(self) -> Result<()> {
        match self.await {
            DurableOutput::Timer(r) => r,
            other => Err(mismatch("timer", &other)),
        }
    }

    pub async fn into_event(self) -> Result<String> {
        match self.await {
            DurableOutput::External(r) => r,
            other => Err(mismatch("external event", &other)),
        }
    }

    pub async fn into_event_typed<T: DeserializeOwned>(self) -> Result<T> {
        let raw = self.into_event().await?;
        decode_payload(&raw)
    }

    pub async fn into_sub_orchestration(self) -> Result<String> {
        match self.await {
            DurableOutput::SubOrchestration(r) => r,
            other => Err(mismatch("sub-orchestration", &other)),
        }
    }

    pub async fn into_sub_orchestration_typed<T: DeserializeOwned>(self) -> Result<T> {
        let raw = self.into_sub_orchestration().await?;
        decode_payload(&raw)
    }
}

fn mismatch(expected: &str, got: &DurableOutput) -> Error {
    Error::type_mismatch(format!("expected {expected} output, got {}", got.kind_name()))
}

impl Future for DurableFuture {
    type Output = DurableOutput;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        this.ensure_started();
        match this.running.as_mut() {
            Some(fut) => fut.as_mut().poll(cx),
            None => Poll::Pending,
        }
    }
}

/// First-of-N race over durable futures. Resolves to `(winner_index, output)`.
pub struct SelectFuture {
    branches: Vec<DurableFuture>,
}

impl SelectFuture {
    pub(crate) fn new(branches: Vec<DurableFuture>) -> Self {
        Self { branches }
    }
}

impl Future for SelectFuture {
    type Output = (usize, DurableOutput);

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if this.branches.is_empty() {
            return Poll::Ready((0, DurableOutput::Timer(Err(Error::canceled("select over no futures")))));
        }
        // Start every branch before looking for a winner so losing activities still run.
        for branch in this.branches.iter_mut() {
            branch.ensure_started();
        }
        for (idx, branch) in this.branches.iter_mut().enumerate() {
            if let Poll::Ready(output) = Pin::new(branch).poll(cx) {
                for (loser_idx, loser) in this.branches.iter().enumerate() {
                    if loser_idx != idx {
                        loser.cancel();
                    }
                }
                return Poll::Ready((idx, output));
            }
        }
        Poll::Pending
    }
}

/// Wait-for-all over durable futures; outputs keep the order the futures were given in.
pub struct JoinFuture(BoxFuture<'static, Vec<DurableOutput>>);

impl JoinFuture {
    pub(crate) fn new(branches: Vec<DurableFuture>) -> Self {
        Self(join_all(branches).boxed())
    }
}

impl Future for JoinFuture {
    type Output = Vec<DurableOutput>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.0.as_mut().poll(cx)
    }
}
