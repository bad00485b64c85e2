use duroxide_sim::{
    ActivityContext, ActivityRegistry, DurableOutput, OrchestrationContext, OrchestrationRegistry, Runtime,
    RuntimeOptions,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

fn activities(slow_finished: Arc<AtomicBool>) -> ActivityRegistry {
    ActivityRegistry::builder()
        .register("Fast", |_ctx: ActivityContext, input: String| async move { Ok(format!("fast:{input}")) })
        .register("Slow", move |_ctx: ActivityContext, input: String| {
            let finished = slow_finished.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                finished.store(true, Ordering::SeqCst);
                Ok(format!("slow:{input}"))
            }
        })
        .build()
}

fn orchestrations() -> OrchestrationRegistry {
    OrchestrationRegistry::builder()
        .register("ActivityBeatsTimer", |ctx: OrchestrationContext, _input: String| async move {
            let work = ctx.schedule_activity("Fast", "a");
            let timer = ctx.schedule_timer(Duration::from_secs(60));
            let (idx, output) = ctx.select2(work, timer).await;
            match output {
                DurableOutput::Activity(r) => Ok(format!("{idx}:{}", r?)),
                other => Err(format!("unexpected {other:?}").into()),
            }
        })
        .register("TimerBeatsActivity", |ctx: OrchestrationContext, _input: String| async move {
            let work = ctx.schedule_activity("Slow", "b");
            let timer = ctx.schedule_timer(Duration::from_millis(5));
            let (idx, _) = ctx.select2(work, timer).await;
            Ok(idx.to_string())
        })
        .register("TieGoesToFirst", |ctx: OrchestrationContext, _input: String| async move {
            ctx.send_event("A", "a");
            ctx.send_event("B", "b");
            let (idx, output) = ctx.select(vec![ctx.schedule_wait("A"), ctx.schedule_wait("B")]).await;
            match output {
                DurableOutput::External(r) => Ok(format!("{idx}:{}", r?)),
                other => Err(format!("unexpected {other:?}").into()),
            }
        })
        .register("EmptySelect", |ctx: OrchestrationContext, _input: String| async move {
            let (_, output) = ctx.select(Vec::new()).await;
            match output {
                DurableOutput::Timer(Err(e)) if e.is_canceled() => Ok("canceled".to_string()),
                other => Err(format!("unexpected {other:?}").into()),
            }
        })
        .register("JoinMixed", |ctx: OrchestrationContext, _input: String| async move {
            let outputs = ctx
                .join(vec![
                    ctx.schedule_activity("Slow", "1"),
                    ctx.schedule_timer(Duration::from_millis(1)),
                    ctx.schedule_activity("Fast", "2"),
                ])
                .await;
            let mut parts = Vec::new();
            for output in outputs {
                match output {
                    DurableOutput::Activity(r) => parts.push(r?),
                    DurableOutput::Timer(r) => {
                        r?;
                        parts.push("timer".to_string());
                    }
                    other => return Err(format!("unexpected {other:?}").into()),
                }
            }
            Ok(parts.join(","))
        })
        .build()
}

async fn run(orchestration: &str) -> (Option<String>, Arc<AtomicBool>) {
    let slow_finished = Arc::new(AtomicBool::new(false));
    let rt = Runtime::start_with_options(
        activities(slow_finished.clone()),
        orchestrations(),
        RuntimeOptions::default(),
    )
    .await;
    let client = rt.client();
    let id = client.schedule(orchestration, "", None).unwrap();
    let outcome = client
        .wait_for_completion_timeout(&id, Duration::from_secs(5))
        .await
        .unwrap();
    assert!(outcome.failure.is_none(), "{:?}", outcome.failure);
    if orchestration == "TimerBeatsActivity" {
        // The losing activity keeps running on its own task.
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    rt.shutdown().await;
    (outcome.output, slow_finished)
}

#[tokio::test]
async fn activity_wins_against_a_long_timer() {
    let (output, _) = run("ActivityBeatsTimer").await;
    assert_eq!(output.as_deref(), Some("0:fast:a"));
}

#[tokio::test]
async fn timer_wins_and_losing_activity_still_completes() {
    let (output, slow_finished) = run("TimerBeatsActivity").await;
    assert_eq!(output.as_deref(), Some("1"));
    assert!(slow_finished.load(Ordering::SeqCst));
}

#[tokio::test]
async fn simultaneous_readiness_picks_the_lowest_index() {
    let (output, _) = run("TieGoesToFirst").await;
    assert_eq!(output.as_deref(), Some("0:a"));
}

#[tokio::test]
async fn select_over_nothing_is_canceled() {
    let (output, _) = run("EmptySelect").await;
    assert_eq!(output.as_deref(), Some("canceled"));
}

#[tokio::test]
async fn join_keeps_the_given_order() {
    let (output, _) = run("JoinMixed").await;
    assert_eq!(output.as_deref(), Some("slow:1,timer,fast:2"));
}
