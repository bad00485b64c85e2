#![allow(dead_code)]
#![allow(clippy::unwrap_used)]

//! Sample application shared by the integration tests: six orchestrations and the activities
//! they call, plus a tracking struct the tests inspect afterwards.

pub mod tracing_capture;

use duroxide_sim::{
    ActivityContext, ActivityRegistry, DurableOutput, OrchestrationContext, OrchestrationRegistry, Result, Runtime,
    RuntimeOptions, decode_payload,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

// ===== Models =====

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChainRequest {
    pub input_data: String,
    pub multiplier: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatedData {
    pub original_data: String,
    pub is_valid: bool,
    pub multiplier: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessedData {
    pub processed: String,
    pub value: i64,
    pub processed_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FanOutRequest {
    pub items: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessedItem {
    pub item: String,
    pub success: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AggregatedResult {
    pub total_items: usize,
    pub successful_items: usize,
    pub failed_items: usize,
    pub results: Vec<ProcessedItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterventionRequest {
    pub work_item_id: String,
    pub requester: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalEvent {
    pub approved: bool,
    pub approver: String,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InterventionResult {
    pub success: bool,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingRequest {
    pub id: String,
    pub resource: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationStatus {
    pub is_complete: bool,
    pub value: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PollingResult {
    pub success: bool,
    pub value: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParentRequest {
    pub regions: Vec<String>,
    pub data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionRequest {
    pub region: String,
    pub data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegionResult {
    pub region: String,
    pub item_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParentResult {
    pub regions_processed: usize,
    pub total_items: usize,
    pub results: Vec<RegionResult>,
}

// ===== Activities =====

/// Side effects recorded by the sample activities.
#[derive(Default)]
pub struct SampleActivities {
    started: Mutex<Vec<String>>,
    completed: Mutex<Vec<String>>,
    cancelled: Mutex<Vec<String>>,
    poll_attempts: Mutex<HashMap<String, u32>>,
}

impl SampleActivities {
    pub fn was_work_started(&self, id: &str) -> bool {
        self.started.lock().iter().any(|w| w == id)
    }

    pub fn was_work_completed(&self, id: &str) -> bool {
        self.completed.lock().iter().any(|w| w == id)
    }

    pub fn was_work_cancelled(&self, id: &str) -> bool {
        self.cancelled.lock().iter().any(|w| w == id)
    }

    /// Completes on the third check for a given id.
    fn check_status(&self, id: &str) -> OperationStatus {
        let mut attempts = self.poll_attempts.lock();
        let n = attempts.entry(id.to_string()).or_insert(0);
        *n += 1;
        if *n >= 3 {
            attempts.remove(id);
            OperationStatus {
                is_complete: true,
                value: Some(format!("Completed-{id}")),
            }
        } else {
            OperationStatus {
                is_complete: false,
                value: None,
            }
        }
    }
}

pub fn sample_activities(state: Arc<SampleActivities>) -> ActivityRegistry {
    let started = state.clone();
    let completed = state.clone();
    let cancelled = state.clone();
    let polled = state;

    ActivityRegistry::builder()
        .register_typed("ValidateActivity", |_ctx: ActivityContext, input: ChainRequest| async move {
            Ok(ValidatedData {
                is_valid: !input.input_data.trim().is_empty(),
                original_data: input.input_data,
                multiplier: input.multiplier,
            })
        })
        .register_typed("ProcessActivity", |_ctx: ActivityContext, input: ValidatedData| async move {
            if !input.is_valid {
                return Err("Invalid data".to_string());
            }
            Ok(ProcessedData {
                processed: input.original_data.to_uppercase(),
                value: input.original_data.len() as i64 * input.multiplier,
                processed_at: chrono::Utc::now(),
            })
        })
        .register_typed("SaveActivity", |_ctx: ActivityContext, input: ProcessedData| async move {
            Ok(format!("SAVED-{}-{}", input.value, uuid::Uuid::new_v4().simple()))
        })
        .register_typed("CheckStatusActivity", move |_ctx: ActivityContext, id: String| {
            let state = polled.clone();
            async move { Ok(state.check_status(&id)) }
        })
        .register_typed("StartWorkActivity", move |_ctx: ActivityContext, req: InterventionRequest| {
            let state = started.clone();
            async move {
                state.started.lock().push(req.work_item_id);
                Ok(())
            }
        })
        .register_typed("CompleteWorkActivity", move |_ctx: ActivityContext, req: InterventionRequest| {
            let state = completed.clone();
            async move {
                state.completed.lock().push(req.work_item_id);
                Ok(())
            }
        })
        .register_typed("CancelWorkActivity", move |_ctx: ActivityContext, req: InterventionRequest| {
            let state = cancelled.clone();
            async move {
                state.cancelled.lock().push(req.work_item_id);
                Ok(())
            }
        })
        .register_typed("ProcessItemActivity", |_ctx: ActivityContext, item: String| async move {
            let success = !item.to_lowercase().starts_with("fail");
            let error = (!success).then(|| format!("Item '{item}' is marked to fail"));
            Ok(ProcessedItem { item, success, error })
        })
        .register_typed("GetItemsForRegionActivity", |_ctx: ActivityContext, region: String| async move {
            let items: Vec<String> = (1..=region.len()).map(|i| format!("{region}-Item-{i}")).collect();
            Ok(items)
        })
        .register("ProcessItemsActivity", |_ctx: ActivityContext, input: String| async move {
            Ok(format!("PROCESSED:{input}"))
        })
        .build()
}

// ===== Orchestrations =====

async fn simple_activity_chain(ctx: OrchestrationContext, input: ChainRequest) -> Result<String> {
    let validated: ValidatedData = ctx
        .schedule_activity_typed("ValidateActivity", &input)
        .into_activity_typed()
        .await?;
    let processed: ProcessedData = ctx
        .schedule_activity_typed("ProcessActivity", &validated)
        .into_activity_typed()
        .await?;
    ctx.schedule_activity_typed("SaveActivity", &processed)
        .into_activity()
        .await
}

async fn fan_out_fan_in(ctx: OrchestrationContext, request: FanOutRequest) -> Result<AggregatedResult> {
    let tasks = request
        .items
        .iter()
        .map(|item| ctx.schedule_activity("ProcessItemActivity", item.clone()))
        .collect();

    let mut results = Vec::new();
    for output in ctx.join(tasks).await {
        match output {
            DurableOutput::Activity(raw) => results.push(decode_payload::<ProcessedItem>(&raw?)?),
            other => return Err(format!("unexpected output: {other:?}").into()),
        }
    }

    let successful_items = results.iter().filter(|r| r.success).count();
    Ok(AggregatedResult {
        total_items: results.len(),
        successful_items,
        failed_items: results.len() - successful_items,
        results,
    })
}

async fn manual_intervention(ctx: OrchestrationContext, request: InterventionRequest) -> Result<InterventionResult> {
    ctx.schedule_activity_typed("StartWorkActivity", &request)
        .into_activity()
        .await?;

    let approval = ctx.schedule_wait("ApprovalEvent");
    let timeout = ctx.create_timer(ctx.current_time() + chrono::Duration::hours(24));

    match ctx.select2(approval, timeout).await {
        (0, DurableOutput::External(payload)) => {
            let approval: ApprovalEvent = decode_payload(&payload?)?;
            ctx.trace_info(format!("approval received from {}", approval.approver));
            if approval.approved {
                ctx.schedule_activity_typed("CompleteWorkActivity", &request)
                    .into_activity()
                    .await?;
                return Ok(InterventionResult {
                    success: true,
                    reason: None,
                });
            }
            Ok(InterventionResult {
                success: false,
                reason: Some(approval.reason.unwrap_or_else(|| "Rejected by approver".to_string())),
            })
        }
        _ => {
            ctx.trace_warn("no approval before timeout");
            ctx.schedule_activity_typed("CancelWorkActivity", &request)
                .into_activity()
                .await?;
            Ok(InterventionResult {
                success: false,
                reason: Some("Timeout - no response received".to_string()),
            })
        }
    }
}

const MAX_POLL_ATTEMPTS: u32 = 5;

async fn timer_polling(ctx: OrchestrationContext, request: PollingRequest) -> Result<PollingResult> {
    for _ in 0..MAX_POLL_ATTEMPTS {
        let status: OperationStatus = ctx
            .schedule_activity("CheckStatusActivity", request.id.clone())
            .into_activity_typed()
            .await?;
        if status.is_complete {
            return Ok(PollingResult {
                success: true,
                value: status.value,
                error: None,
            });
        }
        ctx.create_timer(ctx.current_time() + chrono::Duration::seconds(30))
            .into_timer()
            .await?;
    }
    Ok(PollingResult {
        success: false,
        value: None,
        error: Some("Timeout after max attempts".to_string()),
    })
}

async fn sub_orchestration_parent(ctx: OrchestrationContext, request: ParentRequest) -> Result<ParentResult> {
    let children = request
        .regions
        .iter()
        .map(|region| {
            ctx.schedule_sub_orchestration_typed(
                "RegionSubOrchestrator",
                &RegionRequest {
                    region: region.clone(),
                    data: request.data.clone(),
                },
            )
        })
        .collect();

    let mut results = Vec::new();
    for output in ctx.join(children).await {
        match output {
            DurableOutput::SubOrchestration(raw) => results.push(decode_payload::<RegionResult>(&raw?)?),
            other => return Err(format!("unexpected output: {other:?}").into()),
        }
    }
    Ok(ParentResult {
        regions_processed: results.len(),
        total_items: results.iter().map(|r| r.item_count).sum(),
        results,
    })
}

async fn region_sub_orchestrator(ctx: OrchestrationContext, request: RegionRequest) -> Result<RegionResult> {
    let items: Vec<String> = ctx
        .schedule_activity("GetItemsForRegionActivity", request.region.clone())
        .into_activity_typed()
        .await?;
    ctx.schedule_activity("ProcessItemsActivity", format!("{}:{}", request.region, items.len()))
        .into_activity()
        .await?;
    Ok(RegionResult {
        region: request.region,
        item_count: items.len(),
    })
}

pub fn sample_orchestrations() -> OrchestrationRegistry {
    OrchestrationRegistry::builder()
        .register_typed("SimpleActivityChain", simple_activity_chain)
        .register_typed("FanOutFanIn", fan_out_fan_in)
        .register_typed("ManualIntervention", manual_intervention)
        .register_typed("TimerPolling", timer_polling)
        .register_typed("SubOrchestrationParent", sub_orchestration_parent)
        .register_typed("RegionSubOrchestrator", region_sub_orchestrator)
        .build()
}

/// Start a runtime hosting the sample app.
pub async fn start_sample_app(options: RuntimeOptions) -> (Arc<Runtime>, Arc<SampleActivities>) {
    let state = Arc::new(SampleActivities::default());
    let rt = Runtime::start_with_options(sample_activities(state.clone()), sample_orchestrations(), options).await;
    (rt, state)
}

/// Options with every timer collapsed to 10ms.
pub fn fast_timers() -> RuntimeOptions {
    RuntimeOptions::default().with_timer_override(Duration::from_millis(10))
}

/// Poll `check` until it holds or `timeout_ms` elapses.
pub async fn wait_until(mut check: impl FnMut() -> bool, timeout_ms: u64) -> bool {
    let deadline = std::time::Instant::now() + Duration::from_millis(timeout_ms);
    while std::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}
