use super::*;
use crate::approval::{ApprovalDecision, ApprovalNotifier, ApprovalRequest};
use crate::capability::{
    ApprovalRule, Capability, CapabilityError, CapabilityMeta, InvocationContext,
};
use crate::events::ChannelProgressSink;
use crate::pool::WorkItem;
use crate::types::{ArgValue, Step, APPROVAL_DENIED, BLOCKED_BY_FAILED, BLOCKED_BY_SKIPPED};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicUsize, Ordering};

struct StaticCapability {
    name: &'static str,
    value: Value,
    calls: Arc<AtomicUsize>,
    meta: Option<CapabilityMeta>,
}

impl StaticCapability {
    fn new(name: &'static str, value: Value) -> Self {
        Self {
            name,
            value,
            calls: Arc::new(AtomicUsize::new(0)),
            meta: None,
        }
    }

    fn with_metadata(mut self, meta: CapabilityMeta) -> Self {
        self.meta = Some(meta);
        self
    }
}

#[async_trait]
impl Capability for StaticCapability {
    fn name(&self) -> &str {
        self.name
    }

    fn metadata(&self) -> CapabilityMeta {
        self.meta
            .clone()
            .unwrap_or_else(|| CapabilityMeta::new(self.name, ""))
    }

    async fn invoke(&self, _args: Value, _ctx: InvocationContext) -> Result<Value, CapabilityError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.value.clone())
    }
}

/// Returns its arguments; optionally gated.
struct EchoCapability {
    name: &'static str,
    approval: ApprovalRule,
    calls: Arc<AtomicUsize>,
}

impl EchoCapability {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            approval: ApprovalRule::Never,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn gated(name: &'static str) -> Self {
        Self {
            approval: ApprovalRule::Always,
            ..Self::new(name)
        }
    }
}

#[async_trait]
impl Capability for EchoCapability {
    fn name(&self) -> &str {
        self.name
    }

    fn metadata(&self) -> CapabilityMeta {
        CapabilityMeta::new(self.name, "").with_approval(self.approval.clone())
    }

    async fn invoke(&self, args: Value, _ctx: InvocationContext) -> Result<Value, CapabilityError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(args)
    }
}

struct FailingCapability;

#[async_trait]
impl Capability for FailingCapability {
    fn name(&self) -> &str {
        "explode"
    }

    async fn invoke(&self, _args: Value, _ctx: InvocationContext) -> Result<Value, CapabilityError> {
        tokio::time::sleep(Duration::from_millis(10)).await;
        Err(CapabilityError::failed("disk on fire"))
    }
}

struct SlowCapability {
    name: &'static str,
    delay: Duration,
    cooperative: bool,
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl SlowCapability {
    fn new(name: &'static str, delay_ms: u64) -> Self {
        Self {
            name,
            delay: Duration::from_millis(delay_ms),
            cooperative: true,
            active: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn stubborn(mut self) -> Self {
        self.cooperative = false;
        self
    }
}

#[async_trait]
impl Capability for SlowCapability {
    fn name(&self) -> &str {
        self.name
    }

    async fn invoke(&self, args: Value, ctx: InvocationContext) -> Result<Value, CapabilityError> {
        let current = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(current, Ordering::SeqCst);
        let outcome = if self.cooperative {
            tokio::select! {
                _ = tokio::time::sleep(self.delay) => Ok(json!({"done": args})),
                _ = ctx.cancelled() => Err(CapabilityError::Cancelled),
            }
        } else {
            tokio::time::sleep(self.delay).await;
            Ok(json!({"done": args}))
        };
        self.active.fetch_sub(1, Ordering::SeqCst);
        outcome
    }
}

/// Hangs past its timeout for the first `hangs` calls.
struct HangingCapability {
    hangs: usize,
    calls: AtomicUsize,
}

#[async_trait]
impl Capability for HangingCapability {
    fn name(&self) -> &str {
        "fetch"
    }

    async fn invoke(&self, _args: Value, _ctx: InvocationContext) -> Result<Value, CapabilityError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.hangs {
            tokio::time::sleep(Duration::from_secs(10)).await;
        }
        Ok(json!({"call": call}))
    }
}

struct BatchResize;

#[async_trait]
impl Capability for BatchResize {
    fn name(&self) -> &str {
        "batch_resize"
    }

    async fn invoke(&self, args: Value, ctx: InvocationContext) -> Result<Value, CapabilityError> {
        let items = args["images"]
            .as_array()
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .map(|image| WorkItem::new("resize", json!({ "image": image })))
            .collect();
        let aggregated = ctx.fan_out(items, 2).await?;
        Ok(aggregated.to_value())
    }
}

struct ForwardNotifier(mpsc::UnboundedSender<ApprovalRequest>);

#[async_trait]
impl ApprovalNotifier for ForwardNotifier {
    async fn notify(&self, request: ApprovalRequest) -> Result<(), String> {
        self.0.send(request).map_err(|err| err.to_string())
    }
}

/// Gate whose requests are answered by `decide` from a background task.
fn deciding_gate<F>(decide: F) -> Arc<ApprovalGate>
where
    F: Fn(&ApprovalRequest) -> ApprovalDecision + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<ApprovalRequest>();
    let gate = Arc::new(ApprovalGate::new().with_notifier(Arc::new(ForwardNotifier(tx))));
    let responder = Arc::downgrade(&gate);
    tokio::spawn(async move {
        while let Some(request) = rx.recv().await {
            let Some(gate) = responder.upgrade() else {
                break;
            };
            let decision = decide(&request);
            gate.resolve(&request.task_id, &request.step_id, decision)
                .await
                .unwrap();
        }
    });
    gate
}

fn registry(capabilities: Vec<Arc<dyn Capability>>) -> Arc<CapabilityRegistry> {
    let mut registry = CapabilityRegistry::new();
    for capability in capabilities {
        registry.register(capability);
    }
    Arc::new(registry)
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy::new(3, Duration::from_millis(5), Duration::from_millis(20))
}

async fn run_collect(
    scheduler: &Scheduler,
    plan: &Plan,
    cancel: CancellationToken,
) -> (RunSummary, Vec<ProgressEvent>) {
    let (sink, mut rx) = ChannelProgressSink::new(4096);
    let summary = scheduler.run(plan, cancel, &sink).await.unwrap();
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let ExecutionEvent::Step(event) = event {
            events.push(event);
        }
    }
    (summary, events)
}

fn position(events: &[ProgressEvent], step: &str, status: StepStatus) -> usize {
    events
        .iter()
        .position(|event| event.step_id == step && event.status == status && event.message.is_none())
        .unwrap_or_else(|| panic!("no {} event for {}", status, step))
}

fn statuses_of(events: &[ProgressEvent], step: &str) -> Vec<StepStatus> {
    events
        .iter()
        .filter(|event| event.step_id == step)
        .map(|event| event.status)
        .collect()
}

#[tokio::test]
async fn test_photo_fan_out_respects_ceiling_and_dependencies() {
    let process = SlowCapability::new("process_image", 30);
    let peak = process.peak.clone();
    let registry = registry(vec![
        Arc::new(StaticCapability::new(
            "list_directory",
            json!({"files": ["1.jpg", "2.jpg", "3.jpg", "4.jpg", "5.jpg"]}),
        )),
        Arc::new(process),
        Arc::new(StaticCapability::new("verify", json!({"ok": true}))),
    ]);
    let scheduler = Scheduler::new(registry, Arc::new(ApprovalGate::new())).with_max_parallel(3);

    let mut steps = vec![Step::new("a", "list_directory")
        .with_arg("path", ArgValue::literal("photos"))];
    let mut image_steps = Vec::new();
    for i in 0..5 {
        let id = format!("b{}", i + 1);
        image_steps.push(StepId::from(id.as_str()));
        steps.push(
            Step::new(id.as_str(), "process_image")
                .with_arg("image", ArgValue::output_at("a", format!("/files/{}", i)))
                .with_depends_on(vec!["a".into()]),
        );
    }
    steps.push(Step::new("c", "verify").with_depends_on(image_steps));
    let plan = Plan::new("photos", "process photos", steps);

    let (summary, events) = run_collect(&scheduler, &plan, CancellationToken::new()).await;

    assert_eq!(summary.status, RunStatus::Completed);
    assert!(peak.load(Ordering::SeqCst) <= 3);

    let dispatch_order: Vec<String> = events
        .iter()
        .filter(|event| event.status == StepStatus::Running)
        .map(|event| event.step_id.to_string())
        .collect();
    assert_eq!(dispatch_order, vec!["a", "b1", "b2", "b3", "b4", "b5", "c"]);

    assert!(position(&events, "a", StepStatus::Completed) < position(&events, "b1", StepStatus::Running));
    let first_b_done = ["b1", "b2", "b3"]
        .iter()
        .map(|id| position(&events, id, StepStatus::Completed))
        .min()
        .unwrap();
    assert!(position(&events, "b4", StepStatus::Running) > first_b_done);
    let last_b_done = ["b1", "b2", "b3", "b4", "b5"]
        .iter()
        .map(|id| position(&events, id, StepStatus::Completed))
        .max()
        .unwrap();
    assert!(position(&events, "c", StepStatus::Running) > last_b_done);

    let b2 = summary.step("b2").unwrap().result.clone().unwrap();
    assert_eq!(b2.value, Some(json!({"done": {"image": "2.jpg"}})));
}

#[tokio::test]
async fn test_approval_denial_skips_without_invoking() {
    let delete = EchoCapability::gated("delete_file");
    let calls = delete.calls.clone();
    let registry = registry(vec![
        Arc::new(StaticCapability::new("list_directory", json!({"files": []}))),
        Arc::new(delete),
        Arc::new(EchoCapability::new("report")),
    ]);
    let gate = deciding_gate(|_| ApprovalDecision::deny("not today"));
    let scheduler = Scheduler::new(registry, gate);

    let plan = Plan::new(
        "cleanup",
        "",
        vec![
            Step::new("list", "list_directory"),
            Step::new("tidy", "delete_file")
                .with_arg("path", ArgValue::literal("dup.jpg"))
                .with_depends_on(vec!["list".into()]),
            Step::new("after", "report").with_depends_on(vec!["tidy".into()]),
            Step::new("report", "report"),
        ],
    );
    let (summary, events) = run_collect(&scheduler, &plan, CancellationToken::new()).await;

    assert_eq!(summary.status, RunStatus::CompletedWithSkips);
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    let tidy = summary.step("tidy").unwrap();
    assert_eq!(tidy.status, StepStatus::Skipped);
    let result = tidy.result.as_ref().unwrap();
    assert!(!result.ok);
    assert_eq!(result.error_message(), Some(APPROVAL_DENIED));

    let after = summary.step("after").unwrap();
    assert_eq!(after.status, StepStatus::Skipped);
    assert_eq!(after.result.as_ref().unwrap().error_message(), Some(BLOCKED_BY_SKIPPED));
    assert_eq!(summary.step("report").unwrap().status, StepStatus::Completed);

    assert_eq!(
        statuses_of(&events, "tidy"),
        vec![
            StepStatus::Blocked,
            StepStatus::Ready,
            StepStatus::Running,
            StepStatus::Suspended,
            StepStatus::Skipped
        ]
    );
}

#[tokio::test]
async fn test_denied_optional_step_does_not_block_dependents() {
    let registry = registry(vec![
        Arc::new(EchoCapability::gated("share")),
        Arc::new(EchoCapability::new("notify")),
    ]);
    let gate = deciding_gate(|_| ApprovalDecision::deny("no"));
    let scheduler = Scheduler::new(registry, gate);
    let plan = Plan::new(
        "t",
        "",
        vec![
            Step::new("share", "share").optional(),
            Step::new("notify", "notify").with_depends_on(vec!["share".into()]),
        ],
    );
    let (summary, _) = run_collect(&scheduler, &plan, CancellationToken::new()).await;
    assert_eq!(summary.status, RunStatus::CompletedWithSkips);
    assert_eq!(summary.step("notify").unwrap().status, StepStatus::Completed);
}

#[tokio::test]
async fn test_approval_with_replacement_args_resumes_step() {
    let registry = registry(vec![Arc::new(EchoCapability::gated("write_file"))]);
    let gate = deciding_gate(|_| {
        let mut args = Map::new();
        args.insert("path".into(), json!("safe.txt"));
        ApprovalDecision::approve_with(args).with_note("renamed")
    });
    let scheduler = Scheduler::new(registry, gate);
    let plan = Plan::new(
        "t",
        "",
        vec![Step::new("w", "write_file").with_arg("path", ArgValue::literal("/etc/passwd"))],
    );
    let (summary, events) = run_collect(&scheduler, &plan, CancellationToken::new()).await;

    assert_eq!(summary.status, RunStatus::Completed);
    let result = summary.step("w").unwrap().result.clone().unwrap();
    assert_eq!(result.value, Some(json!({"path": "safe.txt"})));
    assert_eq!(
        statuses_of(&events, "w"),
        vec![
            StepStatus::Ready,
            StepStatus::Running,
            StepStatus::Suspended,
            StepStatus::Running,
            StepStatus::Completed
        ]
    );
}

#[tokio::test]
async fn test_step_awaiting_approval_does_not_hold_a_run_slot() {
    let compress = SlowCapability::new("compress", 60);
    let peak = compress.peak.clone();
    let registry = registry(vec![
        Arc::new(EchoCapability::gated("publish")),
        Arc::new(compress),
    ]);
    let gate = deciding_gate(|_| ApprovalDecision::approve());
    let scheduler = Scheduler::new(registry, gate).with_max_parallel(1);

    let plan = Plan::new(
        "release",
        "",
        vec![
            Step::new("publish", "publish").with_arg("tag", ArgValue::literal("v1")),
            Step::new("compress", "compress"),
        ],
    );
    let (summary, events) = run_collect(&scheduler, &plan, CancellationToken::new()).await;

    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(peak.load(Ordering::SeqCst), 1);
    assert_eq!(
        statuses_of(&events, "publish"),
        vec![
            StepStatus::Ready,
            StepStatus::Running,
            StepStatus::Suspended,
            StepStatus::Running,
            StepStatus::Completed
        ]
    );

    // The independent step starts while publish waits on the gate.
    let suspended = position(&events, "publish", StepStatus::Suspended);
    let compress_running = position(&events, "compress", StepStatus::Running);
    assert!(compress_running > suspended);

    // Once approved, publish waits for the slot compress holds.
    let resumed = events
        .iter()
        .enumerate()
        .filter(|(_, event)| event.step_id == "publish" && event.status == StepStatus::Running)
        .map(|(index, _)| index)
        .nth(1)
        .unwrap();
    assert!(resumed > position(&events, "compress", StepStatus::Completed));
}

#[tokio::test]
async fn test_timeout_twice_then_succeeds_within_retry_bound() {
    let registry = registry(vec![Arc::new(HangingCapability {
        hangs: 2,
        calls: AtomicUsize::new(0),
    })]);
    let scheduler =
        Scheduler::new(registry, Arc::new(ApprovalGate::new())).with_retry_policy(fast_retry());
    let plan = Plan::new(
        "t",
        "",
        vec![Step::new("f", "fetch").with_timeout_ms(40)],
    );
    let (summary, events) = run_collect(&scheduler, &plan, CancellationToken::new()).await;

    let report = summary.step("f").unwrap();
    assert_eq!(report.status, StepStatus::Completed);
    let result = report.result.as_ref().unwrap();
    assert_eq!(result.attempts, 3);
    assert_eq!(result.value, Some(json!({"call": 3})));
    assert!(result.duration_ms >= 80, "duration {}ms", result.duration_ms);

    let retry_notes = events
        .iter()
        .filter(|event| event.step_id == "f" && event.message.is_some())
        .filter(|event| event.status == StepStatus::Running)
        .count();
    assert_eq!(retry_notes, 2);
}

#[tokio::test]
async fn test_timeout_exhausting_retries_fails_as_transient() {
    let registry = registry(vec![Arc::new(HangingCapability {
        hangs: 5,
        calls: AtomicUsize::new(0),
    })]);
    let scheduler =
        Scheduler::new(registry, Arc::new(ApprovalGate::new())).with_retry_policy(fast_retry());
    let plan = Plan::new("t", "", vec![Step::new("f", "fetch").with_timeout_ms(20)]);
    let (summary, _) = run_collect(&scheduler, &plan, CancellationToken::new()).await;

    assert_eq!(summary.status, RunStatus::Failed);
    let result = summary.step("f").unwrap().result.clone().unwrap();
    assert_eq!(result.attempts, 3);
    assert_eq!(result.error.unwrap().kind, ErrorKind::Transient);
}

#[tokio::test]
async fn test_failed_step_leaves_independent_branches_alone() {
    let registry = registry(vec![
        Arc::new(FailingCapability),
        Arc::new(EchoCapability::new("echo")),
    ]);
    let scheduler = Scheduler::new(registry, Arc::new(ApprovalGate::new()));
    let plan = Plan::new(
        "t",
        "",
        vec![
            Step::new("a", "explode"),
            Step::new("a2", "echo").with_depends_on(vec!["a".into()]),
            Step::new("a3", "echo").with_depends_on(vec!["a2".into()]),
            Step::new("b", "echo"),
            Step::new("b2", "echo").with_depends_on(vec!["b".into()]),
        ],
    );
    let (summary, _) = run_collect(&scheduler, &plan, CancellationToken::new()).await;

    assert_eq!(summary.status, RunStatus::Failed);
    assert_eq!(summary.step("a").unwrap().status, StepStatus::Failed);
    let a2 = summary.step("a2").unwrap();
    assert_eq!(a2.status, StepStatus::Skipped);
    assert_eq!(a2.result.as_ref().unwrap().error_message(), Some(BLOCKED_BY_FAILED));
    assert_eq!(summary.step("a3").unwrap().status, StepStatus::Skipped);
    assert_eq!(summary.step("b").unwrap().status, StepStatus::Completed);
    assert_eq!(summary.step("b2").unwrap().status, StepStatus::Completed);
}

#[tokio::test]
async fn test_critical_failure_aborts_not_started_steps() {
    let echo = EchoCapability::new("echo");
    let calls = echo.calls.clone();
    let registry = registry(vec![Arc::new(FailingCapability), Arc::new(echo)]);
    let scheduler = Scheduler::new(registry, Arc::new(ApprovalGate::new())).with_max_parallel(1);
    let plan = Plan::new(
        "t",
        "",
        vec![
            Step::new("a", "explode").critical(),
            Step::new("b", "echo"),
            Step::new("c", "echo").with_depends_on(vec!["b".into()]),
        ],
    );
    let (summary, _) = run_collect(&scheduler, &plan, CancellationToken::new()).await;

    assert_eq!(summary.status, RunStatus::Failed);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    for id in ["b", "c"] {
        let report = summary.step(id).unwrap();
        assert_eq!(report.status, StepStatus::Skipped);
        assert_eq!(report.result.as_ref().unwrap().error_message(), Some(RUN_ABORTED));
    }
}

#[tokio::test]
async fn test_critical_failure_cancels_in_flight_steps() {
    let registry = registry(vec![
        Arc::new(FailingCapability),
        Arc::new(SlowCapability::new("crunch", 5_000)),
    ]);
    let scheduler = Scheduler::new(registry, Arc::new(ApprovalGate::new()))
        .with_max_parallel(2)
        .with_cancel_grace(Duration::from_secs(1));
    let plan = Plan::new(
        "t",
        "",
        vec![
            Step::new("a", "explode").critical(),
            Step::new("b", "crunch"),
            Step::new("c", "crunch"),
        ],
    );
    let started = Instant::now();
    let (summary, _) = run_collect(&scheduler, &plan, CancellationToken::new()).await;

    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(summary.status, RunStatus::Failed);
    let b = summary.step("b").unwrap();
    assert_eq!(b.status, StepStatus::Skipped);
    assert_eq!(b.result.as_ref().unwrap().error.as_ref().unwrap().kind, ErrorKind::Aborted);
    assert_eq!(summary.step("c").unwrap().status, StepStatus::Skipped);
}

#[tokio::test]
async fn test_cancel_stops_dispatch_and_discards_late_results() {
    let registry = registry(vec![Arc::new(SlowCapability::new("crunch", 5_000))]);
    let scheduler = Scheduler::new(registry, Arc::new(ApprovalGate::new()))
        .with_max_parallel(2)
        .with_cancel_grace(Duration::from_secs(1));
    let plan = Plan::new(
        "t",
        "",
        vec![
            Step::new("s1", "crunch"),
            Step::new("s2", "crunch"),
            Step::new("s3", "crunch"),
            Step::new("s4", "crunch").with_depends_on(vec!["s1".into()]),
        ],
    );
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let (summary, events) = run_collect(&scheduler, &plan, cancel).await;

    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(summary.status, RunStatus::Cancelled);
    assert_eq!(summary.count(StepStatus::Completed), 0);
    assert_eq!(summary.count(StepStatus::Skipped), 4);
    assert!(!events
        .iter()
        .any(|event| event.step_id == "s3" && event.status == StepStatus::Running));
    for report in &summary.steps {
        assert_eq!(report.result.as_ref().unwrap().error_message(), Some(RUN_CANCELLED));
    }
}

#[tokio::test]
async fn test_cancel_force_drops_uncooperative_steps_after_grace() {
    let registry = registry(vec![Arc::new(SlowCapability::new("crunch", 5_000).stubborn())]);
    let scheduler = Scheduler::new(registry, Arc::new(ApprovalGate::new()))
        .with_cancel_grace(Duration::from_millis(30));
    let plan = Plan::new("t", "", vec![Step::new("s1", "crunch")]);
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let (summary, _) = run_collect(&scheduler, &plan, cancel).await;
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(summary.status, RunStatus::Cancelled);
    assert_eq!(summary.step("s1").unwrap().status, StepStatus::Skipped);
}

#[tokio::test]
async fn test_unresolvable_reference_fails_without_invoking() {
    let echo = EchoCapability::new("resize");
    let calls = echo.calls.clone();
    let registry = registry(vec![
        Arc::new(StaticCapability::new("list_directory", json!({"files": []}))),
        Arc::new(echo),
    ]);
    let scheduler = Scheduler::new(registry, Arc::new(ApprovalGate::new()));
    let plan = Plan::new(
        "t",
        "",
        vec![
            Step::new("a", "list_directory"),
            Step::new("b", "resize")
                .with_arg("image", ArgValue::output_at("a", "/files/0"))
                .with_depends_on(vec!["a".into()]),
        ],
    );
    let (summary, _) = run_collect(&scheduler, &plan, CancellationToken::new()).await;

    let result = summary.step("b").unwrap().result.clone().unwrap();
    assert_eq!(summary.step("b").unwrap().status, StepStatus::Failed);
    assert_eq!(result.attempts, 0);
    assert_eq!(result.error.unwrap().kind, ErrorKind::Argument);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_input_schema_mismatch_is_argument_error() {
    let strict = StaticCapability::new("read_file", json!("contents")).with_metadata(
        CapabilityMeta::new("read_file", "").with_input_schema(json!({
            "type": "object",
            "required": ["path"],
            "properties": {"path": {"type": "string"}}
        })),
    );
    let calls = strict.calls.clone();
    let scheduler = Scheduler::new(registry(vec![Arc::new(strict)]), Arc::new(ApprovalGate::new()));
    let plan = Plan::new(
        "t",
        "",
        vec![Step::new("r", "read_file").with_arg("path", ArgValue::literal(5))],
    );
    let (summary, _) = run_collect(&scheduler, &plan, CancellationToken::new()).await;

    let result = summary.step("r").unwrap().result.clone().unwrap();
    assert_eq!(result.error.unwrap().kind, ErrorKind::Argument);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_every_step_dispatched_and_finished_exactly_once() {
    let echo = EchoCapability::new("echo");
    let calls = echo.calls.clone();
    let scheduler = Scheduler::new(registry(vec![Arc::new(echo)]), Arc::new(ApprovalGate::new()))
        .with_max_parallel(2);
    let plan = Plan::new(
        "t",
        "",
        vec![
            Step::new("a", "echo"),
            Step::new("b", "echo").with_depends_on(vec!["a".into()]),
            Step::new("c", "echo").with_depends_on(vec!["a".into()]),
            Step::new("d", "echo").with_depends_on(vec!["b".into(), "c".into()]),
        ],
    );
    let (summary, events) = run_collect(&scheduler, &plan, CancellationToken::new()).await;

    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    for id in ["a", "b", "c", "d"] {
        let statuses = statuses_of(&events, id);
        assert_eq!(statuses.iter().filter(|s| **s == StepStatus::Running).count(), 1);
        assert_eq!(statuses.iter().filter(|s| s.is_terminal()).count(), 1);
        assert_eq!(statuses.last(), Some(&StepStatus::Completed));
    }
}

#[tokio::test]
async fn test_step_fans_out_through_worker_pool() {
    let registry = registry(vec![
        Arc::new(BatchResize),
        Arc::new(SlowCapability::new("resize", 5)),
    ]);
    let pool = WorkerPool::new(registry.clone(), 3);
    let scheduler = Scheduler::new(registry, Arc::new(ApprovalGate::new())).with_pool(pool);
    let plan = Plan::new(
        "t",
        "",
        vec![Step::new("batch", "batch_resize")
            .with_arg("images", ArgValue::literal(json!(["a", "b", "c", "d"])))],
    );
    let (summary, _) = run_collect(&scheduler, &plan, CancellationToken::new()).await;

    let value = summary.step("batch").unwrap().result.clone().unwrap().value.unwrap();
    assert_eq!(value["succeeded"], json!(4));
    assert_eq!(value["failed"], json!(0));
}

#[tokio::test]
async fn test_invalid_plan_is_rejected_before_running() {
    let echo = EchoCapability::new("echo");
    let calls = echo.calls.clone();
    let scheduler = Scheduler::new(registry(vec![Arc::new(echo)]), Arc::new(ApprovalGate::new()));
    let plan = Plan::new(
        "t",
        "",
        vec![Step::new("a", "echo"), Step::new("b", "rm_rf")],
    );
    let (sink, mut rx) = ChannelProgressSink::new(16);
    let err = scheduler
        .run(&plan, CancellationToken::new(), &sink)
        .await
        .unwrap_err();

    assert_eq!(err, ValidationError::UnknownCapability("b".into(), "rm_rf".into()));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_unsatisfiable_graph_ends_with_structural_error() {
    let scheduler = Scheduler::new(
        registry(vec![Arc::new(EchoCapability::new("echo"))]),
        Arc::new(ApprovalGate::new()),
    );
    let plan = Plan::new(
        "t",
        "",
        vec![
            Step::new("a", "echo").with_depends_on(vec!["b".into()]),
            Step::new("b", "echo").with_depends_on(vec!["a".into()]),
            Step::new("c", "echo"),
        ],
    );
    let summary = scheduler
        .execute(&plan, CancellationToken::new(), &crate::events::NoopProgressSink)
        .await;

    assert_eq!(summary.status, RunStatus::StructuralError);
    assert_eq!(summary.step("c").unwrap().status, StepStatus::Completed);
    assert_eq!(summary.step("a").unwrap().status, StepStatus::Skipped);
    assert_eq!(summary.step("b").unwrap().status, StepStatus::Skipped);
}
