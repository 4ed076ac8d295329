use anyhow::{Result, bail};
use chrono::{Duration, Utc};
use ontos_hotel::HotelPlugin;
use ontos_hotel::events::{FRONT_DESK, GUEST_CHECKED_IN, HOUSEKEEPING, MANAGERS};
use ontos_hotel::jobs::NIGHTLY_ROOM_CHARGES;
use ontos_hotel::ontology::{BILL, PAYMENT, ROOM, STAY, TASK};
use ontos_kernel::{KernelBuilder, KernelConfig, OntosKernel};
use ontos_protocol::{ActionContext, ActionResult, RowFilter, UserContext};
use ontos_runtime::{SessionContext, TurnKind};
use serde_json::{Value, json};

async fn kernel() -> Result<OntosKernel> {
    KernelBuilder::new(KernelConfig::default())
        .plugin(HotelPlugin::new().with_demo_data().on(Utc::now().date_naive()))
        .build()
        .await
}

fn receptionist() -> UserContext {
    UserContext::new("E002", "receptionist").in_scope("b1")
}

fn manager() -> UserContext {
    UserContext::new("E001", "manager").in_scope("hq")
}

fn other_branch_receptionist() -> UserContext {
    UserContext::new("E005", "receptionist").in_scope("b2")
}

fn cleaner() -> UserContext {
    UserContext::new("E003", "cleaner").in_scope("b1")
}

async fn run(kernel: &OntosKernel, user: UserContext, action: &str, params: Value) -> Result<ActionResult> {
    Ok(kernel.dispatch(action, params, &ActionContext::new(user)).await?)
}

fn count(kernel: &OntosKernel, entity: &str, filters: &[RowFilter]) -> Result<usize> {
    Ok(kernel.store().query(entity, filters)?.len())
}

fn field(kernel: &OntosKernel, entity: &str, id: &str, name: &str) -> Result<Value> {
    let row = kernel.store().get(entity, id)?;
    Ok(row.and_then(|r| r.get(name).cloned()).unwrap_or(Value::Null))
}

#[tokio::test]
async fn walk_in_opens_a_stay_and_a_bill() -> Result<()> {
    let kernel = kernel().await?;
    let stays_before = count(&kernel, STAY, &[])?;
    let bills_before = count(&kernel, BILL, &[])?;
    let mut events = kernel.subscribe_events();
    let result = run(
        &kernel,
        receptionist(),
        "walkin_checkin",
        json!({"room_id": "b1-101", "guest_name": "王五", "guest_phone": "13812345678", "nights": 2}),
    )
    .await?;
    assert!(result.success, "{}", result.message);
    assert!(result.snapshot_id.is_some());
    assert_eq!(field(&kernel, ROOM, "b1-101", "status")?, json!("occupied"));

    let Some(bill_id) = result.data_str("bill_id") else {
        bail!("walk-in should return the bill id");
    };
    assert_eq!(field(&kernel, BILL, bill_id, "total_amount")?, json!(576.0));
    assert_eq!(field(&kernel, BILL, bill_id, "outstanding_amount")?, json!(576.0));
    assert_eq!(field(&kernel, BILL, bill_id, "paid_amount")?, json!(0.0));
    let Some(stay_id) = result.data_str("stay_id") else {
        bail!("walk-in should return the stay id");
    };
    assert_eq!(field(&kernel, STAY, stay_id, "status")?, json!("active"));
    assert_eq!(field(&kernel, STAY, stay_id, "room_id")?, json!("b1-101"));
    assert_eq!(count(&kernel, STAY, &[])?, stays_before + 1);
    assert_eq!(count(&kernel, BILL, &[])?, bills_before + 1);

    let event = events.try_recv()?;
    assert_eq!(event.name, GUEST_CHECKED_IN);
    assert_eq!(event.payload["room_number"], json!("101"));
    assert_eq!(kernel.in_app().messages_for(FRONT_DESK).len(), 1);
    Ok(())
}

#[tokio::test]
async fn dirty_rooms_cannot_be_checked_into() -> Result<()> {
    let kernel = kernel().await?;
    let result = run(
        &kernel,
        receptionist(),
        "walkin_checkin",
        json!({"room_id": "b1-103", "guest_name": "王五"}),
    )
    .await?;
    assert!(!result.success);
    assert_eq!(result.error_code.as_deref(), Some("CONSTRAINT_VIOLATION"));
    assert!(result.valid_alternatives.contains(&"create_task".to_owned()));
    assert_eq!(field(&kernel, ROOM, "b1-103", "status")?, json!("vacant_dirty"));
    Ok(())
}

#[tokio::test]
async fn checkout_waits_for_the_bill_then_calls_housekeeping() -> Result<()> {
    let kernel = kernel().await?;
    let blocked = run(&kernel, receptionist(), "checkout", json!({"stay_id": "S001"})).await?;
    assert!(!blocked.success);
    assert_eq!(blocked.message, "账单未结清");
    assert_eq!(blocked.valid_alternatives, ["add_payment"]);
    assert!(blocked.snapshot_id.is_none());
    assert_eq!(field(&kernel, STAY, "S001", "status")?, json!("active"));
    assert_eq!(field(&kernel, ROOM, "b1-102", "status")?, json!("occupied"));
    assert_eq!(field(&kernel, BILL, "BL001", "status")?, json!("open"));

    let paid = run(
        &kernel,
        receptionist(),
        "add_payment",
        json!({"bill_id": "BL001", "amount": 376, "method": "card"}),
    )
    .await?;
    assert!(paid.success, "{}", paid.message);
    assert_eq!(field(&kernel, BILL, "BL001", "outstanding_amount")?, json!(0.0));

    let done = run(&kernel, receptionist(), "checkout", json!({"stay_id": "S001"})).await?;
    assert!(done.success, "{}", done.message);
    assert_eq!(field(&kernel, ROOM, "b1-102", "status")?, json!("vacant_dirty"));
    assert_eq!(field(&kernel, BILL, "BL001", "status")?, json!("settled"));
    assert_eq!(field(&kernel, STAY, "S001", "status")?, json!("checked_out"));
    let inbox = kernel.in_app().messages_for(HOUSEKEEPING);
    assert_eq!(inbox.len(), 1);
    assert!(inbox[0].content.contains("102"));
    Ok(())
}

#[tokio::test]
async fn payments_cannot_exceed_the_balance() -> Result<()> {
    let kernel = kernel().await?;
    let result = run(&kernel, receptionist(), "add_payment", json!({"bill_id": "BL001", "amount": 500})).await?;
    assert_eq!(result.error_code.as_deref(), Some("CONSTRAINT_VIOLATION"));
    assert_eq!(field(&kernel, BILL, "BL001", "paid_amount")?, json!(200.0));
    Ok(())
}

#[tokio::test]
async fn fractions_of_a_cent_are_not_taken() -> Result<()> {
    let kernel = kernel().await?;
    let result = run(&kernel, receptionist(), "add_payment", json!({"bill_id": "BL001", "amount": 0.001})).await?;
    assert_eq!(result.error_code.as_deref(), Some("VALIDATION_ERROR"));
    assert!(result.field_errors.iter().any(|e| e.field == "amount"));
    assert_eq!(field(&kernel, BILL, "BL001", "paid_amount")?, json!(200.0));
    assert_eq!(count(&kernel, PAYMENT, &[RowFilter::eq("bill_id", "BL001")])?, 1);

    let exact = run(&kernel, receptionist(), "add_payment", json!({"bill_id": "BL001", "amount": 0.5})).await?;
    assert!(exact.success, "{}", exact.message);
    assert_eq!(field(&kernel, BILL, "BL001", "paid_amount")?, json!(200.5));
    Ok(())
}

#[tokio::test]
async fn absurd_night_counts_are_refused() -> Result<()> {
    let kernel = kernel().await?;
    let walk_in = run(
        &kernel,
        receptionist(),
        "walkin_checkin",
        json!({"room_id": "b1-101", "guest_name": "王五", "nights": 1_000_000_000}),
    )
    .await?;
    assert_eq!(walk_in.error_code.as_deref(), Some("CONSTRAINT_VIOLATION"));
    assert_eq!(field(&kernel, ROOM, "b1-101", "status")?, json!("vacant_clean"));

    let extend = run(&kernel, receptionist(), "extend_stay", json!({"stay_id": "S001", "nights": 1_000_000_000})).await?;
    assert_eq!(extend.error_code.as_deref(), Some("CONSTRAINT_VIOLATION"));
    assert_eq!(field(&kernel, BILL, "BL001", "total_amount")?, json!(576.0));

    let session = SessionContext::new("s-nights", receptionist());
    let response = kernel
        .process_turn("102 房续住 99999999999 晚", &session)
        .await?;
    assert!(response.results.iter().all(|r| !r.success), "{}", response.message);
    Ok(())
}

#[tokio::test]
async fn undo_stays_inside_the_branch() -> Result<()> {
    let kernel = kernel().await?;
    let result = run(&kernel, receptionist(), "update_room_status", json!({"room_id": "b1-103", "status": "vacant_clean"})).await?;
    let Some(snapshot_id) = result.snapshot_id else {
        bail!("room status changes are undoable");
    };

    let err = kernel
        .undo(&snapshot_id, &other_branch_receptionist())
        .await
        .map(|_| ())
        .unwrap_err();
    assert_eq!(err.error_code(), "SNAPSHOT_NOT_FOUND");
    assert_eq!(field(&kernel, ROOM, "b1-103", "status")?, json!("vacant_clean"));

    let outcome = kernel.undo(&snapshot_id, &manager()).await?;
    assert_eq!(outcome.undone.len(), 1);
    assert_eq!(field(&kernel, ROOM, "b1-103", "status")?, json!("vacant_dirty"));
    Ok(())
}

#[tokio::test]
async fn only_management_adjusts_bills() -> Result<()> {
    let kernel = kernel().await?;
    let params = json!({"bill_id": "BL001", "amount": -76, "reason": "投诉减免"});
    let denied = run(&kernel, receptionist(), "adjust_bill", params.clone()).await?;
    assert_eq!(denied.error_code.as_deref(), Some("PERMISSION_DENIED"));

    let adjusted = run(&kernel, manager(), "adjust_bill", params).await?;
    assert!(adjusted.success, "{}", adjusted.message);
    assert_eq!(field(&kernel, BILL, "BL001", "outstanding_amount")?, json!(300.0));
    assert_eq!(kernel.in_app().messages_for(MANAGERS).len(), 1);
    Ok(())
}

#[tokio::test]
async fn missing_parameters_are_reported_per_field() -> Result<()> {
    let kernel = kernel().await?;
    let result = run(&kernel, receptionist(), "walkin_checkin", json!({"room_id": "b1-101"})).await?;
    assert_eq!(result.error_code.as_deref(), Some("VALIDATION_ERROR"));
    assert!(result.field_errors.iter().any(|e| e.field == "guest_name"));
    Ok(())
}

#[tokio::test]
async fn stale_snapshots_cannot_be_undone() -> Result<()> {
    let kernel = kernel().await?;
    let two_days_ago = Utc::now() - Duration::days(2);
    let ctx = ActionContext::new(receptionist()).at(two_days_ago);
    let result = kernel
        .dispatch("update_room_status", json!({"room_id": "b1-103", "status": "vacant_clean"}), &ctx)
        .await?;
    assert!(result.success, "{}", result.message);
    let Some(snapshot_id) = result.snapshot_id else {
        bail!("room status changes are undoable");
    };
    let err = kernel.undo(&snapshot_id, &receptionist()).await.map(|_| ()).unwrap_err();
    assert_eq!(err.error_code(), "SNAPSHOT_EXPIRED");
    assert_eq!(field(&kernel, ROOM, "b1-103", "status")?, json!("vacant_clean"));
    Ok(())
}

#[tokio::test]
async fn schema_lists_the_hotel_model() -> Result<()> {
    let kernel = kernel().await?;
    let schema = kernel.export_schema();
    assert_eq!(schema.entities.len(), 10);
    assert!(schema.actions.iter().any(|a| a.name == "checkout"));
    assert!(schema.state_machines.iter().any(|m| m.entity == ROOM));
    assert!(schema.interfaces.iter().any(|i| i.definition.name == "Billable"));
    Ok(())
}

#[tokio::test]
async fn free_rooms_query_respects_the_branch() -> Result<()> {
    let kernel = kernel().await?;
    let session = SessionContext::new("s-front", receptionist());
    let response = kernel.process_turn("查询空闲房间", &session).await?;
    assert_eq!(response.kind, TurnKind::Query);
    let Some(query) = response.query else {
        bail!("query turn should carry rows");
    };
    assert_eq!(query.entity, ROOM);
    assert_eq!(query.total, 4);

    let session = SessionContext::new("s-hq", manager());
    let response = kernel.process_turn("查询空闲房间", &session).await?;
    assert_eq!(response.query.map(|q| q.total), Some(6));
    Ok(())
}

#[tokio::test]
async fn deposit_plan_runs_and_undoes_as_one() -> Result<()> {
    let kernel = kernel().await?;
    let session = SessionContext::new("s-plan", receptionist());
    let response = kernel
        .process_turn("201 房入住，客人王五，押金 300 元", &session)
        .await?;
    assert_eq!(response.kind, TurnKind::Plan, "{}", response.message);
    let Some(plan) = response.plan else {
        bail!("plan turn should carry its outcome");
    };
    assert!(plan.completed, "{}", plan.summary());
    let Some(bill_id) = plan.steps[0].result.data_str("bill_id").map(str::to_owned) else {
        bail!("checkin step returns the bill");
    };
    assert_eq!(field(&kernel, BILL, &bill_id, "paid_amount")?, json!(300.0));
    assert_eq!(field(&kernel, ROOM, "b1-201", "status")?, json!("occupied"));

    let Some(first) = plan.steps[0].result.snapshot_id.clone() else {
        bail!("checkin is undoable");
    };
    let outcome = kernel.undo_cascade(&first, &receptionist()).await?;
    assert_eq!(outcome.undone.len(), 2);
    assert_eq!(field(&kernel, ROOM, "b1-201", "status")?, json!("vacant_clean"));
    assert!(kernel.store().get(BILL, &bill_id)?.is_none());
    Ok(())
}

#[tokio::test]
async fn cleaners_work_only_their_own_tasks() -> Result<()> {
    let kernel = kernel().await?;
    let session = SessionContext::new("s-clean", cleaner());
    let response = kernel.process_turn("查看我的任务", &session).await?;
    let Some(query) = response.query else {
        bail!("task list expected");
    };
    assert_eq!(query.entity, TASK);
    assert_eq!(query.total, 1);

    let other = run(&kernel, cleaner(), "complete_task", json!({"task_id": "T002"})).await?;
    assert_eq!(other.error_code.as_deref(), Some("VALIDATION_ERROR"));

    let own = run(&kernel, cleaner(), "complete_task", json!({"task_id": "T001"})).await?;
    assert!(own.success, "{}", own.message);
    assert_eq!(field(&kernel, TASK, "T001", "status")?, json!("completed"));
    assert_eq!(field(&kernel, ROOM, "b1-103", "status")?, json!("vacant_clean"));
    assert_eq!(kernel.in_app().messages_for(FRONT_DESK).len(), 1);
    Ok(())
}

#[tokio::test]
async fn night_audit_charges_overstays_once() -> Result<()> {
    let kernel = kernel().await?;
    let tomorrow = (Utc::now().date_naive() + Duration::days(1)).to_string();
    let first = run(&kernel, manager(), "post_room_charges", json!({"business_date": tomorrow})).await?;
    assert!(first.success, "{}", first.message);
    assert_eq!(first.data.get("posted"), Some(&json!(1)));
    assert_eq!(field(&kernel, BILL, "BL001", "total_amount")?, json!(864.0));

    let again = run(&kernel, manager(), "post_room_charges", json!({"business_date": tomorrow})).await?;
    assert_eq!(again.data.get("posted"), Some(&json!(0)));

    let scheduler = kernel.scheduler();
    let jobs = scheduler.get_jobs().await;
    let Some(job) = jobs.iter().find(|j| j.name == NIGHTLY_ROOM_CHARGES) else {
        bail!("night audit job is scheduled");
    };
    scheduler.trigger_job(&job.job_id).await?;
    Ok(())
}
