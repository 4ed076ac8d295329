use ontos_actions::{ActionEnv, ActionRegistry, FnAction};
use ontos_protocol::{
    ActionMetadata, ActionResult, OntosError, OntosResult, ParamSpec, ParamType, Row, StoreTransaction,
};
use serde_json::json;

use super::{FRONT_DESK, ROOM_NUMBER_PATTERNS, require_id, room_param, row, str_field};
use crate::events::{ROOM_STATUS_CHANGED, TASK_ASSIGNED, TASK_COMPLETED, TASK_CREATED};
use crate::ontology::{BRANCH_COLUMN, EMPLOYEE, ROOM, ROOM_STATES, TASK};

const TASK_TYPES: [&str; 2] = ["cleaning", "maintenance"];
const ASSIGNEE_PATTERNS: [&str; 1] = [r"(?:派给|分配给|交给|安排给|给)\s*([\p{Han}]{2,3}?)(?:[，,。\s]|$|去|做|打扫|处理|清洁|维修)"];

fn task_param() -> ParamSpec {
    ParamSpec::new("task_id", ParamType::String)
        .required()
        .describe("任务 id 或房号")
        .refers_to(TASK, ["room_number"])
        .extract(ROOM_NUMBER_PATTERNS)
}

fn assignee_param() -> ParamSpec {
    ParamSpec::new("assignee_id", ParamType::String)
        .describe("负责员工")
        .refers_to(EMPLOYEE, ["name"])
        .extract(ASSIGNEE_PATTERNS)
}

/// Moves a room to `target` along whichever lifecycle trigger leads there.
fn move_room(env: &ActionEnv<'_>, tx: &mut dyn StoreTransaction, room: &Row, target: &str) -> OntosResult<String> {
    let room_id = require_id(room)?;
    let current = str_field(room, "status").unwrap_or("vacant_clean");
    let trigger = env
        .registry
        .get_state_machine(ROOM)
        .and_then(|m| m.transitions_from(current).find(|t| t.to == target))
        .map(|t| t.trigger.clone())
        .ok_or_else(|| OntosError::InvalidTransition {
            entity: ROOM.to_owned(),
            from: current.to_owned(),
            trigger: format!("-> {target}"),
            valid_alternatives: env.state_machines.valid_triggers(ROOM, current),
        })?;
    env.transition(tx, ROOM, &room_id, &trigger)?;
    Ok(trigger)
}

fn update_room_status(actions: &mut ActionRegistry) -> OntosResult<()> {
    let meta = ActionMetadata::new("update_room_status", ROOM)
        .describe("更新房态 修改房间状态 打扫完 设为维修 update room status")
        .keywords(["房态", "房间状态", "打扫完", "维修", "脏房", "room status"])
        .undoable()
        .param(room_param("room_id"))
        .param(
            ParamSpec::new("status", ParamType::String)
                .required()
                .describe("目标房态")
                .one_of(ROOM_STATES),
        );

    let handler = FnAction::new(|env, tx| {
        let target = env.str_param("status")?;
        let room = row(env.before["room"].clone());
        let room_id = require_id(&room)?;
        let old_status = str_field(&room, "status").unwrap_or_default().to_owned();
        move_room(env, tx, &room, target)?;

        let room_number = str_field(&room, "room_number").unwrap_or_default();
        Ok(ActionResult::ok(format!("{room_number} 房状态: {old_status} -> {target}"))
            .with_entity(ROOM, room_id.clone())
            .with_data("room_id", json!(room_id))
            .with_data("room_number", json!(room_number))
            .with_data("old_status", json!(old_status))
            .with_data("new_status", json!(target))
            .emit(ROOM_STATUS_CHANGED))
    })
    .with_context(|env, tx| {
        let room = tx.require(ROOM, env.str_param("room_id")?)?;
        Ok(json!({ "room": room }))
    });

    actions.add(meta, handler)
}

fn create_task(actions: &mut ActionRegistry) -> OntosResult<()> {
    let meta = ActionMetadata::new("create_task", TASK)
        .describe("创建任务 安排清洁 报修 create task")
        .keywords(["任务", "清洁", "打扫", "报修", "task", "cleaning"])
        .roles(FRONT_DESK)
        .undoable()
        .param(room_param("room_id"))
        .param(
            ParamSpec::new("task_type", ParamType::String)
                .describe("任务类型")
                .one_of(TASK_TYPES)
                .default_value(json!("cleaning")),
        )
        .param(assignee_param())
        .param(ParamSpec::new("notes", ParamType::String).describe("备注"));

    let handler = FnAction::new(|env, tx| {
        let room_id = env.str_param("room_id")?;
        let room = tx.require(ROOM, room_id)?;
        let room_number = str_field(&room, "room_number").unwrap_or_default().to_owned();
        let task_type = env.opt_str("task_type").unwrap_or("cleaning");

        let mut task = row(json!({
            "room_id": room_id,
            "room_number": room_number,
            "task_type": task_type,
            "status": "pending",
            BRANCH_COLUMN: str_field(&room, BRANCH_COLUMN),
        }));
        if let Some(notes) = env.opt_str("notes") {
            task.insert("notes".into(), json!(notes));
        }
        let task_id = tx.insert(TASK, task)?;

        let mut result = ActionResult::ok(format!("已为 {room_number} 房创建{}任务", task_label(task_type)))
            .with_entity(TASK, task_id.clone())
            .with_data("task_id", json!(task_id))
            .with_data("room_id", json!(room_id))
            .with_data("room_number", json!(room_number))
            .with_data("task_type", json!(task_type))
            .emit(TASK_CREATED);
        if let Some(assignee) = env.opt_str("assignee_id") {
            env.transition(tx, TASK, &task_id, "assign")?;
            tx.update(TASK, &task_id, row(json!({ "assignee_id": assignee })))?;
            result = result.emit(TASK_ASSIGNED);
        }
        Ok(result)
    });

    actions.add(meta, handler)
}

fn task_label(task_type: &str) -> &'static str {
    match task_type {
        "maintenance" => "维修",
        _ => "清洁",
    }
}

fn assign_task(actions: &mut ActionRegistry) -> OntosResult<()> {
    let meta = ActionMetadata::new("assign_task", TASK)
        .describe("分配任务 派单 assign task")
        .keywords(["分配", "派给", "派单", "assign"])
        .roles(FRONT_DESK)
        .undoable()
        .param(task_param())
        .param(assignee_param().required());

    let handler = FnAction::new(|env, tx| {
        let task_id = env.str_param("task_id")?;
        let assignee = env.str_param("assignee_id")?;
        let task = tx.require(TASK, task_id)?;
        if str_field(&task, "status") != Some("assigned") {
            env.transition(tx, TASK, task_id, "assign")?;
        }
        tx.update(TASK, task_id, row(json!({ "assignee_id": assignee })))?;

        let name = tx
            .get(EMPLOYEE, assignee)?
            .and_then(|e| str_field(&e, "name").map(str::to_owned))
            .unwrap_or_else(|| assignee.to_owned());
        let room_number = str_field(&task, "room_number").unwrap_or_default();
        Ok(ActionResult::ok(format!("{room_number} 房任务已分配给 {name}"))
            .with_entity(TASK, task_id)
            .with_data("task_id", json!(task_id))
            .with_data("room_number", json!(room_number))
            .with_data("assignee_name", json!(name))
            .emit(TASK_ASSIGNED))
    });

    actions.add(meta, handler)
}

fn start_task(actions: &mut ActionRegistry) -> OntosResult<()> {
    let meta = ActionMetadata::new("start_task", TASK)
        .describe("开始任务 开始打扫 start task")
        .keywords(["开始", "开始打扫", "start"])
        .undoable()
        .param(task_param());

    let handler = FnAction::new(|env, tx| {
        let task_id = env.str_param("task_id")?;
        let outcome = env.transition(tx, TASK, task_id, "start")?;
        let room_number = tx
            .get(TASK, task_id)?
            .and_then(|t| str_field(&t, "room_number").map(str::to_owned))
            .unwrap_or_default();
        Ok(ActionResult::ok(format!("{room_number} 房任务开始"))
            .with_entity(TASK, task_id)
            .with_data("room_number", json!(room_number))
            .with_data("status", json!(outcome.to)))
    });

    actions.add(meta, handler)
}

fn complete_task(actions: &mut ActionRegistry) -> OntosResult<()> {
    let meta = ActionMetadata::new("complete_task", TASK)
        .describe("完成任务 打扫完成 维修完成 complete task")
        .keywords(["完成", "做完", "打扫完成", "修好", "complete", "done"])
        .undoable()
        .side_effects(["cleaning: Room vacant_dirty -> vacant_clean", "maintenance: Room out_of_order -> vacant_dirty"])
        .param(task_param());

    let handler = FnAction::new(|env, tx| {
        let task_id = env.str_param("task_id")?;
        let task = tx.require(TASK, task_id)?;
        env.transition(tx, TASK, task_id, "complete")?;

        let room_number = str_field(&task, "room_number").unwrap_or_default().to_owned();
        let task_type = str_field(&task, "task_type").unwrap_or("cleaning");
        let mut result = ActionResult::ok(format!("{room_number} 房{}任务完成", task_label(task_type)))
            .with_entity(TASK, task_id)
            .with_data("task_id", json!(task_id))
            .with_data("room_number", json!(room_number))
            .with_data("task_type", json!(task_type))
            .emit(TASK_COMPLETED);

        let follow_up = match task_type {
            "maintenance" => ("out_of_order", "vacant_dirty"),
            _ => ("vacant_dirty", "vacant_clean"),
        };
        if let Some(room_id) = str_field(&task, "room_id")
            && let Some(room) = tx.get(ROOM, room_id)?
            && str_field(&room, "status") == Some(follow_up.0)
        {
            move_room(env, tx, &room, follow_up.1)?;
            result = result
                .with_data("room_id", json!(room_id))
                .with_data("new_status", json!(follow_up.1))
                .emit(ROOM_STATUS_CHANGED);
        }
        Ok(result)
    });

    actions.add(meta, handler)
}

pub(super) fn register(actions: &mut ActionRegistry) -> OntosResult<()> {
    update_room_status(actions)?;
    create_task(actions)?;
    assign_task(actions)?;
    start_task(actions)?;
    complete_task(actions)
}
