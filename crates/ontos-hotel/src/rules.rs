//! Business constraints and the vocabulary that maps everyday words onto
//! canonical field values.

use ontos_protocol::{ConstraintMetadata, Severity};
use ontos_rules::{ConstraintEngine, RuleContext, Vocabulary};

use crate::ontology::{BILL, PAYMENT, RESERVATION, ROOM, STAY, TASK};

/// Walk-ins longer than this many nights pass with a warning.
const LONG_STAY_NIGHTS: i64 = 30;
/// Upper bound on nights booked or extended in one action.
pub const MAX_NIGHTS: i64 = 365;

fn constraints() -> Vec<ConstraintMetadata> {
    let mut list = Vec::new();
    for action in ["walkin_checkin", "checkin_reservation"] {
        list.push(
            ConstraintMetadata::new(format!("{action}_room_ready"), STAY, action, "房间不是空净房，不能入住")
                .expr("before.room.status == 'vacant_clean'")
                .suggest("请选择空净房，或先完成清洁")
                .alternatives(["update_room_status", "create_task"]),
        );
    }
    list.extend([
        ConstraintMetadata::new("walkin_nights_positive", STAY, "walkin_checkin", "入住晚数必须大于 0")
            .expr("params.nights > 0"),
        ConstraintMetadata::new("walkin_nights_bounded", STAY, "walkin_checkin", format!("入住晚数不能超过 {MAX_NIGHTS}"))
            .expr(format!("params.nights <= {MAX_NIGHTS}")),
        ConstraintMetadata::new("walkin_long_stay", STAY, "walkin_checkin", "入住超过 30 晚，请确认是否长包房")
            .function("long_stay")
            .severity(Severity::Warning),
        ConstraintMetadata::new("checkout_bill_settled", STAY, "checkout", "账单未结清")
            .expr("before.bill.outstanding_amount <= 0")
            .suggest("请先收款再退房")
            .alternatives(["add_payment"]),
        ConstraintMetadata::new("change_room_target_ready", STAY, "change_room", "目标房间不是空净房")
            .expr("before.new_room.status == 'vacant_clean'")
            .suggest("请选择其它空净房"),
        ConstraintMetadata::new("change_room_stay_active", STAY, "change_room", "住宿已结束，不能换房")
            .expr("before.stay.status == 'active'"),
        ConstraintMetadata::new("extend_nights_positive", STAY, "extend_stay", "续住晚数必须大于 0")
            .expr("params.nights > 0"),
        ConstraintMetadata::new("extend_nights_bounded", STAY, "extend_stay", format!("续住晚数不能超过 {MAX_NIGHTS}"))
            .expr(format!("params.nights <= {MAX_NIGHTS}")),
        ConstraintMetadata::new("extend_stay_active", STAY, "extend_stay", "住宿已结束，不能续住")
            .expr("before.stay.status == 'active'"),
        ConstraintMetadata::new("payment_positive", BILL, "add_payment", "收款金额必须大于 0")
            .expr("params.amount > 0"),
        ConstraintMetadata::new("payment_within_balance", BILL, "add_payment", "收款金额超过待付金额")
            .expr("params.amount <= before.bill.outstanding_amount")
            .suggest("请核对待付金额"),
        ConstraintMetadata::new("payment_bill_open", BILL, "add_payment", "账单已结清")
            .expr("before.bill.status == 'open'"),
        ConstraintMetadata::new("adjustment_not_negative", BILL, "adjust_bill", "调整后账单金额不能为负")
            .expr("before.bill.total_amount + before.bill.adjustment_amount + params.amount - before.bill.paid_amount >= 0"),
        ConstraintMetadata::new("adjustment_bill_open", BILL, "adjust_bill", "账单已结清，不能调整")
            .expr("before.bill.status == 'open'"),
        ConstraintMetadata::new("reservation_dates", RESERVATION, "create_reservation", "离店日期必须晚于入住日期")
            .expr("params.check_out_date > params.check_in_date"),
        ConstraintMetadata::new("no_show_after_arrival_date", RESERVATION, "mark_no_show", "未到入住日期，不能标记未到店")
            .expr("before.overdue == true"),
        ConstraintMetadata::new("manual_status_not_occupied", ROOM, "update_room_status", "入住请使用办理入住")
            .expr("params.status != 'occupied'")
            .alternatives(["walkin_checkin", "checkin_reservation"]),
        ConstraintMetadata::new("manual_status_room_free", ROOM, "update_room_status", "在住房间请办理退房")
            .expr("before.room.status != 'occupied'")
            .alternatives(["checkout"]),
    ]);
    list
}

fn long_stay(ctx: &RuleContext) -> ontos_protocol::OntosResult<bool> {
    Ok(ctx.params["nights"].as_i64().is_none_or(|n| n <= LONG_STAY_NIGHTS))
}

pub fn register(constraints: &mut ConstraintEngine, vocabulary: &mut Vocabulary) {
    constraints.register_function("long_stay", long_stay);
    for constraint in self::constraints() {
        constraints.register(constraint);
    }

    for term in ["空闲", "空房", "available", "free"] {
        vocabulary.add_expansion(ROOM, "status", term, ["vacant_clean", "vacant_dirty"]);
    }
    let room_aliases = [
        ("空净房", "vacant_clean"),
        ("干净", "vacant_clean"),
        ("打扫完", "vacant_clean"),
        ("clean", "vacant_clean"),
        ("脏房", "vacant_dirty"),
        ("待打扫", "vacant_dirty"),
        ("dirty", "vacant_dirty"),
        ("在住", "occupied"),
        ("入住中", "occupied"),
        ("维修", "out_of_order"),
        ("故障", "out_of_order"),
    ];
    for (term, value) in room_aliases {
        vocabulary.add_alias(ROOM, "status", term, value);
    }

    for (term, value) in [("待处理", "pending"), ("已分配", "assigned"), ("进行中", "in_progress"), ("已完成", "completed")] {
        vocabulary.add_alias(TASK, "status", term, value);
    }
    for (term, value) in [("清洁", "cleaning"), ("打扫", "cleaning"), ("维修", "maintenance"), ("报修", "maintenance")] {
        vocabulary.add_alias(TASK, "task_type", term, value);
    }
    for (term, value) in [
        ("待确认", "pending"),
        ("已确认", "confirmed"),
        ("已入住", "checked_in"),
        ("已取消", "cancelled"),
        ("未到店", "no_show"),
    ] {
        vocabulary.add_alias(RESERVATION, "status", term, value);
    }
    vocabulary.add_alias(STAY, "status", "在住", "active");
    vocabulary.add_alias(STAY, "status", "已退房", "checked_out");
    vocabulary.add_alias(BILL, "status", "未结", "open");
    vocabulary.add_alias(BILL, "status", "已结", "settled");

    // Payment methods: stored on Payment, passed as a parameter of Bill actions.
    for entity in [PAYMENT, BILL] {
        for (term, value) in [("现金", "cash"), ("刷卡", "card"), ("银行卡", "card"), ("微信", "wechat"), ("支付宝", "alipay")] {
            vocabulary.add_alias(entity, "method", term, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn engines() -> (ConstraintEngine, Vocabulary) {
        let mut constraints = ConstraintEngine::new();
        let mut vocabulary = Vocabulary::new();
        register(&mut constraints, &mut vocabulary);
        (constraints, vocabulary)
    }

    #[test]
    fn unsettled_bill_blocks_checkout() {
        let (constraints, _) = engines();
        let ctx = RuleContext::new(STAY, "checkout", json!({"stay_id": "S1"}))
            .with_before(json!({"bill": {"outstanding_amount": 120.0}}));
        let err = constraints.check(&ctx).unwrap_err();
        assert_eq!(err.error_code(), "CONSTRAINT_VIOLATION");
        assert_eq!(err.to_string(), "账单未结清");

        let settled = RuleContext::new(STAY, "checkout", json!({}))
            .with_before(json!({"bill": {"outstanding_amount": 0.0}}));
        assert!(constraints.check(&settled).is_ok());
    }

    #[test]
    fn payment_must_fit_the_balance() {
        let (constraints, _) = engines();
        let bill = json!({"bill": {"outstanding_amount": 300.0, "status": "open"}});
        let ok = RuleContext::new(BILL, "add_payment", json!({"amount": 300})).with_before(bill.clone());
        assert!(constraints.check(&ok).is_ok());
        let over = RuleContext::new(BILL, "add_payment", json!({"amount": 300.5})).with_before(bill.clone());
        assert!(constraints.check(&over).is_err());
        let zero = RuleContext::new(BILL, "add_payment", json!({"amount": 0})).with_before(bill);
        assert!(constraints.check(&zero).is_err());
    }

    #[test]
    fn missing_context_fails_closed() {
        let (constraints, _) = engines();
        let ctx = RuleContext::new(STAY, "walkin_checkin", json!({"nights": 1}));
        assert!(constraints.check(&ctx).is_err());
    }

    #[test]
    fn long_stays_only_warn() {
        let (constraints, _) = engines();
        let ctx = RuleContext::new(STAY, "walkin_checkin", json!({"nights": 45}))
            .with_before(json!({"room": {"status": "vacant_clean"}}));
        let report = constraints.evaluate(&ctx);
        assert!(report.blocking().is_none());
        assert_eq!(report.warnings().count(), 1);
    }

    #[test]
    fn vocabulary_covers_rooms_tasks_and_payments() {
        let (_, vocabulary) = engines();
        assert_eq!(vocabulary.canonicalize(ROOM, "status", "空闲"), vec!["vacant_clean", "vacant_dirty"]);
        assert_eq!(vocabulary.canonicalize(ROOM, "status", "脏房"), vec!["vacant_dirty"]);
        assert_eq!(vocabulary.resolve_alias(TASK, "task_type", "打扫"), Some("cleaning"));
        assert_eq!(vocabulary.resolve_alias(BILL, "method", "微信"), Some("wechat"));
    }
}
