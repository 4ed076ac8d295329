//! Multi-step front-desk workflows recognised from a single utterance.

use ontos_runtime::{PlanStep, PlanTemplate};

/// Walk-in check-in followed by the deposit on the bill it opened.
pub fn checkin_with_deposit() -> PlanTemplate {
    PlanTemplate::new("checkin_with_deposit", "散客入住并收押金")
        .trigger(["入住", "押金"])
        .trigger(["check in", "deposit"])
        .step(
            PlanStep::new("checkin", "walkin_checkin")
                .with("room_id", "$room_id")
                .with("guest_name", "$guest_name")
                .with("guest_phone", "$guest_phone")
                .with("nights", "$nights"),
        )
        .step(
            PlanStep::new("pay", "add_payment")
                .with("bill_id", "$checkin.bill_id")
                .with("amount", "$amount")
                .with("method", "$method")
                .after("checkin"),
        )
}

pub fn checkout_and_clean() -> PlanTemplate {
    PlanTemplate::new("checkout_and_clean", "退房并安排打扫")
        .trigger(["退房", "打扫"])
        .trigger(["退房", "清洁"])
        .trigger(["check out", "clean"])
        .step(PlanStep::new("checkout", "checkout").with("stay_id", "$stay_id"))
        .step(
            PlanStep::new("clean", "create_task")
                .with("room_id", "$checkout.room_id")
                .with("task_type", "cleaning")
                .after("checkout"),
        )
}

pub fn templates() -> Vec<PlanTemplate> {
    vec![checkin_with_deposit(), checkout_and_clean()]
}
