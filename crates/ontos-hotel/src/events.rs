//! Hotel domain events and the in-app notifications they trigger.

use std::sync::Arc;

use futures_util::FutureExt;
use ontos_events::{EventBus, FnHandler, InAppChannel, NotificationService};
use ontos_protocol::{DomainEvent, OntosError};
use serde_json::json;
use tracing::debug;

pub const GUEST_CHECKED_IN: &str = "GUEST_CHECKED_IN";
pub const GUEST_CHECKED_OUT: &str = "GUEST_CHECKED_OUT";
pub const RESERVATION_CREATED: &str = "RESERVATION_CREATED";
pub const RESERVATION_CANCELLED: &str = "RESERVATION_CANCELLED";
pub const PAYMENT_RECEIVED: &str = "PAYMENT_RECEIVED";
pub const ROOM_STATUS_CHANGED: &str = "ROOM_STATUS_CHANGED";
pub const TASK_CREATED: &str = "TASK_CREATED";
pub const TASK_ASSIGNED: &str = "TASK_ASSIGNED";
pub const TASK_COMPLETED: &str = "TASK_COMPLETED";
pub const ROOM_CHANGED: &str = "ROOM_CHANGED";
pub const STAY_EXTENDED: &str = "STAY_EXTENDED";
pub const BILL_ADJUSTED: &str = "BILL_ADJUSTED";
pub const ROOM_CHARGES_POSTED: &str = "ROOM_CHARGES_POSTED";

/// In-app inboxes, one per team.
pub const HOUSEKEEPING: &str = "housekeeping";
pub const FRONT_DESK: &str = "front_desk";
pub const MANAGERS: &str = "managers";
pub const MAINTENANCE: &str = "maintenance";

type Render = fn(&DomainEvent) -> Option<(String, String, String)>;

fn room(event: &DomainEvent) -> &str {
    event.payload_str("room_number").unwrap_or("?")
}

fn checked_out(event: &DomainEvent) -> Option<(String, String, String)> {
    Some((
        HOUSEKEEPING.to_owned(),
        "退房待清洁".to_owned(),
        format!("{} 房已退房，请安排清洁", room(event)),
    ))
}

fn checked_in(event: &DomainEvent) -> Option<(String, String, String)> {
    let guest = event.payload_str("guest_name").unwrap_or("客人");
    Some((
        FRONT_DESK.to_owned(),
        "新入住".to_owned(),
        format!("{guest} 已入住 {} 房", room(event)),
    ))
}

fn task_created(event: &DomainEvent) -> Option<(String, String, String)> {
    let team = match event.payload_str("task_type") {
        Some("maintenance") => MAINTENANCE,
        _ => HOUSEKEEPING,
    };
    Some((team.to_owned(), "新任务".to_owned(), format!("{} 房有新任务", room(event))))
}

fn task_assigned(event: &DomainEvent) -> Option<(String, String, String)> {
    let assignee = event.payload_str("assignee_id")?;
    Some((
        assignee.to_owned(),
        "任务已分配".to_owned(),
        format!("你有一个 {} 房的任务", room(event)),
    ))
}

fn task_completed(event: &DomainEvent) -> Option<(String, String, String)> {
    Some((
        FRONT_DESK.to_owned(),
        "任务完成".to_owned(),
        format!("{} 房的任务已完成", room(event)),
    ))
}

fn room_status_changed(event: &DomainEvent) -> Option<(String, String, String)> {
    (event.payload_str("new_status") == Some("out_of_order")).then(|| {
        (
            MAINTENANCE.to_owned(),
            "房间故障".to_owned(),
            format!("{} 房已标记为维修", room(event)),
        )
    })
}

fn reservation_cancelled(event: &DomainEvent) -> Option<(String, String, String)> {
    let number = event.payload_str("reservation_no").unwrap_or("?");
    Some((MANAGERS.to_owned(), "预订取消".to_owned(), format!("预订 {number} 已取消")))
}

fn bill_adjusted(event: &DomainEvent) -> Option<(String, String, String)> {
    let amount = event.payload.get("amount").cloned().unwrap_or_default();
    Some((
        MANAGERS.to_owned(),
        "账单调整".to_owned(),
        format!("{} 房账单调整 {amount}，操作人 {}", room(event), event.actor_id),
    ))
}

fn room_changed(event: &DomainEvent) -> Option<(String, String, String)> {
    let old = event.payload_str("old_room_number").unwrap_or("?");
    Some((
        HOUSEKEEPING.to_owned(),
        "换房".to_owned(),
        format!("客人从 {old} 换到 {} 房，{old} 待清洁", room(event)),
    ))
}

fn notifier(name: &'static str, notifications: Arc<NotificationService>, render: Render) -> Arc<FnHandler> {
    Arc::new(FnHandler::new(name, move |event: DomainEvent| {
        let notifications = notifications.clone();
        async move {
            let Some((recipient, subject, content)) = render(&event) else {
                return Ok::<(), OntosError>(());
            };
            let extra = json!({"event": event.name, "entity_id": event.entity_id});
            let sent = notifications
                .notify(InAppChannel::NAME, &recipient, &subject, &content, &extra)
                .await;
            debug!(event = %event.name, %recipient, sent, "notification routed");
            Ok(())
        }
        .boxed()
    }))
}

pub fn register(events: &EventBus, notifications: &Arc<NotificationService>) {
    let routes: [(&'static str, &'static str, Render); 9] = [
        (GUEST_CHECKED_OUT, "notify_housekeeping_checkout", checked_out),
        (GUEST_CHECKED_IN, "notify_front_desk_checkin", checked_in),
        (TASK_CREATED, "notify_task_created", task_created),
        (TASK_ASSIGNED, "notify_assignee", task_assigned),
        (TASK_COMPLETED, "notify_task_completed", task_completed),
        (ROOM_STATUS_CHANGED, "notify_maintenance", room_status_changed),
        (RESERVATION_CANCELLED, "notify_managers_cancellation", reservation_cancelled),
        (BILL_ADJUSTED, "notify_managers_adjustment", bill_adjusted),
        (ROOM_CHANGED, "notify_housekeeping_room_change", room_changed),
    ];
    for (event, name, render) in routes {
        events.subscribe(event, notifier(name, notifications.clone(), render));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn wired() -> (EventBus, Arc<InAppChannel>) {
        let bus = EventBus::new(16);
        let notifications = Arc::new(NotificationService::new(Duration::from_millis(200)));
        let in_app = Arc::new(InAppChannel::new());
        notifications.register(in_app.clone());
        register(&bus, &notifications);
        (bus, in_app)
    }

    #[tokio::test]
    async fn checkout_pings_housekeeping() {
        let (bus, in_app) = wired();
        let event = DomainEvent::new(GUEST_CHECKED_OUT, "checkout", "E002")
            .with_payload(json!({"room_number": "301"}));
        let report = bus.publish(event).await;
        assert_eq!(report.delivered, 1);
        let inbox = in_app.messages_for(HOUSEKEEPING);
        assert_eq!(inbox.len(), 1);
        assert!(inbox[0].content.contains("301"));
    }

    #[tokio::test]
    async fn only_out_of_order_reaches_maintenance() {
        let (bus, in_app) = wired();
        bus.publish(
            DomainEvent::new(ROOM_STATUS_CHANGED, "update_room_status", "E002")
                .with_payload(json!({"room_number": "302", "new_status": "vacant_clean"})),
        )
        .await;
        assert!(in_app.messages_for(MAINTENANCE).is_empty());

        bus.publish(
            DomainEvent::new(ROOM_STATUS_CHANGED, "update_room_status", "E002")
                .with_payload(json!({"room_number": "302", "new_status": "out_of_order"})),
        )
        .await;
        assert_eq!(in_app.messages_for(MAINTENANCE).len(), 1);
    }

    #[tokio::test]
    async fn assignment_goes_to_the_assignee() {
        let (bus, in_app) = wired();
        bus.publish(
            DomainEvent::new(TASK_ASSIGNED, "assign_task", "E002")
                .with_payload(json!({"room_number": "305", "assignee_id": "E003"})),
        )
        .await;
        assert_eq!(in_app.messages_for("E003").len(), 1);
        assert_eq!(in_app.total(), 1);
    }
}
