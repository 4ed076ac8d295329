use std::sync::Arc;

use futures_util::FutureExt;
use ontos_actions::Dispatcher;
use ontos_protocol::{ActionContext, JobSpec, JobTask, OntosError, UserContext};
use serde_json::json;
use tracing::info;

pub const NIGHTLY_ROOM_CHARGES: &str = "nightly_room_charges";
const NIGHT_SECS: u64 = 86_400;

/// Operator recorded on work the scheduler does by itself.
pub fn system_user() -> UserContext {
    UserContext::new("system", "admin")
}

/// Night audit: posts one more night to every overstaying guest's bill.
pub fn nightly_room_charges(dispatcher: &Dispatcher) -> (JobSpec, JobTask) {
    let spec = JobSpec::every(NIGHTLY_ROOM_CHARGES, NIGHT_SECS).describe("夜审入账房费");
    let dispatcher = dispatcher.clone();
    let task: JobTask = Arc::new(move || {
        let dispatcher = dispatcher.clone();
        async move {
            let ctx = ActionContext::new(system_user());
            let result = dispatcher.dispatch("post_room_charges", json!({}), &ctx).await?;
            if !result.success {
                return Err(OntosError::Internal(format!("night audit rejected: {}", result.message)));
            }
            info!(posted = ?result.data.get("posted"), "night audit finished");
            Ok::<(), OntosError>(())
        }
        .boxed()
    });
    (spec, task)
}

pub fn jobs(dispatcher: &Dispatcher) -> Vec<(JobSpec, JobTask)> {
    vec![nightly_room_charges(dispatcher)]
}
