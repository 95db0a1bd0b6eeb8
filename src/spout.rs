//! The user-facing source-operator contract.

use crate::config::TopologyConfig;
use crate::error::FailReason;
use crate::executor::collector::TaskCollector;
use crate::tuple::TaskId;
use std::collections::HashMap;
use std::fmt;

/// Opaque credential bag re-delivered on `__credentials_changed`.
pub type Credentials = HashMap<String, String>;

/// Where a task sits inside its executor and component.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task_id: TaskId,
    pub component: String,
    /// Index of this task within the executor's task list.
    pub task_index: usize,
    pub num_tasks: usize,
}

/// A source operator. One instance per task; every method is called
/// from the owning executor thread only.
///
/// `next_tuple` must not block: when there is nothing to emit it should
/// return immediately and let the executor's wait strategy idle.
pub trait Spout {
    /// User-chosen identifier carried from `emit` back into `ack`/`fail`.
    type MessageId: Clone + fmt::Debug + 'static;

    fn open(&mut self, conf: &TopologyConfig, ctx: &TaskContext) -> anyhow::Result<()>;

    /// Called on the inactive→active transition, before the next
    /// `next_tuple`.
    fn activate(&mut self) {}

    /// Called on the active→inactive transition.
    fn deactivate(&mut self) {}

    /// Emit zero or more tuples through the collector.
    fn next_tuple(&mut self, out: &mut TaskCollector<'_, Self::MessageId>) -> anyhow::Result<()>;

    /// The tuple tree rooted at `id` completed.
    fn ack(&mut self, id: &Self::MessageId) -> anyhow::Result<()> {
        let _ = id;
        Ok(())
    }

    /// The tuple tree rooted at `id` failed or timed out. Replaying is
    /// the spout's decision; the executor will not retry.
    fn fail(&mut self, id: &Self::MessageId, reason: FailReason) -> anyhow::Result<()> {
        let _ = (id, reason);
        Ok(())
    }

    /// Override to receive credential updates; the default opts out.
    fn set_credentials(&mut self, creds: &Credentials) {
        let _ = creds;
    }
}
