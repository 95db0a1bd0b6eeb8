//! Per-stream destination selection.
//!
//! The topology declares, for each output stream of a component, how
//! its tuples spread over the consuming tasks. The collector resolves
//! the grouping on every emit, so selection writes into a caller-owned
//! scratch buffer instead of allocating.

use crate::tuple::{TaskId, Value};
use ahash::{AHashMap, AHasher};
use std::hash::{Hash, Hasher};
use thiserror::Error;

#[derive(Debug, Error)]
#[error("no grouping declared for stream '{0}'")]
pub struct UnknownStream(pub String);

#[derive(Debug, Clone)]
pub enum Grouping {
    /// Round-robin over the target tasks.
    Shuffle { targets: Vec<TaskId> },
    /// Hash of the selected value indices picks the target, so equal
    /// keys always land on the same task.
    Fields {
        targets: Vec<TaskId>,
        fields: Vec<usize>,
    },
    /// Every target receives a copy.
    All { targets: Vec<TaskId> },
    /// Destinations are named explicitly via `emit_direct`.
    Direct,
}

pub struct StreamRouter {
    streams: AHashMap<String, GroupingState>,
}

struct GroupingState {
    grouping: Grouping,
    /// Round-robin cursor for shuffle groupings.
    next: usize,
}

impl StreamRouter {
    pub fn new() -> Self {
        Self {
            streams: AHashMap::new(),
        }
    }

    pub fn declare(&mut self, stream: impl Into<String>, grouping: Grouping) -> &mut Self {
        self.streams
            .insert(stream.into(), GroupingState { grouping, next: 0 });
        self
    }

    pub fn is_declared(&self, stream: &str) -> bool {
        self.streams.contains_key(stream)
    }

    /// Resolve the destination tasks for one emit into `out`.
    pub fn select(
        &mut self,
        stream: &str,
        values: &[Value],
        out: &mut Vec<TaskId>,
    ) -> Result<(), UnknownStream> {
        out.clear();
        let state = self
            .streams
            .get_mut(stream)
            .ok_or_else(|| UnknownStream(stream.to_owned()))?;
        match &state.grouping {
            Grouping::Shuffle { targets } => {
                if !targets.is_empty() {
                    out.push(targets[state.next % targets.len()]);
                    state.next = state.next.wrapping_add(1);
                }
            }
            Grouping::Fields { targets, fields } => {
                if !targets.is_empty() {
                    let mut hasher = AHasher::default();
                    for &idx in fields {
                        values.get(idx).unwrap_or(&Value::Null).hash(&mut hasher);
                    }
                    out.push(targets[(hasher.finish() % targets.len() as u64) as usize]);
                }
            }
            Grouping::All { targets } => out.extend_from_slice(targets),
            Grouping::Direct => {}
        }
        Ok(())
    }
}

impl Default for StreamRouter {
    fn default() -> Self {
        Self::new()
    }
}
