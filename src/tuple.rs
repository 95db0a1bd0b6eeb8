//! The data model: values, tuples, in-flight metadata, and the tagged
//! message type flowing through every bounded queue.

use crate::spout::Credentials;
use enum_as_inner::EnumAsInner;
use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};

/// Task ids are assigned by the topology scheduler; the executor treats
/// them as opaque addresses.
pub type TaskId = u32;

/// Stream-id constants recognised on a receive queue. Wire-stable.
pub mod streams {
    /// The implicit output stream of a component.
    pub const DEFAULT: &str = "default";

    pub const SYSTEM_FLUSH: &str = "__system_flush";
    pub const SYSTEM_TICK: &str = "__system_tick";
    pub const METRICS_TICK: &str = "__metrics_tick";
    pub const CREDENTIALS_CHANGED: &str = "__credentials_changed";
    pub const ACK_INIT: &str = "__ack_init";
    pub const ACK_ACK: &str = "__ack_ack";
    pub const ACK_FAIL: &str = "__ack_fail";
    pub const ACK_RESET_TIMEOUT: &str = "__ack_reset_timeout";
}

/// One field of a tuple.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Blob(Vec<u8>),
}

// Fields groupings hash selected values; floats hash by bit pattern.
impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Value::Null => state.write_u8(0),
            Value::Bool(b) => {
                state.write_u8(1);
                b.hash(state);
            }
            Value::Int(i) => {
                state.write_u8(2);
                i.hash(state);
            }
            Value::Float(f) => {
                state.write_u8(3);
                f.to_bits().hash(state);
            }
            Value::Str(s) => {
                state.write_u8(4);
                s.hash(state);
            }
            Value::Blob(b) => {
                state.write_u8(5);
                b.hash(state);
            }
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

/// An ordered list of values tagged with its source stream and the
/// emitting task. Immutable once published.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tuple {
    pub src_task: TaskId,
    pub stream: String,
    pub values: Vec<Value>,
    /// Root id of the tuple tree, present when the emit was anchored.
    pub anchor: Option<u64>,
}

impl Tuple {
    pub fn new(src_task: TaskId, stream: impl Into<String>, values: Vec<Value>) -> Self {
        Self {
            src_task,
            stream: stream.into(),
            values,
            anchor: None,
        }
    }

    pub fn anchored(mut self, root_id: u64) -> Self {
        self.anchor = Some(root_id);
        self
    }
}

/// A tuple bound to its destination task. Constructed at emit, consumed
/// by local delivery or serialization.
#[derive(Debug, Clone, PartialEq)]
pub struct AddressedTuple {
    pub dest: TaskId,
    pub tuple: Tuple,
}

/// Metadata for one in-flight emitted message, held in the pending map
/// from emit until ack, fail, or timeout.
#[derive(Debug, Clone)]
pub struct TupleInfo<M> {
    pub root_id: u64,
    pub message_id: Option<M>,
    pub task_id: TaskId,
    pub stream: String,
    /// Milliseconds since the executor's time origin; 0 means the emit
    /// was not timestamped and latency is not measured for it.
    pub timestamp_ms: u64,
}

/// Payload of an ack or fail control message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckMsg {
    /// Destination task of the control message; must match the emitter
    /// recorded in the pending entry.
    pub task: TaskId,
    pub root_id: u64,
    /// Tuple-tree completion time measured by the acker, if it tracked one.
    pub time_delta_ms: Option<u64>,
}

/// Everything that can appear on a bounded queue.
///
/// A tagged variant instead of opaque references: consumers dispatch
/// with an exhaustive match, and the shutdown sentinel is an ordinary
/// arm rather than a shared singleton.
#[derive(Debug, Clone, EnumAsInner)]
pub enum QueueMsg {
    Tuple(AddressedTuple),
    Ack(AckMsg),
    Fail(AckMsg),
    /// Refresh the pending entry for a root id into the newest bucket.
    ResetTimeout(u64),
    /// Rotate the pending map; drives timeouts.
    Tick,
    /// Flush staged output (local batches and remote map).
    Flush,
    /// Snapshot and publish executor metrics.
    MetricsTick,
    CredsChanged(Credentials),
    /// Wakes a consumer that is being torn down.
    Interrupt,
}

impl QueueMsg {
    /// Classify a tuple arriving off the wire by its control stream id.
    ///
    /// The worker's receive path calls this once per inbound tuple so
    /// the executor can dispatch on a total enum instead of stream-id
    /// strings. Ack and fail tuples carry `(root_id, time_delta_ms)`;
    /// the destination task rides along for the emitter check. A
    /// malformed control tuple falls through as a data tuple.
    ///
    /// Credential updates carry an opaque map the tuple value model does
    /// not express; workers publish [`QueueMsg::CredsChanged`] directly.
    pub fn classify(at: AddressedTuple) -> QueueMsg {
        fn nth_u64(values: &[Value], n: usize) -> Option<u64> {
            match values.get(n) {
                Some(Value::Int(v)) => Some(*v as u64),
                _ => None,
            }
        }
        let stream = &at.tuple.stream;
        if stream == streams::SYSTEM_FLUSH {
            QueueMsg::Flush
        } else if stream == streams::SYSTEM_TICK {
            QueueMsg::Tick
        } else if stream == streams::METRICS_TICK {
            QueueMsg::MetricsTick
        } else if stream == streams::ACK_RESET_TIMEOUT {
            match nth_u64(&at.tuple.values, 0) {
                Some(root_id) => QueueMsg::ResetTimeout(root_id),
                None => QueueMsg::Tuple(at),
            }
        } else if stream == streams::ACK_ACK || stream == streams::ACK_FAIL {
            let root = nth_u64(&at.tuple.values, 0);
            let time_delta_ms = nth_u64(&at.tuple.values, 1);
            match root {
                Some(root_id) => {
                    let msg = AckMsg {
                        task: at.dest,
                        root_id,
                        time_delta_ms,
                    };
                    if stream == streams::ACK_ACK {
                        QueueMsg::Ack(msg)
                    } else {
                        QueueMsg::Fail(msg)
                    }
                }
                None => QueueMsg::Tuple(at),
            }
        } else {
            QueueMsg::Tuple(at)
        }
    }
}
