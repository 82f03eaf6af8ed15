//! Wire protocol types for pool-to-context communication.
//!
//! One channel per context (stdin/stdout of the subprocess):
//! - pool → context: `Init` once, then `Task` per dispatch, `Shutdown` on graceful stop
//! - context → pool: `Ready` once, then exactly one `Success` or `Error` per `Task`

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Identity of a pool entry (and therefore of its execution context).
///
/// Allocated from a process-wide monotonic counter, so an id is never reused
/// after its entry is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(u64);

static NEXT_ENTRY_ID: AtomicU64 = AtomicU64::new(1);

impl EntryId {
    pub fn next() -> Self {
        Self(NEXT_ENTRY_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl From<u64> for EntryId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for EntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ctx-{}", self.0)
    }
}

/// Identity of one dispatch of one task.
///
/// Replies carry it back so a reply that belongs to an earlier task on the
/// same entry can be recognised and dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(uuid::Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        let uuid = uuid::Uuid::parse_str(s)?;
        Ok(Self(uuid))
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Messages from the pool to a context.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContextRequest {
    /// First message after spawn.
    Init {
        entry_id: EntryId,
        memory_limit_mb: u64,
        task_timeout_ms: u64,
    },

    Task {
        task_id: TaskId,
        payload: serde_json::Value,
    },

    Shutdown,
}

/// Messages from a context to the pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContextResponse {
    /// Init accepted, context can take tasks.
    Ready { entry_id: EntryId },

    Success {
        task_id: TaskId,
        data: serde_json::Value,
    },

    /// Application-level failure of the task. The context stays usable.
    Error { task_id: TaskId, error: String },
}

impl ContextResponse {
    pub fn task_id(&self) -> Option<TaskId> {
        match self {
            Self::Ready { .. } => None,
            Self::Success { task_id, .. } | Self::Error { task_id, .. } => Some(*task_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_task_id() -> TaskId {
        TaskId::parse("550e8400-e29b-41d4-a716-446655440000").unwrap()
    }

    #[test]
    fn entry_ids_are_monotonic() {
        let a = EntryId::next();
        let b = EntryId::next();
        assert!(b > a);
        assert_ne!(a, b);
    }

    #[test]
    fn entry_id_display() {
        assert_eq!(EntryId::from(7).to_string(), "ctx-7");
    }

    #[test]
    fn init_serializes() {
        let req = ContextRequest::Init {
            entry_id: EntryId::from(3),
            memory_limit_mb: 1024,
            task_timeout_ms: 30_000,
        };
        insta::assert_json_snapshot!(req, @r#"
        {
          "type": "init",
          "entry_id": 3,
          "memory_limit_mb": 1024,
          "task_timeout_ms": 30000
        }
        "#);
    }

    #[test]
    fn task_serializes() {
        let req = ContextRequest::Task {
            task_id: test_task_id(),
            payload: json!({"op": "echo", "value": 1}),
        };
        insta::assert_json_snapshot!(req, @r#"
        {
          "type": "task",
          "task_id": "550e8400-e29b-41d4-a716-446655440000",
          "payload": {
            "op": "echo",
            "value": 1
          }
        }
        "#);
    }

    #[test]
    fn shutdown_serializes() {
        insta::assert_json_snapshot!(ContextRequest::Shutdown, @r#"
        {
          "type": "shutdown"
        }
        "#);
    }

    #[test]
    fn error_serializes() {
        let resp = ContextResponse::Error {
            task_id: test_task_id(),
            error: "ReferenceError: x is not defined".to_string(),
        };
        insta::assert_json_snapshot!(resp, @r#"
        {
          "type": "error",
          "task_id": "550e8400-e29b-41d4-a716-446655440000",
          "error": "ReferenceError: x is not defined"
        }
        "#);
    }

    #[test]
    fn success_parses_from_worker_json() {
        let raw = r#"{"type":"success","task_id":"550e8400-e29b-41d4-a716-446655440000","data":{"ok":true}}"#;
        let resp: ContextResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(resp.task_id(), Some(test_task_id()));
        match resp {
            ContextResponse::Success { data, .. } => assert_eq!(data, json!({"ok": true})),
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn unknown_type_is_rejected() {
        let raw = r#"{"type":"pong"}"#;
        assert!(serde_json::from_str::<ContextResponse>(raw).is_err());
    }

    #[test]
    fn ready_has_no_task_id() {
        let resp = ContextResponse::Ready {
            entry_id: EntryId::from(1),
        };
        assert!(resp.task_id().is_none());
    }
}
