use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! wire_id {
    ($name:ident) => {
        #[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Generate a fresh identifier (UUIDv7, so lexically sortable).
            pub fn generate() -> Self {
                Self(Uuid::now_v7().to_string())
            }

            pub fn from_raw(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::convert::Infallible;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.to_owned()))
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

wire_id!(ProjectId);
wire_id!(ChatId);
wire_id!(UserId);
wire_id!(TaskId);

impl UserId {
    /// All-zero placeholder attached to turns before any login.
    pub fn anonymous() -> Self {
        Self(Uuid::nil().to_string())
    }

    pub fn is_anonymous(&self) -> bool {
        self.0 == Uuid::nil().to_string()
    }
}

/// Identifiers attached to every outbound turn.
///
/// `task_id` is assigned by the remote agent, one per turn, and is the
/// preferred cancellation target.
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct SessionContext {
    pub project_id: ProjectId,
    pub chat_id: ChatId,
    pub user_id: UserId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
}

/// Process-wide session state, shared by handle.
///
/// Identity fields change only through `login`/`reset`; the task id is
/// refreshed from every inbound turn that carries one.
#[derive(Clone)]
pub struct SessionHandle {
    inner: Arc<Mutex<SessionContext>>,
}

impl SessionHandle {
    pub fn new(project_id: ProjectId, chat_id: ChatId) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SessionContext {
                project_id,
                chat_id,
                user_id: UserId::anonymous(),
                task_id: None,
            })),
        }
    }

    /// Replace the anonymous sentinel with a real user.
    pub fn login(&self, user_id: UserId) {
        self.inner.lock().user_id = user_id;
    }

    /// Back to the anonymous sentinel; forgets the active task.
    pub fn reset(&self) {
        let mut ctx = self.inner.lock();
        ctx.user_id = UserId::anonymous();
        ctx.task_id = None;
    }

    /// Remember the task id the remote issued for the current turn.
    pub fn record_task(&self, task_id: TaskId) {
        self.inner.lock().task_id = Some(task_id);
    }

    pub fn task_id(&self) -> Option<TaskId> {
        self.inner.lock().task_id.clone()
    }

    pub fn chat_id(&self) -> ChatId {
        self.inner.lock().chat_id.clone()
    }

    pub fn snapshot(&self) -> SessionContext {
        self.inner.lock().clone()
    }
}
