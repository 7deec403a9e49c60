//! Errors - エラー型と分類
//!
//! Every failure a stage can record lands in a task's error list as a
//! `TaskError`. Nothing here crosses the scheduler as a panic or `Result`.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use super::ids::{ObjectId, TaskId};

/// Which part of a store request was absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestComponent {
    Entity,
    Property,
    Metadata,
}

impl fmt::Display for RequestComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestComponent::Entity => f.write_str("entity"),
            RequestComponent::Property => f.write_str("property"),
            RequestComponent::Metadata => f.write_str("metadata"),
        }
    }
}

/// ErrorKind は実行エラーの分類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Condition,
    Request,
    Transport,
    Payload,
    Persistence,
    Scheduling,
}

/// An error recorded by a task and reported to its observers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    #[error("condition '{condition}' failed")]
    ConditionFailed { condition: String },

    #[error("request is missing its {0}")]
    MissingRequestComponent(RequestComponent),

    #[error("unsupported payload type: {0}")]
    UnsupportedPayloadType(String),

    #[error("transport failure: {0}")]
    TransportFailure(String),

    #[error("decode failure: {0}")]
    DecodeFailure(String),

    /// Objects of an update or delete beyond the one the request addressed.
    #[error("{} object(s) not addressed by the request", objects.len())]
    Unaddressed { objects: Vec<ObjectId> },

    #[error("commit failed for {} item(s)", affected.len())]
    CommitFailure { affected: Vec<ObjectId> },

    #[error("dependency cycle through {task}")]
    DependencyCycle { task: TaskId },

    #[error("{0}")]
    Other(String),
}

impl TaskError {
    pub fn condition_failed(condition: impl Into<String>) -> Self {
        TaskError::ConditionFailed {
            condition: condition.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            TaskError::ConditionFailed { .. } => ErrorKind::Condition,
            TaskError::MissingRequestComponent(_) | TaskError::Unaddressed { .. } => {
                ErrorKind::Request
            }
            TaskError::TransportFailure(_) => ErrorKind::Transport,
            TaskError::UnsupportedPayloadType(_) | TaskError::DecodeFailure(_) => {
                ErrorKind::Payload
            }
            TaskError::CommitFailure { .. } => ErrorKind::Persistence,
            TaskError::DependencyCycle { .. } | TaskError::Other(_) => ErrorKind::Scheduling,
        }
    }

    /// The condition name, for `ConditionFailed` errors.
    pub fn condition_name(&self) -> Option<&str> {
        match self {
            TaskError::ConditionFailed { condition } => Some(condition),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_failure() {
        let err = TaskError::condition_failed("RequestData");
        assert_eq!(err.to_string(), "condition 'RequestData' failed");
        assert_eq!(err.condition_name(), Some("RequestData"));

        let err = TaskError::MissingRequestComponent(RequestComponent::Entity);
        assert_eq!(err.to_string(), "request is missing its entity");

        let err = TaskError::CommitFailure {
            affected: vec![ObjectId::new("a"), ObjectId::new("b")],
        };
        assert_eq!(err.to_string(), "commit failed for 2 item(s)");

        let err = TaskError::Unaddressed {
            objects: vec![ObjectId::new("b")],
        };
        assert_eq!(err.to_string(), "1 object(s) not addressed by the request");
        assert_eq!(err.kind(), ErrorKind::Request);
    }

    #[test]
    fn kinds_classify_errors() {
        assert_eq!(
            TaskError::TransportFailure("timeout".into()).kind(),
            ErrorKind::Transport
        );
        assert_eq!(
            TaskError::UnsupportedPayloadType("video".into()).kind(),
            ErrorKind::Payload
        );
        assert_eq!(
            TaskError::CommitFailure { affected: vec![] }.kind(),
            ErrorKind::Persistence
        );
    }
}
