//! Process engine collaborator.
//!
//! The connector never executes BPMN itself. Once a message group is
//! released, the engine side resumes the waiting execution or starts a new
//! process instance through this trait.

use crate::BoxFuture;
use crate::payload::Variables;
use thiserror::Error;

/// Errors reported by the process engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// No execution with this id exists
    #[error("Execution not found: {0}")]
    ExecutionNotFound(String),

    /// No process definition subscribes to this message
    #[error("No process definition starts on message '{0}'")]
    NoStartSubscription(String),

    /// The engine failed to apply the command; a retry may succeed
    #[error("Engine error: {0}")]
    Other(String),
}

/// Entry points of the process engine used by the connector.
pub trait ProcessEngine: Send + Sync {
    /// Check whether the execution is still waiting to be triggered.
    ///
    /// # Errors
    ///
    /// Returns an [`EngineError`] if the engine cannot be queried.
    fn is_waiting<'a>(&'a self, execution_id: &'a str) -> BoxFuture<'a, Result<bool, EngineError>>;

    /// Resume a waiting execution with the given variables.
    ///
    /// Callers check [`ProcessEngine::is_waiting`] first.
    ///
    /// # Errors
    ///
    /// Returns an [`EngineError`] if the execution cannot be triggered.
    fn trigger<'a>(
        &'a self,
        execution_id: &'a str,
        variables: Variables,
    ) -> BoxFuture<'a, Result<(), EngineError>>;

    /// Start a process instance from a message, returning the instance id.
    ///
    /// # Errors
    ///
    /// Returns an [`EngineError`] if no instance could be started.
    fn start_by_message<'a>(
        &'a self,
        message_name: &'a str,
        business_key: Option<&'a str>,
        variables: Variables,
    ) -> BoxFuture<'a, Result<String, EngineError>>;
}
