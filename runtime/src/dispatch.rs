//! Engine-side consumer of released commands.
//!
//! [`EngineTriggerChannel`] is the output channel used when the connector runs
//! next to the process engine: instead of publishing the command, it applies
//! it directly.
//!
//! A receive command can race with the execution it targets: the execution
//! may have been cancelled, or may have already received the message. The
//! channel therefore asks the engine whether the execution is still waiting
//! and ignores the command otherwise.

use message_connector_core::payload::{MessagePayloadType, ReceiveMessagePayload, StartMessagePayload};
use message_connector_core::{
    BoxFuture, ChannelError, EngineError, HeaderNames, Message, MessageChannel, ProcessEngine,
};
use std::sync::Arc;

/// Applies released commands to a [`ProcessEngine`].
pub struct EngineTriggerChannel {
    engine: Arc<dyn ProcessEngine>,
    headers: HeaderNames,
}

impl EngineTriggerChannel {
    /// Create a channel driving `engine`.
    #[must_use]
    pub fn new(engine: Arc<dyn ProcessEngine>, headers: HeaderNames) -> Self {
        Self { engine, headers }
    }

    async fn receive(&self, command: ReceiveMessagePayload) -> Result<(), ChannelError> {
        let Some(execution_id) = command.execution_id.as_deref() else {
            return Err(ChannelError::Rejected(format!(
                "receive command for message '{}' has no execution id",
                command.name
            )));
        };

        if !self.engine.is_waiting(execution_id).await.map_err(rejected)? {
            tracing::debug!(
                execution_id,
                message = %command.name,
                "Execution is no longer waiting, ignoring receive command"
            );
            return Ok(());
        }

        self.engine
            .trigger(execution_id, command.variables)
            .await
            .map_err(rejected)?;
        tracing::info!(execution_id, message = %command.name, "Waiting execution triggered");
        Ok(())
    }

    async fn start(&self, command: StartMessagePayload) -> Result<(), ChannelError> {
        let instance_id = self
            .engine
            .start_by_message(&command.name, command.business_key.as_deref(), command.variables)
            .await
            .map_err(rejected)?;
        tracing::info!(instance_id = %instance_id, message = %command.name, "Process started by message");
        Ok(())
    }
}

/// Missing executions and subscriptions are permanent; anything else the
/// engine reports is worth retrying.
fn rejected(err: EngineError) -> ChannelError {
    match err {
        EngineError::Other(reason) => ChannelError::TransportError(format!("Engine error: {reason}")),
        EngineError::ExecutionNotFound(_) | EngineError::NoStartSubscription(_) => {
            ChannelError::Rejected(err.to_string())
        }
    }
}

fn decode<T: serde::de::DeserializeOwned>(body: &[u8]) -> Result<T, ChannelError> {
    serde_json::from_slice(body).map_err(|e| ChannelError::Serialization(e.to_string()))
}

impl MessageChannel for EngineTriggerChannel {
    fn send(&self, message: Message<Vec<u8>>) -> BoxFuture<'_, Result<(), ChannelError>> {
        Box::pin(async move {
            let payload_type = message
                .headers()
                .get_str(&self.headers.payload_type)
                .and_then(MessagePayloadType::parse);

            match payload_type {
                Some(MessagePayloadType::ReceiveMessagePayload) => {
                    self.receive(decode(message.payload())?).await
                }
                Some(MessagePayloadType::StartMessagePayload) => self.start(decode(message.payload())?).await,
                None => Err(ChannelError::Rejected(format!(
                    "missing or unknown '{}' header",
                    self.headers.payload_type
                ))),
            }
        })
    }
}
