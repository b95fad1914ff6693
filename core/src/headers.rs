//! Header names shared with upstream producers.
//!
//! The names are a configuration contract with the process engines that
//! publish message events, so they are carried as data rather than constants.
//! [`HeaderNames::default`] matches what the engines publish out of the box.

use crate::message::MessageBuilder;
use crate::payload::MessageEventPayload;
use serde::{Deserialize, Serialize};

/// Names of the headers the connector reads and writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeaderNames {
    /// BPMN message event type (`MESSAGE_SENT`, `MESSAGE_WAITING`, ...)
    pub event_type: String,
    /// Correlation id written by the enrichment stage
    pub correlation_id: String,
    /// BPMN message name
    pub message_name: String,
    /// BPMN message correlation key
    pub correlation_key: String,
    /// BPMN message business key
    pub business_key: String,
    /// Fully qualified name of the service that published the event
    pub service_full_name: String,
    /// Destination of an output command
    pub destination: String,
    /// Type of the payload carried by an output command
    pub payload_type: String,
    /// Failure description attached to messages sent to the error channel
    pub error: String,
}

impl Default for HeaderNames {
    fn default() -> Self {
        Self {
            event_type: "eventType".to_string(),
            correlation_id: "correlationId".to_string(),
            message_name: "messageEventName".to_string(),
            correlation_key: "messageEventCorrelationKey".to_string(),
            business_key: "messageEventBusinessKey".to_string(),
            service_full_name: "serviceFullName".to_string(),
            destination: "destination".to_string(),
            payload_type: "messagePayloadType".to_string(),
            error: "errorMessage".to_string(),
        }
    }
}

impl HeaderNames {
    /// Copy the business key, correlation key and name of `payload` into headers.
    ///
    /// Producers call this so that the connector can correlate a message
    /// without decoding its body.
    #[must_use]
    pub fn append_event_headers<P>(
        &self,
        builder: MessageBuilder<P>,
        payload: &MessageEventPayload,
    ) -> MessageBuilder<P> {
        builder
            .header_if_present(&self.business_key, payload.business_key.clone())
            .header_if_present(&self.correlation_key, payload.correlation_key.clone())
            .header(&self.message_name, payload.name.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;

    #[test]
    fn appends_payload_headers() {
        let names = HeaderNames::default();
        let payload = MessageEventPayload::new("order-paid")
            .with_correlation_key("order-1")
            .with_business_key("bk-1");

        let message = names
            .append_event_headers(Message::builder(()), &payload)
            .build();

        assert_eq!(message.headers().get_str("messageEventName"), Some("order-paid"));
        assert_eq!(
            message.headers().get_str("messageEventCorrelationKey"),
            Some("order-1")
        );
        assert_eq!(message.headers().get_str("messageEventBusinessKey"), Some("bk-1"));
    }

    #[test]
    fn absent_keys_are_not_written() {
        let names = HeaderNames::default();
        let message = names
            .append_event_headers(Message::builder(()), &MessageEventPayload::new("ping"))
            .build();

        assert!(!message.headers().contains("messageEventCorrelationKey"));
        assert!(!message.headers().contains("messageEventBusinessKey"));
    }
}
