//! Builders for inbound message events.
//!
//! Events are built the way a process engine publishes them: a JSON
//! [`MessageEventPayload`] body, the event type, the name / correlation key /
//! business key headers, and the publishing service's full name.

#![allow(clippy::unwrap_used)]
#![allow(clippy::missing_panics_doc)]

use message_connector_core::{
    CorrelationKey, EventMessage, HeaderNames, Message, MessageEventPayload, MessageEventType,
};

/// Builds raw and decoded message events.
#[derive(Debug, Clone)]
pub struct EventFactory {
    headers: HeaderNames,
    service: String,
}

impl Default for EventFactory {
    fn default() -> Self {
        Self::new(HeaderNames::default())
    }
}

impl EventFactory {
    /// Service name written to the service-full-name header by default.
    pub const DEFAULT_SERVICE: &'static str = "orders.order-service";

    /// Create a factory writing the given header names.
    #[must_use]
    pub fn new(headers: HeaderNames) -> Self {
        Self {
            headers,
            service: Self::DEFAULT_SERVICE.to_string(),
        }
    }

    /// Publish events as `service`.
    #[must_use]
    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = service.into();
        self
    }

    /// Header names in use.
    #[must_use]
    pub const fn headers(&self) -> &HeaderNames {
        &self.headers
    }

    /// Raw event of `event_type` carrying `payload`.
    #[must_use]
    pub fn event(&self, event_type: &MessageEventType, payload: &MessageEventPayload) -> Message<Vec<u8>> {
        let body = serde_json::to_vec(payload).unwrap();
        self.headers
            .append_event_headers(Message::builder(body), payload)
            .header(&self.headers.event_type, event_type.as_str())
            .header(&self.headers.service_full_name, self.service.clone())
            .build()
    }

    /// `MESSAGE_SENT` for `name`.
    #[must_use]
    pub fn sent(&self, name: &str, key: Option<&str>) -> Message<Vec<u8>> {
        self.event(&MessageEventType::MessageSent, &payload(name, key))
    }

    /// `MESSAGE_WAITING` for `name`, from `execution_id`.
    #[must_use]
    pub fn waiting(&self, name: &str, key: Option<&str>, execution_id: &str) -> Message<Vec<u8>> {
        self.event(
            &MessageEventType::MessageWaiting,
            &payload(name, key).with_execution_id(execution_id),
        )
    }

    /// `START_MESSAGE_DEPLOYED` for `name`.
    #[must_use]
    pub fn start_deployed(&self, name: &str, key: Option<&str>) -> Message<Vec<u8>> {
        self.event(&MessageEventType::StartMessageDeployed, &payload(name, key))
    }

    /// `MESSAGE_SUBSCRIPTION_CANCELLED` for `name`.
    #[must_use]
    pub fn cancelled(&self, name: &str, key: Option<&str>) -> Message<Vec<u8>> {
        self.event(&MessageEventType::MessageSubscriptionCancelled, &payload(name, key))
    }

    /// Decoded event with its correlation id already set, as the handler
    /// chain receives it.
    #[must_use]
    pub fn decoded(
        &self,
        event_type: &MessageEventType,
        payload: MessageEventPayload,
    ) -> EventMessage {
        let key = correlation_key(&payload.name, payload.correlation_key.as_deref());
        self.headers
            .append_event_headers(Message::builder(payload.clone()), &payload)
            .header(&self.headers.event_type, event_type.as_str())
            .header(&self.headers.service_full_name, self.service.clone())
            .header(&self.headers.correlation_id, key.as_str())
            .build()
    }
}

/// Payload for message `name` with an optional correlation key.
#[must_use]
pub fn payload(name: &str, key: Option<&str>) -> MessageEventPayload {
    let payload = MessageEventPayload::new(name);
    match key {
        Some(key) => payload.with_correlation_key(key),
        None => payload,
    }
}

/// Correlation key the flow derives for `name` and `key`.
#[must_use]
pub fn correlation_key(name: &str, key: Option<&str>) -> CorrelationKey {
    match key {
        Some(key) => CorrelationKey::new(format!("{name}:{key}")),
        None => CorrelationKey::new(name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_event_carries_correlation_headers() {
        let events = EventFactory::default();
        let message = events.waiting("order-paid", Some("42"), "exec-1");

        assert_eq!(message.headers().get_str("eventType"), Some("MESSAGE_WAITING"));
        assert_eq!(message.headers().get_str("messageEventName"), Some("order-paid"));
        assert_eq!(message.headers().get_str("messageEventCorrelationKey"), Some("42"));
        assert_eq!(
            message.headers().get_str("serviceFullName"),
            Some(EventFactory::DEFAULT_SERVICE)
        );

        let body: MessageEventPayload = serde_json::from_slice(message.payload()).unwrap();
        assert_eq!(body.execution_id.as_deref(), Some("exec-1"));
    }

    #[test]
    fn decoded_event_is_enriched() {
        let events = EventFactory::default();
        let message = events.decoded(&MessageEventType::MessageSent, payload("ping", None));
        assert_eq!(message.headers().get_str("correlationId"), Some("ping"));
    }
}
