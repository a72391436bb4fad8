//! Push notifications that wake streamers without waiting on the store.

use crate::errors::PushMessageError;
use crate::process::ProcessName;
use eventline_types::{StoredEvent, Token};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Subject that addresses every message for a process.
pub const ANY_SUBJECT: &str = "__ANY__";

/// Format tag of push message bodies.
pub const PUSH_FORMAT: &str = "text";

const SEPARATOR: &str = "\r\n";

/// Where a push message is delivered.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Destination {
    /// The receiving process.
    pub process_name: ProcessName,
    /// Message subject; streamers listen on [`ANY_SUBJECT`].
    pub subject: String,
}

impl Destination {
    /// The catch-all destination of `process_name`.
    pub fn any(process_name: ProcessName) -> Self {
        Self {
            process_name,
            subject: ANY_SUBJECT.to_owned(),
        }
    }
}

/// A committed event forwarded to a process over a [`NotificationBus`].
///
/// The body is `"<token>\r\n<event body>"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushMessage {
    /// Receiver of the message.
    pub destination: Destination,
    /// Event type of the forwarded event.
    pub message_type: String,
    /// Always [`PUSH_FORMAT`] for messages built by [`PushMessage::for_event`].
    pub format: String,
    /// Token and event body.
    pub body: String,
}

impl PushMessage {
    /// Builds the push message announcing `event` to `process_name`.
    pub fn for_event(process_name: ProcessName, event: &StoredEvent) -> Self {
        let body = event.body.as_deref().unwrap_or_default();
        Self {
            destination: Destination::any(process_name),
            message_type: event.event_type.clone(),
            format: PUSH_FORMAT.to_owned(),
            body: format!("{}{SEPARATOR}{body}", event.token),
        }
    }

    /// Reconstructs the forwarded event.
    ///
    /// The result has no stream coordinates; only the token, type and body
    /// travel in a push message.
    pub fn to_event(&self) -> Result<StoredEvent, PushMessageError> {
        let (token_text, body) = self
            .body
            .split_once(SEPARATOR)
            .ok_or(PushMessageError::MissingSeparator)?;
        let token = match token_text.parse::<Token>() {
            Ok(token @ Token::Numbered(_)) => token,
            _ => return Err(PushMessageError::InvalidToken(token_text.to_owned())),
        };

        Ok(StoredEvent {
            event_type: self.message_type.clone(),
            format: self.format.clone(),
            body: Some(body.to_owned()),
            stream_name: None,
            stream_version: 0,
            token,
        })
    }
}

/// Fan-out channel for push messages, keyed by [`Destination`].
pub trait NotificationBus: Send + Sync {
    /// Subscribes to messages addressed to `destination`.
    fn subscribe(&self, destination: &Destination) -> broadcast::Receiver<PushMessage>;

    /// Delivers `message` to current subscribers of its destination.
    ///
    /// Messages without subscribers are dropped.
    fn publish(&self, message: PushMessage);

    /// Announces a committed event to `process_name`.
    fn notify(&self, process_name: &ProcessName, event: &StoredEvent) {
        self.publish(PushMessage::for_event(process_name.clone(), event));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eventline_types::StreamName;

    fn process() -> ProcessName {
        ProcessName::try_new("billing").expect("valid process name")
    }

    fn event(token: u64) -> StoredEvent {
        StoredEvent {
            event_type: "InvoiceSent".to_owned(),
            format: "json".to_owned(),
            body: Some(r#"{"id":7}"#.to_owned()),
            stream_name: Some(StreamName::try_new("invoice-7").expect("valid stream name")),
            stream_version: 3,
            token: Token::Numbered(token),
        }
    }

    #[test]
    fn body_carries_token_and_payload() {
        let message = PushMessage::for_event(process(), &event(12));

        assert_eq!(message.body, "12\r\n{\"id\":7}");
        assert_eq!(message.format, PUSH_FORMAT);
        assert_eq!(message.destination.subject, ANY_SUBJECT);
        assert_eq!(message.message_type, "InvoiceSent");
    }

    #[test]
    fn parses_back_without_stream_coordinates() {
        let parsed = PushMessage::for_event(process(), &event(12))
            .to_event()
            .expect("well formed");

        assert_eq!(parsed.token, Token::Numbered(12));
        assert_eq!(parsed.body.as_deref(), Some(r#"{"id":7}"#));
        assert_eq!(parsed.stream_name, None);
        assert_eq!(parsed.stream_version, 0);
    }

    #[test]
    fn body_may_contain_the_separator() {
        let mut message = PushMessage::for_event(process(), &event(1));
        message.body = "1\r\nline one\r\nline two".to_owned();

        let parsed = message.to_event().expect("well formed");
        assert_eq!(parsed.body.as_deref(), Some("line one\r\nline two"));
    }

    #[test]
    fn rejects_missing_separator() {
        let mut message = PushMessage::for_event(process(), &event(1));
        message.body = "1 {}".to_owned();

        assert_eq!(message.to_event(), Err(PushMessageError::MissingSeparator));
    }

    #[test]
    fn rejects_sentinel_and_malformed_tokens() {
        let mut message = PushMessage::for_event(process(), &event(1));
        for token in ["", "*", "x"] {
            message.body = format!("{token}\r\n{{}}");
            assert_eq!(
                message.to_event(),
                Err(PushMessageError::InvalidToken(token.to_owned()))
            );
        }
    }
}
