//! Message values exchanged with the broker.
//!
//! A [`BrokerMessage`] is the data-plane command payload: a JMS-style
//! header block plus a typed body. The value itself is plain data so it can
//! be cloned, compared, and marshaled; delivery-time concerns such as
//! acknowledgement live on the consumer wrapper, not here.

use std::collections::BTreeMap;
use std::fmt;

use crate::command::ids::{ConsumerId, MessageId, TransactionId};
use crate::destination::Destination;

/// Persistence requested for a message.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Survives a broker restart.
    #[default]
    Persistent,
    /// May be dropped on broker failure.
    NonPersistent,
}

/// Default message priority, the middle of the 0..=9 JMS range.
pub const DEFAULT_PRIORITY: u8 = 4;

/// Typed message payload.
#[derive(Clone, Debug, PartialEq)]
pub enum MessageBody {
    /// No payload.
    Empty,
    /// UTF-8 text.
    Text(String),
    /// Raw bytes.
    Bytes(Vec<u8>),
    /// String-keyed map entries.
    Map(BTreeMap<String, String>),
}

/// A message as carried on the wire.
#[derive(Clone, Debug, PartialEq)]
pub struct BrokerMessage {
    /// Identity assigned by the sending producer, absent until send.
    pub message_id: Option<MessageId>,
    /// Where the message is (or was) addressed.
    pub destination: Option<Destination>,
    /// Destination a reply should be sent to.
    pub reply_to: Option<Destination>,
    /// Application correlation key.
    pub correlation_id: Option<String>,
    /// Persistence of the message.
    pub delivery_mode: DeliveryMode,
    /// Priority in 0..=9.
    pub priority: u8,
    /// Broker epoch millis at send, zero when timestamps are disabled.
    pub timestamp: i64,
    /// Absolute expiry in epoch millis, zero for no expiry.
    pub expiration: i64,
    /// Set by the broker when a message is delivered again.
    pub redelivered: bool,
    /// Consumer the broker dispatched this message to; absent on send.
    pub target_consumer_id: Option<ConsumerId>,
    /// Transaction the send belongs to, when the session is transacted.
    pub transaction_id: Option<TransactionId>,
    /// String properties attached by the application.
    pub properties: BTreeMap<String, String>,
    /// Typed payload.
    pub body: MessageBody,
}

impl BrokerMessage {
    /// Create an empty message addressed nowhere.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            message_id: None,
            destination: None,
            reply_to: None,
            correlation_id: None,
            delivery_mode: DeliveryMode::default(),
            priority: DEFAULT_PRIORITY,
            timestamp: 0,
            expiration: 0,
            redelivered: false,
            target_consumer_id: None,
            transaction_id: None,
            properties: BTreeMap::new(),
            body: MessageBody::Empty,
        }
    }

    /// Create a text message.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            body: MessageBody::Text(text.into()),
            ..Self::empty()
        }
    }

    /// Create a bytes message.
    #[must_use]
    pub fn bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            body: MessageBody::Bytes(bytes.into()),
            ..Self::empty()
        }
    }

    /// Create a map message.
    #[must_use]
    pub fn map(entries: BTreeMap<String, String>) -> Self {
        Self {
            body: MessageBody::Map(entries),
            ..Self::empty()
        }
    }

    /// The text payload, when the body is text.
    #[must_use]
    pub fn body_text(&self) -> Option<&str> {
        match &self.body {
            MessageBody::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Set a string property, replacing any previous value.
    pub fn set_property(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.properties.insert(key.into(), value.into());
    }

    /// Read a string property.
    #[must_use]
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }
}

impl fmt::Display for BrokerMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Message {{ id: ")?;
        match &self.message_id {
            Some(id) => write!(f, "{id}")?,
            None => f.write_str("unassigned")?,
        }
        if let Some(dest) = &self.destination {
            write!(f, ", destination: {dest}")?;
        }
        let body = match &self.body {
            MessageBody::Empty => "empty".to_owned(),
            MessageBody::Text(text) => format!("text[{}]", text.len()),
            MessageBody::Bytes(bytes) => format!("bytes[{}]", bytes.len()),
            MessageBody::Map(map) => format!("map[{}]", map.len()),
        };
        write!(f, ", body: {body} }}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructors_pick_the_body_variant() {
        assert_eq!(BrokerMessage::text("hi").body_text(), Some("hi"));
        assert!(matches!(
            BrokerMessage::bytes(vec![1, 2]).body,
            MessageBody::Bytes(_)
        ));
    }

    #[test]
    fn clones_compare_equal_structurally() {
        let mut message = BrokerMessage::text("payload");
        message.set_property("region", "eu");
        let copy = message.clone();
        assert_eq!(message, copy);
        assert_eq!(copy.property("region"), Some("eu"));
    }
}
