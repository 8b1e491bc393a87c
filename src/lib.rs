#![doc(html_root_url = "https://docs.rs/wiremq/latest")]
//! Public API for the `wiremq` library.
//!
//! This crate is an asynchronous client for message brokers speaking the
//! OpenWire and STOMP wire protocols. It exposes a JMS-like surface —
//! [`ConnectionFactory`], [`Connection`], [`Session`], [`MessageProducer`],
//! [`MessageConsumer`], [`Destination`] — plus a higher-level
//! [`MessagingTemplate`] that scopes session pooling and resource
//! reclamation around user callbacks.

pub mod codec;
pub mod command;
pub mod connection;
pub mod consumer;
pub mod destination;
pub mod error;
pub mod lifecycle;
pub mod pool;
pub mod producer;
pub mod session;
pub mod template;
pub mod uri;

mod correlation;
mod transport;

pub use command::{BrokerMessage, DeliveryMode, MessageBody};
pub use connection::{Connection, ConnectionFactory, ConnectionState};
pub use consumer::{
    ConsumerOptions, MessageConsumer, MessageListener, ReceivedMessage, DEFAULT_PREFETCH,
};
pub use destination::{Destination, DestinationKind};
pub use error::{MessagingError, Result};
pub use lifecycle::ResourceLifecycleManager;
pub use pool::{PooledSession, SessionPool};
pub use producer::{MessageProducer, SendQos};
pub use session::{AckMode, Session, SessionState};
pub use template::{
    MessageCreator, MessagingTemplate, ProducerCallback, ReceiveTimeout, SessionCallback,
};
pub use uri::{BrokerUri, UriOptions, WireFormatKind};
