//! Identifier records for broker-facing entities.
//!
//! Identity is hierarchical: a session id embeds its connection id, consumer
//! and producer ids embed their session coordinates, and a message id embeds
//! the producer that created it plus a monotonically increasing sequence.
//! Equality is structural throughout, and ids never change once assigned.

use std::fmt;
use std::process;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Globally unique identifier for a connection.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionId {
    /// Opaque unique value minted at connect time.
    pub value: String,
}

impl ConnectionId {
    /// Create a connection id from a pre-minted value.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
        }
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

/// Identifier of a session within a connection.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SessionId {
    /// Owning connection.
    pub connection_id: String,
    /// Per-connection session counter.
    pub value: i64,
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.connection_id, self.value)
    }
}

/// Identifier of a consumer within a session.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ConsumerId {
    /// Owning connection.
    pub connection_id: String,
    /// Owning session counter.
    pub session_id: i64,
    /// Per-connection consumer counter.
    pub value: i64,
}

impl ConsumerId {
    /// Id of the session this consumer belongs to.
    #[must_use]
    pub fn parent(&self) -> SessionId {
        SessionId {
            connection_id: self.connection_id.clone(),
            value: self.session_id,
        }
    }
}

impl fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.connection_id, self.session_id, self.value)
    }
}

/// Identifier of a producer within a session.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ProducerId {
    /// Owning connection.
    pub connection_id: String,
    /// Owning session counter.
    pub session_id: i64,
    /// Per-connection producer counter.
    pub value: i64,
}

impl fmt::Display for ProducerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.connection_id, self.session_id, self.value)
    }
}

/// Identifier of a message, derived from its producer.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MessageId {
    /// Producer that created the message.
    pub producer_id: ProducerId,
    /// Monotonically increasing per-producer sequence.
    pub producer_sequence_id: i64,
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.producer_id, self.producer_sequence_id)
    }
}

/// Identifier of a local transaction, scoped to its connection.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TransactionId {
    /// Owning connection.
    pub connection_id: String,
    /// Per-connection transaction counter.
    pub value: i64,
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TX:{}:{}", self.connection_id, self.value)
    }
}

/// Identifier a broker reports for itself.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct BrokerId {
    /// Broker-assigned unique value.
    pub value: String,
}

impl fmt::Display for BrokerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

static CONNECTION_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Mint a process-unique connection id value.
pub(crate) fn next_connection_id() -> ConnectionId {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    let seq = CONNECTION_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    ConnectionId::new(format!("ID:{}-{}-{}", process::id(), millis, seq))
}

/// Per-connection counters for the ids derived from it.
#[derive(Debug)]
pub(crate) struct IdGenerator {
    connection_id: ConnectionId,
    sessions: AtomicI64,
    consumers: AtomicI64,
    producers: AtomicI64,
    transactions: AtomicI64,
}

impl IdGenerator {
    pub(crate) fn new(connection_id: ConnectionId) -> Self {
        Self {
            connection_id,
            sessions: AtomicI64::new(0),
            consumers: AtomicI64::new(0),
            producers: AtomicI64::new(0),
            transactions: AtomicI64::new(0),
        }
    }

    pub(crate) fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    pub(crate) fn next_session_id(&self) -> SessionId {
        SessionId {
            connection_id: self.connection_id.value.clone(),
            value: self.sessions.fetch_add(1, Ordering::Relaxed) + 1,
        }
    }

    pub(crate) fn next_consumer_id(&self, session: &SessionId) -> ConsumerId {
        ConsumerId {
            connection_id: session.connection_id.clone(),
            session_id: session.value,
            value: self.consumers.fetch_add(1, Ordering::Relaxed) + 1,
        }
    }

    pub(crate) fn next_producer_id(&self, session: &SessionId) -> ProducerId {
        ProducerId {
            connection_id: session.connection_id.clone(),
            session_id: session.value,
            value: self.producers.fetch_add(1, Ordering::Relaxed) + 1,
        }
    }

    pub(crate) fn next_transaction_id(&self) -> TransactionId {
        TransactionId {
            connection_id: self.connection_id.value.clone(),
            value: self.transactions.fetch_add(1, Ordering::Relaxed) + 1,
        }
    }
}
