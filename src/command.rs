//! Typed commands exchanged with the broker.
//!
//! Every unit of broker dialogue is a [`Command`]: a small header carrying
//! the optional correlation id and the response-required flag, plus a
//! [`CommandBody`] sum over the control, lifecycle, flow-control, and data
//! variants. Commands are plain values: `Clone` is a deep copy, `PartialEq`
//! is structural, and [`Command::accept`] dispatches by body tag into a
//! [`CommandVisitor`].

use std::fmt;

use crate::destination::Destination;
use crate::error::Result;

pub mod ids;
pub mod message;

pub use ids::{
    BrokerId, ConnectionId, ConsumerId, MessageId, ProducerId, SessionId, TransactionId,
};
pub use message::{BrokerMessage, DeliveryMode, MessageBody, DEFAULT_PRIORITY};

pub(crate) use ids::{next_connection_id, IdGenerator};

/// Stable numeric type tags, shared with the wire codecs.
pub mod tags {
    /// Tag for [`super::WireFormatInfo`].
    pub const WIRE_FORMAT_INFO: u8 = 1;
    /// Tag for [`super::ConnectionInfo`].
    pub const CONNECTION_INFO: u8 = 3;
    /// Tag for [`super::SessionInfo`].
    pub const SESSION_INFO: u8 = 4;
    /// Tag for [`super::TransactionInfo`].
    pub const TRANSACTION_INFO: u8 = 7;
    /// Tag for [`super::ConsumerInfo`].
    pub const CONSUMER_INFO: u8 = 5;
    /// Tag for [`super::ProducerInfo`].
    pub const PRODUCER_INFO: u8 = 6;
    /// Tag for [`super::KeepAlive`].
    pub const KEEP_ALIVE: u8 = 10;
    /// Tag for [`super::ShutdownInfo`].
    pub const SHUTDOWN_INFO: u8 = 11;
    /// Tag for [`super::RemoveInfo`].
    pub const REMOVE_INFO: u8 = 12;
    /// Tag for [`super::DestinationInfo`].
    pub const DESTINATION_INFO: u8 = 8;
    /// Tag for [`super::ConsumerControl`].
    pub const CONSUMER_CONTROL: u8 = 17;
    /// Tag for [`super::MessagePull`].
    pub const MESSAGE_PULL: u8 = 20;
    /// Tag for [`super::MessageAck`].
    pub const MESSAGE_ACK: u8 = 22;
    /// Tag for [`super::BrokerMessage`](crate::command::BrokerMessage).
    pub const MESSAGE: u8 = 23;
    /// Tag for [`super::Response`].
    pub const RESPONSE: u8 = 30;
    /// Tag for [`super::ExceptionResponse`].
    pub const EXCEPTION_RESPONSE: u8 = 31;
}

/// Header fields common to every command.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandHeader {
    /// Correlator-assigned id, absent on commands sent oneway.
    pub command_id: Option<i32>,
    /// Whether the sender expects a [`Response`] or [`ExceptionResponse`].
    pub response_required: bool,
}

/// Protocol version and feature flags exchanged at connect time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WireFormatInfo {
    /// Highest protocol version the sender supports.
    pub version: i32,
    /// Liveness window the sender will enforce, in millis.
    pub max_inactivity_duration: i64,
    /// Upper bound the sender accepts for a single frame.
    pub max_frame_size: i64,
    /// Marshal cache size hint.
    pub cache_size: i32,
    /// Whether the sender can marshal the tight encoding.
    pub tight_encoding_enabled: bool,
    /// Whether frames omit the size prefix.
    pub size_prefix_disabled: bool,
    /// TCP_NODELAY hint for the peer.
    pub tcp_no_delay_enabled: bool,
}

impl Default for WireFormatInfo {
    fn default() -> Self {
        Self {
            version: 1,
            max_inactivity_duration: 30_000,
            max_frame_size: 16 * 1024 * 1024,
            cache_size: 1024,
            tight_encoding_enabled: false,
            size_prefix_disabled: false,
            tcp_no_delay_enabled: true,
        }
    }
}

/// Liveness probe emitted by the inactivity monitor.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KeepAlive;

/// Announces an orderly close of the sending peer.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ShutdownInfo;

/// Registers a connection with the broker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Identity of the connection being registered.
    pub connection_id: ConnectionId,
    /// Application-chosen client id, empty when unset.
    pub client_id: String,
    /// Credentials, empty when anonymous.
    pub user_name: String,
    /// Credentials, empty when anonymous.
    pub password: String,
}

/// Registers a session under an existing connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionInfo {
    /// Identity of the session being registered.
    pub session_id: SessionId,
}

/// Operation requested by a [`TransactionInfo`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionOperation {
    /// Open a unit of work.
    Begin,
    /// Make everything in the unit of work permanent.
    Commit,
    /// Discard the unit of work; consumed messages are redelivered.
    Rollback,
}

/// Opens or closes a local transaction at the broker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransactionInfo {
    /// Connection the transaction belongs to.
    pub connection_id: ConnectionId,
    /// Identity of the transaction.
    pub transaction_id: TransactionId,
    /// Whether to begin, commit, or roll back.
    pub operation_type: TransactionOperation,
}

/// Registers a consumer and opens its prefetch window.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConsumerInfo {
    /// Identity of the consumer being registered.
    pub consumer_id: ConsumerId,
    /// Source of messages for this consumer.
    pub destination: Destination,
    /// Flow-control credit the broker may push unacknowledged.
    pub prefetch_size: i32,
    /// Optional message selector expression.
    pub selector: Option<String>,
    /// Suppress messages published on the same connection.
    pub no_local: bool,
}

/// Registers a producer, optionally bound to a fixed destination.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProducerInfo {
    /// Identity of the producer being registered.
    pub producer_id: ProducerId,
    /// Fixed target, absent for anonymous producers.
    pub destination: Option<Destination>,
}

/// Operation requested by a [`DestinationInfo`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DestinationOperation {
    /// Create the destination.
    Add,
    /// Remove the destination.
    Remove,
}

/// Creates or removes a destination at the broker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DestinationInfo {
    /// Connection performing the operation.
    pub connection_id: ConnectionId,
    /// Destination being added or removed.
    pub destination: Destination,
    /// Whether to add or remove.
    pub operation_type: DestinationOperation,
    /// Broker-side timeout for the operation, millis.
    pub timeout: i64,
    /// Brokers the command has traversed.
    pub broker_path: Vec<BrokerId>,
}

/// Entity whose broker-side registration a [`RemoveInfo`] releases.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RemovedEntity {
    /// A whole connection.
    Connection(ConnectionId),
    /// A session and everything under it.
    Session(SessionId),
    /// A single consumer.
    Consumer(ConsumerId),
    /// A single producer.
    Producer(ProducerId),
}

/// Releases a broker-side registration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoveInfo {
    /// What is being removed.
    pub object: RemovedEntity,
}

/// Broker-initiated consumer flow control.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConsumerControl {
    /// Consumer being controlled.
    pub consumer_id: ConsumerId,
    /// Destination scope, when the control is destination-wide.
    pub destination: Option<Destination>,
    /// Close the consumer.
    pub close: bool,
    /// New prefetch credit.
    pub prefetch: i32,
    /// Discard the consumer's undelivered prefetched messages.
    pub flush: bool,
    /// Resume dispatch.
    pub start: bool,
    /// Suspend dispatch.
    pub stop: bool,
}

/// Requests a single message for a zero-prefetch consumer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessagePull {
    /// Consumer pulling.
    pub consumer_id: ConsumerId,
    /// Destination being pulled from.
    pub destination: Destination,
    /// How long the broker may hold the pull open, millis; `-1` waits
    /// indefinitely, `0` answers immediately.
    pub timeout: i64,
    /// Optional application correlation key.
    pub correlation_id: Option<String>,
    /// Specific message requested, when known.
    pub message_id: Option<MessageId>,
}

/// How delivered messages are being acknowledged.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AckType {
    /// Delivery notification only; the messages stay broker-owned.
    Delivered,
    /// Consumed: the broker may discard the acknowledged window.
    Standard,
    /// The window should be redelivered.
    Redelivered,
    /// Acknowledge a single message out of order.
    Individual,
}

/// Acknowledges a window of delivered messages.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageAck {
    /// Consumer acknowledging.
    pub consumer_id: ConsumerId,
    /// Destination the messages came from.
    pub destination: Option<Destination>,
    /// Acknowledgement semantics.
    pub ack_type: AckType,
    /// First message of the acknowledged window.
    pub first_message_id: Option<MessageId>,
    /// Last message of the acknowledged window.
    pub last_message_id: Option<MessageId>,
    /// Number of messages covered.
    pub message_count: i32,
    /// Transaction the acknowledgement belongs to, when transacted.
    pub transaction_id: Option<TransactionId>,
}

/// Successful answer to a command that required a response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Response {
    /// `command_id` of the command being answered.
    pub correlation_id: i32,
}

/// Failure answer to a command that required a response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExceptionResponse {
    /// `command_id` of the command being answered.
    pub correlation_id: i32,
    /// Broker-supplied failure message.
    pub message: String,
    /// Class tag of the remote exception.
    pub exception_class: String,
}

/// The command payload variants.
#[derive(Clone, Debug, PartialEq)]
#[allow(missing_docs)]
pub enum CommandBody {
    WireFormatInfo(WireFormatInfo),
    KeepAlive(KeepAlive),
    ShutdownInfo(ShutdownInfo),
    ConnectionInfo(ConnectionInfo),
    SessionInfo(SessionInfo),
    TransactionInfo(TransactionInfo),
    ConsumerInfo(ConsumerInfo),
    ProducerInfo(ProducerInfo),
    DestinationInfo(DestinationInfo),
    RemoveInfo(RemoveInfo),
    ConsumerControl(ConsumerControl),
    MessagePull(MessagePull),
    Message(BrokerMessage),
    MessageAck(MessageAck),
    Response(Response),
    ExceptionResponse(ExceptionResponse),
}

impl CommandBody {
    /// The stable numeric tag identifying this variant on the wire.
    #[must_use]
    pub fn type_tag(&self) -> u8 {
        match self {
            Self::WireFormatInfo(_) => tags::WIRE_FORMAT_INFO,
            Self::KeepAlive(_) => tags::KEEP_ALIVE,
            Self::ShutdownInfo(_) => tags::SHUTDOWN_INFO,
            Self::ConnectionInfo(_) => tags::CONNECTION_INFO,
            Self::SessionInfo(_) => tags::SESSION_INFO,
            Self::TransactionInfo(_) => tags::TRANSACTION_INFO,
            Self::ConsumerInfo(_) => tags::CONSUMER_INFO,
            Self::ProducerInfo(_) => tags::PRODUCER_INFO,
            Self::DestinationInfo(_) => tags::DESTINATION_INFO,
            Self::RemoveInfo(_) => tags::REMOVE_INFO,
            Self::ConsumerControl(_) => tags::CONSUMER_CONTROL,
            Self::MessagePull(_) => tags::MESSAGE_PULL,
            Self::Message(_) => tags::MESSAGE,
            Self::MessageAck(_) => tags::MESSAGE_ACK,
            Self::Response(_) => tags::RESPONSE,
            Self::ExceptionResponse(_) => tags::EXCEPTION_RESPONSE,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::WireFormatInfo(_) => "WireFormatInfo",
            Self::KeepAlive(_) => "KeepAlive",
            Self::ShutdownInfo(_) => "ShutdownInfo",
            Self::ConnectionInfo(_) => "ConnectionInfo",
            Self::SessionInfo(_) => "SessionInfo",
            Self::TransactionInfo(_) => "TransactionInfo",
            Self::ConsumerInfo(_) => "ConsumerInfo",
            Self::ProducerInfo(_) => "ProducerInfo",
            Self::DestinationInfo(_) => "DestinationInfo",
            Self::RemoveInfo(_) => "RemoveInfo",
            Self::ConsumerControl(_) => "ConsumerControl",
            Self::MessagePull(_) => "MessagePull",
            Self::Message(_) => "Message",
            Self::MessageAck(_) => "MessageAck",
            Self::Response(_) => "Response",
            Self::ExceptionResponse(_) => "ExceptionResponse",
        }
    }
}

/// A complete command: header plus payload.
#[derive(Clone, Debug, PartialEq)]
pub struct Command {
    /// Correlation header.
    pub header: CommandHeader,
    /// Payload variant.
    pub body: CommandBody,
}

impl Command {
    /// Wrap a body with an empty header.
    #[must_use]
    pub fn new(body: CommandBody) -> Self {
        Self {
            header: CommandHeader::default(),
            body,
        }
    }

    /// The stable numeric tag of the payload.
    #[must_use]
    pub fn type_tag(&self) -> u8 {
        self.body.type_tag()
    }

    /// True for [`Response`] and [`ExceptionResponse`] payloads.
    #[must_use]
    pub fn is_response(&self) -> bool {
        matches!(
            self.body,
            CommandBody::Response(_) | CommandBody::ExceptionResponse(_)
        )
    }

    /// Dispatch this command into `visitor` by payload tag.
    ///
    /// # Errors
    ///
    /// Propagates whatever the visited `process_*` method returns.
    pub fn accept(&self, visitor: &mut dyn CommandVisitor) -> Result<()> {
        match &self.body {
            CommandBody::WireFormatInfo(info) => visitor.process_wire_format_info(info),
            CommandBody::KeepAlive(alive) => visitor.process_keep_alive(alive),
            CommandBody::ShutdownInfo(info) => visitor.process_shutdown_info(info),
            CommandBody::ConnectionInfo(info) => visitor.process_connection_info(info),
            CommandBody::SessionInfo(info) => visitor.process_session_info(info),
            CommandBody::TransactionInfo(info) => visitor.process_transaction_info(info),
            CommandBody::ConsumerInfo(info) => visitor.process_consumer_info(info),
            CommandBody::ProducerInfo(info) => visitor.process_producer_info(info),
            CommandBody::DestinationInfo(info) => visitor.process_destination_info(info),
            CommandBody::RemoveInfo(info) => visitor.process_remove_info(info),
            CommandBody::ConsumerControl(control) => visitor.process_consumer_control(control),
            CommandBody::MessagePull(pull) => visitor.process_message_pull(pull),
            CommandBody::Message(message) => visitor.process_message(message),
            CommandBody::MessageAck(ack) => visitor.process_message_ack(ack),
            CommandBody::Response(response) => visitor.process_response(response),
            CommandBody::ExceptionResponse(response) => {
                visitor.process_exception_response(response)
            }
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(tag={}", self.body.name(), self.type_tag())?;
        if let Some(id) = self.header.command_id {
            write!(f, ", commandId={id}")?;
        }
        if self.header.response_required {
            f.write_str(", responseRequired")?;
        }
        write!(f, ") {:?}", self.body)
    }
}

impl From<CommandBody> for Command {
    fn from(body: CommandBody) -> Self {
        Self::new(body)
    }
}

/// Tag-directed dispatch over command payloads.
///
/// Every method defaults to a no-op so implementors only handle the
/// variants they care about.
#[allow(missing_docs, unused_variables)]
pub trait CommandVisitor {
    fn process_wire_format_info(&mut self, info: &WireFormatInfo) -> Result<()> {
        Ok(())
    }
    fn process_keep_alive(&mut self, alive: &KeepAlive) -> Result<()> {
        Ok(())
    }
    fn process_shutdown_info(&mut self, info: &ShutdownInfo) -> Result<()> {
        Ok(())
    }
    fn process_connection_info(&mut self, info: &ConnectionInfo) -> Result<()> {
        Ok(())
    }
    fn process_session_info(&mut self, info: &SessionInfo) -> Result<()> {
        Ok(())
    }
    fn process_transaction_info(&mut self, info: &TransactionInfo) -> Result<()> {
        Ok(())
    }
    fn process_consumer_info(&mut self, info: &ConsumerInfo) -> Result<()> {
        Ok(())
    }
    fn process_producer_info(&mut self, info: &ProducerInfo) -> Result<()> {
        Ok(())
    }
    fn process_destination_info(&mut self, info: &DestinationInfo) -> Result<()> {
        Ok(())
    }
    fn process_remove_info(&mut self, info: &RemoveInfo) -> Result<()> {
        Ok(())
    }
    fn process_consumer_control(&mut self, control: &ConsumerControl) -> Result<()> {
        Ok(())
    }
    fn process_message_pull(&mut self, pull: &MessagePull) -> Result<()> {
        Ok(())
    }
    fn process_message(&mut self, message: &BrokerMessage) -> Result<()> {
        Ok(())
    }
    fn process_message_ack(&mut self, ack: &MessageAck) -> Result<()> {
        Ok(())
    }
    fn process_response(&mut self, response: &Response) -> Result<()> {
        Ok(())
    }
    fn process_exception_response(&mut self, response: &ExceptionResponse) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn consumer_control() -> Command {
        Command::new(CommandBody::ConsumerControl(ConsumerControl {
            consumer_id: ConsumerId {
                connection_id: "ID:test-1".into(),
                session_id: 1,
                value: 4,
            },
            destination: Some(Destination::queue("orders")),
            close: false,
            prefetch: 100,
            flush: false,
            start: true,
            stop: false,
        }))
    }

    #[test]
    fn clone_is_a_distinct_deep_copy() {
        let original = consumer_control();
        let copy = original.clone();
        assert_eq!(original, copy);
        // Mutating the copy must not leak into the original.
        let mut copy = copy;
        if let CommandBody::ConsumerControl(control) = &mut copy.body {
            control.prefetch = 0;
        }
        assert_ne!(original, copy);
    }

    #[test]
    fn equality_distinguishes_null_from_set_fields() {
        let with_dest = consumer_control();
        let mut without_dest = with_dest.clone();
        if let CommandBody::ConsumerControl(control) = &mut without_dest.body {
            control.destination = None;
        }
        assert_ne!(with_dest, without_dest);
    }

    #[test]
    fn visitor_dispatches_by_tag() {
        #[derive(Default)]
        struct Recorder {
            controls: usize,
            others: usize,
        }
        impl CommandVisitor for Recorder {
            fn process_consumer_control(&mut self, _control: &ConsumerControl) -> Result<()> {
                self.controls += 1;
                Ok(())
            }
            fn process_keep_alive(&mut self, _alive: &KeepAlive) -> Result<()> {
                self.others += 1;
                Ok(())
            }
        }

        let mut recorder = Recorder::default();
        consumer_control().accept(&mut recorder).expect("accept");
        Command::new(CommandBody::KeepAlive(KeepAlive))
            .accept(&mut recorder)
            .expect("accept");
        assert_eq!(recorder.controls, 1);
        assert_eq!(recorder.others, 1);
    }

    #[test]
    fn tags_are_stable() {
        assert_eq!(consumer_control().type_tag(), tags::CONSUMER_CONTROL);
        assert_eq!(
            Command::new(CommandBody::Response(Response { correlation_id: 9 })).type_tag(),
            tags::RESPONSE
        );
    }

    #[test]
    fn display_dumps_header_and_body() {
        let mut command = consumer_control();
        command.header.command_id = Some(7);
        command.header.response_required = true;
        let dump = command.to_string();
        assert!(dump.contains("ConsumerControl"));
        assert!(dump.contains("commandId=7"));
        assert!(dump.contains("responseRequired"));
    }
}
