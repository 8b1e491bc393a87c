//! Length-prefixed binary marshaling.
//!
//! Each frame is a 4-byte big-endian length followed by the payload: one
//! type-tag byte, the command header, then the body fields in registry
//! order. Marshaling is table-driven: a [`MarshalerRegistry`] maps every
//! type tag to its encode/decode pair, and the negotiated protocol version
//! selects the registry variant. This implementation marshals the loose
//! encoding only; tight encoding is negotiated off.

use std::collections::HashMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::command::{
    tags, AckType, BrokerId, BrokerMessage, Command, CommandBody, CommandHeader, ConnectionId,
    ConnectionInfo, ConsumerControl, ConsumerId, ConsumerInfo, DeliveryMode, DestinationInfo,
    DestinationOperation, ExceptionResponse, KeepAlive, MessageAck, MessageBody, MessageId,
    MessagePull, ProducerId, ProducerInfo, RemoveInfo, RemovedEntity, Response, SessionId,
    SessionInfo, ShutdownInfo, TransactionId, TransactionInfo, TransactionOperation,
    WireFormatInfo,
};
use crate::destination::{Destination, DestinationKind};
use crate::error::{MessagingError, Result};

/// Codec for the binary wire format.
#[derive(Debug)]
pub struct OpenWireCodec {
    registry: MarshalerRegistry,
    version: i32,
    max_frame_size: usize,
}

impl OpenWireCodec {
    /// Create a codec speaking the lowest protocol version.
    #[must_use]
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            registry: MarshalerRegistry::for_version(super::MIN_OPENWIRE_VERSION),
            version: super::MIN_OPENWIRE_VERSION,
            max_frame_size,
        }
    }

    /// The protocol version currently marshaled.
    #[must_use]
    pub fn version(&self) -> i32 {
        self.version
    }

    /// Switch to the registry for the negotiated version.
    pub fn set_version(&mut self, version: i32) {
        if version != self.version {
            self.registry = MarshalerRegistry::for_version(version);
            self.version = version;
        }
    }
}

impl Decoder for OpenWireCodec {
    type Item = Command;
    type Error = MessagingError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Command>> {
        if src.len() < 4 {
            return Ok(None);
        }
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&src[..4]);
        let declared = u32::from_be_bytes(len_bytes) as usize;
        if declared > self.max_frame_size {
            return Err(MessagingError::protocol(format!(
                "frame of {declared} bytes exceeds limit of {} bytes",
                self.max_frame_size
            )));
        }
        if src.len() < 4 + declared {
            src.reserve(4 + declared - src.len());
            return Ok(None);
        }
        src.advance(4);
        let mut reader = FrameReader::new(src.split_to(declared).freeze());

        let tag = reader.get_u8()?;
        let header = CommandHeader {
            command_id: reader.get_opt(FrameReader::get_i32)?,
            response_required: reader.get_bool()?,
        };
        let body = (self.registry.get(tag)?.decode)(&mut reader)?;
        Ok(Some(Command { header, body }))
    }
}

impl Encoder<Command> for OpenWireCodec {
    type Error = MessagingError;

    fn encode(&mut self, command: Command, dst: &mut BytesMut) -> Result<()> {
        let tag = command.type_tag();
        let mut payload = BytesMut::new();
        payload.put_u8(tag);
        put_opt(&mut payload, command.header.command_id.as_ref(), |p, id| {
            p.put_i32(*id);
            Ok(())
        })?;
        put_bool(&mut payload, command.header.response_required);
        (self.registry.get(tag)?.encode)(&command.body, &mut payload)?;

        if payload.len() > self.max_frame_size {
            return Err(MessagingError::protocol(format!(
                "outbound frame of {} bytes exceeds limit of {} bytes",
                payload.len(),
                self.max_frame_size
            )));
        }
        let declared = u32::try_from(payload.len())
            .map_err(|_| MessagingError::protocol("outbound frame exceeds u32 length prefix"))?;
        dst.reserve(4 + payload.len());
        dst.put_u32(declared);
        dst.extend_from_slice(&payload);
        Ok(())
    }
}

type EncodeFn = fn(&CommandBody, &mut BytesMut) -> Result<()>;
type DecodeFn = fn(&mut FrameReader) -> Result<CommandBody>;

struct Marshaler {
    encode: EncodeFn,
    decode: DecodeFn,
}

impl std::fmt::Debug for Marshaler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Marshaler")
    }
}

/// Encode/decode pairs keyed by type tag.
#[derive(Debug)]
struct MarshalerRegistry {
    entries: HashMap<u8, Marshaler>,
}

impl MarshalerRegistry {
    /// Build the registry for a negotiated version.
    ///
    /// All supported versions currently share one field layout; the hook
    /// exists so a later version can swap individual entries.
    fn for_version(_version: i32) -> Self {
        let mut entries = HashMap::new();
        let mut add = |tag: u8, encode: EncodeFn, decode: DecodeFn| {
            entries.insert(tag, Marshaler { encode, decode });
        };
        add(tags::WIRE_FORMAT_INFO, encode_wire_format_info, decode_wire_format_info);
        add(tags::KEEP_ALIVE, encode_unit, decode_keep_alive);
        add(tags::SHUTDOWN_INFO, encode_unit, decode_shutdown_info);
        add(tags::CONNECTION_INFO, encode_connection_info, decode_connection_info);
        add(tags::SESSION_INFO, encode_session_info, decode_session_info);
        add(tags::TRANSACTION_INFO, encode_transaction_info, decode_transaction_info);
        add(tags::CONSUMER_INFO, encode_consumer_info, decode_consumer_info);
        add(tags::PRODUCER_INFO, encode_producer_info, decode_producer_info);
        add(tags::DESTINATION_INFO, encode_destination_info, decode_destination_info);
        add(tags::REMOVE_INFO, encode_remove_info, decode_remove_info);
        add(tags::CONSUMER_CONTROL, encode_consumer_control, decode_consumer_control);
        add(tags::MESSAGE_PULL, encode_message_pull, decode_message_pull);
        add(tags::MESSAGE, encode_message, decode_message);
        add(tags::MESSAGE_ACK, encode_message_ack, decode_message_ack);
        add(tags::RESPONSE, encode_response, decode_response);
        add(tags::EXCEPTION_RESPONSE, encode_exception_response, decode_exception_response);
        Self { entries }
    }

    fn get(&self, tag: u8) -> Result<&Marshaler> {
        self.entries
            .get(&tag)
            .ok_or_else(|| MessagingError::protocol(format!("unknown command type tag {tag}")))
    }
}

/// Cursor over one received frame.
///
/// The transport hands over complete frames only, so running out of bytes
/// mid-field means the peer produced a malformed frame.
struct FrameReader {
    buf: Bytes,
}

impl FrameReader {
    fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    fn need(&self, bytes: usize) -> Result<()> {
        if self.buf.remaining() < bytes {
            return Err(MessagingError::protocol("truncated frame"));
        }
        Ok(())
    }

    fn get_u8(&mut self) -> Result<u8> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    fn get_bool(&mut self) -> Result<bool> {
        match self.get_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(MessagingError::protocol(format!(
                "invalid boolean encoding {other}"
            ))),
        }
    }

    fn get_u16(&mut self) -> Result<u16> {
        self.need(2)?;
        Ok(self.buf.get_u16())
    }

    fn get_u32(&mut self) -> Result<u32> {
        self.need(4)?;
        Ok(self.buf.get_u32())
    }

    fn get_i32(&mut self) -> Result<i32> {
        self.need(4)?;
        Ok(self.buf.get_i32())
    }

    fn get_i64(&mut self) -> Result<i64> {
        self.need(8)?;
        Ok(self.buf.get_i64())
    }

    fn get_string(&mut self) -> Result<String> {
        self.need(2)?;
        let len = self.buf.get_u16() as usize;
        self.need(len)?;
        let raw = self.buf.split_to(len);
        String::from_utf8(raw.to_vec())
            .map_err(|_| MessagingError::protocol("string field is not UTF-8"))
    }

    fn get_long_bytes(&mut self) -> Result<Vec<u8>> {
        self.need(4)?;
        let len = self.buf.get_u32() as usize;
        self.need(len)?;
        Ok(self.buf.split_to(len).to_vec())
    }

    fn get_long_string(&mut self) -> Result<String> {
        String::from_utf8(self.get_long_bytes()?)
            .map_err(|_| MessagingError::protocol("string field is not UTF-8"))
    }

    fn get_opt<T>(&mut self, read: impl FnOnce(&mut Self) -> Result<T>) -> Result<Option<T>> {
        if self.get_bool()? {
            Ok(Some(read(self)?))
        } else {
            Ok(None)
        }
    }
}

fn put_bool(dst: &mut BytesMut, value: bool) {
    dst.put_u8(u8::from(value));
}

fn put_string(dst: &mut BytesMut, value: &str) -> Result<()> {
    let len = u16::try_from(value.len())
        .map_err(|_| MessagingError::protocol("string field exceeds 64 KiB"))?;
    dst.put_u16(len);
    dst.put_slice(value.as_bytes());
    Ok(())
}

fn put_long_bytes(dst: &mut BytesMut, value: &[u8]) -> Result<()> {
    let len = u32::try_from(value.len())
        .map_err(|_| MessagingError::protocol("byte field exceeds 4 GiB"))?;
    dst.put_u32(len);
    dst.put_slice(value);
    Ok(())
}

fn put_opt<T>(
    dst: &mut BytesMut,
    value: Option<&T>,
    write: impl FnOnce(&mut BytesMut, &T) -> Result<()>,
) -> Result<()> {
    match value {
        Some(value) => {
            put_bool(dst, true);
            write(dst, value)
        }
        None => {
            put_bool(dst, false);
            Ok(())
        }
    }
}

fn put_connection_id(dst: &mut BytesMut, id: &ConnectionId) -> Result<()> {
    put_string(dst, &id.value)
}

fn get_connection_id(reader: &mut FrameReader) -> Result<ConnectionId> {
    Ok(ConnectionId::new(reader.get_string()?))
}

fn put_session_id(dst: &mut BytesMut, id: &SessionId) -> Result<()> {
    put_string(dst, &id.connection_id)?;
    dst.put_i64(id.value);
    Ok(())
}

fn get_session_id(reader: &mut FrameReader) -> Result<SessionId> {
    Ok(SessionId {
        connection_id: reader.get_string()?,
        value: reader.get_i64()?,
    })
}

fn put_consumer_id(dst: &mut BytesMut, id: &ConsumerId) -> Result<()> {
    put_string(dst, &id.connection_id)?;
    dst.put_i64(id.session_id);
    dst.put_i64(id.value);
    Ok(())
}

fn get_consumer_id(reader: &mut FrameReader) -> Result<ConsumerId> {
    Ok(ConsumerId {
        connection_id: reader.get_string()?,
        session_id: reader.get_i64()?,
        value: reader.get_i64()?,
    })
}

fn put_producer_id(dst: &mut BytesMut, id: &ProducerId) -> Result<()> {
    put_string(dst, &id.connection_id)?;
    dst.put_i64(id.session_id);
    dst.put_i64(id.value);
    Ok(())
}

fn get_producer_id(reader: &mut FrameReader) -> Result<ProducerId> {
    Ok(ProducerId {
        connection_id: reader.get_string()?,
        session_id: reader.get_i64()?,
        value: reader.get_i64()?,
    })
}

fn put_transaction_id(dst: &mut BytesMut, id: &TransactionId) -> Result<()> {
    put_string(dst, &id.connection_id)?;
    dst.put_i64(id.value);
    Ok(())
}

fn get_transaction_id(reader: &mut FrameReader) -> Result<TransactionId> {
    Ok(TransactionId {
        connection_id: reader.get_string()?,
        value: reader.get_i64()?,
    })
}

fn put_message_id(dst: &mut BytesMut, id: &MessageId) -> Result<()> {
    put_producer_id(dst, &id.producer_id)?;
    dst.put_i64(id.producer_sequence_id);
    Ok(())
}

fn get_message_id(reader: &mut FrameReader) -> Result<MessageId> {
    Ok(MessageId {
        producer_id: get_producer_id(reader)?,
        producer_sequence_id: reader.get_i64()?,
    })
}

fn destination_kind_tag(kind: DestinationKind) -> u8 {
    match kind {
        DestinationKind::Queue => 0,
        DestinationKind::Topic => 1,
        DestinationKind::TemporaryQueue => 2,
        DestinationKind::TemporaryTopic => 3,
    }
}

fn put_destination(dst: &mut BytesMut, destination: &Destination) -> Result<()> {
    dst.put_u8(destination_kind_tag(destination.kind()));
    put_string(dst, destination.physical_name())
}

fn get_destination(reader: &mut FrameReader) -> Result<Destination> {
    let kind = match reader.get_u8()? {
        0 => DestinationKind::Queue,
        1 => DestinationKind::Topic,
        2 => DestinationKind::TemporaryQueue,
        3 => DestinationKind::TemporaryTopic,
        other => {
            return Err(MessagingError::protocol(format!(
                "invalid destination kind {other}"
            )))
        }
    };
    let name = reader.get_string()?;
    Ok(match kind {
        DestinationKind::Queue => Destination::queue(name),
        DestinationKind::Topic => Destination::topic(name),
        temporary => Destination::temporary(temporary, name),
    })
}

fn mismatch(expected: &'static str) -> MessagingError {
    MessagingError::protocol(format!("marshaler invoked with wrong body, expected {expected}"))
}

fn encode_unit(_body: &CommandBody, _dst: &mut BytesMut) -> Result<()> {
    Ok(())
}

fn decode_keep_alive(_reader: &mut FrameReader) -> Result<CommandBody> {
    Ok(CommandBody::KeepAlive(KeepAlive))
}

fn decode_shutdown_info(_reader: &mut FrameReader) -> Result<CommandBody> {
    Ok(CommandBody::ShutdownInfo(ShutdownInfo))
}

fn encode_wire_format_info(body: &CommandBody, dst: &mut BytesMut) -> Result<()> {
    let CommandBody::WireFormatInfo(info) = body else {
        return Err(mismatch("WireFormatInfo"));
    };
    dst.put_i32(info.version);
    dst.put_i64(info.max_inactivity_duration);
    dst.put_i64(info.max_frame_size);
    dst.put_i32(info.cache_size);
    put_bool(dst, info.tight_encoding_enabled);
    put_bool(dst, info.size_prefix_disabled);
    put_bool(dst, info.tcp_no_delay_enabled);
    Ok(())
}

fn decode_wire_format_info(reader: &mut FrameReader) -> Result<CommandBody> {
    Ok(CommandBody::WireFormatInfo(WireFormatInfo {
        version: reader.get_i32()?,
        max_inactivity_duration: reader.get_i64()?,
        max_frame_size: reader.get_i64()?,
        cache_size: reader.get_i32()?,
        tight_encoding_enabled: reader.get_bool()?,
        size_prefix_disabled: reader.get_bool()?,
        tcp_no_delay_enabled: reader.get_bool()?,
    }))
}

fn encode_connection_info(body: &CommandBody, dst: &mut BytesMut) -> Result<()> {
    let CommandBody::ConnectionInfo(info) = body else {
        return Err(mismatch("ConnectionInfo"));
    };
    put_connection_id(dst, &info.connection_id)?;
    put_string(dst, &info.client_id)?;
    put_string(dst, &info.user_name)?;
    put_string(dst, &info.password)
}

fn decode_connection_info(reader: &mut FrameReader) -> Result<CommandBody> {
    Ok(CommandBody::ConnectionInfo(ConnectionInfo {
        connection_id: get_connection_id(reader)?,
        client_id: reader.get_string()?,
        user_name: reader.get_string()?,
        password: reader.get_string()?,
    }))
}

fn encode_session_info(body: &CommandBody, dst: &mut BytesMut) -> Result<()> {
    let CommandBody::SessionInfo(info) = body else {
        return Err(mismatch("SessionInfo"));
    };
    put_session_id(dst, &info.session_id)
}

fn transaction_operation_tag(operation: TransactionOperation) -> u8 {
    match operation {
        TransactionOperation::Begin => 0,
        TransactionOperation::Commit => 1,
        TransactionOperation::Rollback => 2,
    }
}

fn encode_transaction_info(body: &CommandBody, dst: &mut BytesMut) -> Result<()> {
    let CommandBody::TransactionInfo(info) = body else {
        return Err(mismatch("TransactionInfo"));
    };
    put_connection_id(dst, &info.connection_id)?;
    put_transaction_id(dst, &info.transaction_id)?;
    dst.put_u8(transaction_operation_tag(info.operation_type));
    Ok(())
}

fn decode_transaction_info(reader: &mut FrameReader) -> Result<CommandBody> {
    let connection_id = get_connection_id(reader)?;
    let transaction_id = get_transaction_id(reader)?;
    let operation_type = match reader.get_u8()? {
        0 => TransactionOperation::Begin,
        1 => TransactionOperation::Commit,
        2 => TransactionOperation::Rollback,
        other => {
            return Err(MessagingError::protocol(format!(
                "invalid transaction operation {other}"
            )))
        }
    };
    Ok(CommandBody::TransactionInfo(TransactionInfo {
        connection_id,
        transaction_id,
        operation_type,
    }))
}

fn decode_session_info(reader: &mut FrameReader) -> Result<CommandBody> {
    Ok(CommandBody::SessionInfo(SessionInfo {
        session_id: get_session_id(reader)?,
    }))
}

fn encode_consumer_info(body: &CommandBody, dst: &mut BytesMut) -> Result<()> {
    let CommandBody::ConsumerInfo(info) = body else {
        return Err(mismatch("ConsumerInfo"));
    };
    put_consumer_id(dst, &info.consumer_id)?;
    put_destination(dst, &info.destination)?;
    dst.put_i32(info.prefetch_size);
    put_opt(dst, info.selector.as_ref(), |d, s| put_string(d, s))?;
    put_bool(dst, info.no_local);
    Ok(())
}

fn decode_consumer_info(reader: &mut FrameReader) -> Result<CommandBody> {
    Ok(CommandBody::ConsumerInfo(ConsumerInfo {
        consumer_id: get_consumer_id(reader)?,
        destination: get_destination(reader)?,
        prefetch_size: reader.get_i32()?,
        selector: reader.get_opt(FrameReader::get_string)?,
        no_local: reader.get_bool()?,
    }))
}

fn encode_producer_info(body: &CommandBody, dst: &mut BytesMut) -> Result<()> {
    let CommandBody::ProducerInfo(info) = body else {
        return Err(mismatch("ProducerInfo"));
    };
    put_producer_id(dst, &info.producer_id)?;
    put_opt(dst, info.destination.as_ref(), put_destination)
}

fn decode_producer_info(reader: &mut FrameReader) -> Result<CommandBody> {
    Ok(CommandBody::ProducerInfo(ProducerInfo {
        producer_id: get_producer_id(reader)?,
        destination: reader.get_opt(get_destination)?,
    }))
}

fn encode_destination_info(body: &CommandBody, dst: &mut BytesMut) -> Result<()> {
    let CommandBody::DestinationInfo(info) = body else {
        return Err(mismatch("DestinationInfo"));
    };
    put_connection_id(dst, &info.connection_id)?;
    put_destination(dst, &info.destination)?;
    dst.put_u8(match info.operation_type {
        DestinationOperation::Add => 0,
        DestinationOperation::Remove => 1,
    });
    dst.put_i64(info.timeout);
    let count = u16::try_from(info.broker_path.len())
        .map_err(|_| MessagingError::protocol("broker path too long"))?;
    dst.put_u16(count);
    for broker in &info.broker_path {
        put_string(dst, &broker.value)?;
    }
    Ok(())
}

fn decode_destination_info(reader: &mut FrameReader) -> Result<CommandBody> {
    let connection_id = get_connection_id(reader)?;
    let destination = get_destination(reader)?;
    let operation_type = match reader.get_u8()? {
        0 => DestinationOperation::Add,
        1 => DestinationOperation::Remove,
        other => {
            return Err(MessagingError::protocol(format!(
                "invalid destination operation {other}"
            )))
        }
    };
    let timeout = reader.get_i64()?;
    let count = reader.get_u16()?;
    let mut broker_path = Vec::with_capacity(usize::from(count));
    for _ in 0..count {
        broker_path.push(BrokerId {
            value: reader.get_string()?,
        });
    }
    Ok(CommandBody::DestinationInfo(DestinationInfo {
        connection_id,
        destination,
        operation_type,
        timeout,
        broker_path,
    }))
}

fn encode_remove_info(body: &CommandBody, dst: &mut BytesMut) -> Result<()> {
    let CommandBody::RemoveInfo(info) = body else {
        return Err(mismatch("RemoveInfo"));
    };
    match &info.object {
        RemovedEntity::Connection(id) => {
            dst.put_u8(0);
            put_connection_id(dst, id)
        }
        RemovedEntity::Session(id) => {
            dst.put_u8(1);
            put_session_id(dst, id)
        }
        RemovedEntity::Consumer(id) => {
            dst.put_u8(2);
            put_consumer_id(dst, id)
        }
        RemovedEntity::Producer(id) => {
            dst.put_u8(3);
            put_producer_id(dst, id)
        }
    }
}

fn decode_remove_info(reader: &mut FrameReader) -> Result<CommandBody> {
    let object = match reader.get_u8()? {
        0 => RemovedEntity::Connection(get_connection_id(reader)?),
        1 => RemovedEntity::Session(get_session_id(reader)?),
        2 => RemovedEntity::Consumer(get_consumer_id(reader)?),
        3 => RemovedEntity::Producer(get_producer_id(reader)?),
        other => {
            return Err(MessagingError::protocol(format!(
                "invalid removed entity discriminant {other}"
            )))
        }
    };
    Ok(CommandBody::RemoveInfo(RemoveInfo { object }))
}

fn encode_consumer_control(body: &CommandBody, dst: &mut BytesMut) -> Result<()> {
    let CommandBody::ConsumerControl(control) = body else {
        return Err(mismatch("ConsumerControl"));
    };
    put_consumer_id(dst, &control.consumer_id)?;
    put_opt(dst, control.destination.as_ref(), put_destination)?;
    put_bool(dst, control.close);
    dst.put_i32(control.prefetch);
    put_bool(dst, control.flush);
    put_bool(dst, control.start);
    put_bool(dst, control.stop);
    Ok(())
}

fn decode_consumer_control(reader: &mut FrameReader) -> Result<CommandBody> {
    Ok(CommandBody::ConsumerControl(ConsumerControl {
        consumer_id: get_consumer_id(reader)?,
        destination: reader.get_opt(get_destination)?,
        close: reader.get_bool()?,
        prefetch: reader.get_i32()?,
        flush: reader.get_bool()?,
        start: reader.get_bool()?,
        stop: reader.get_bool()?,
    }))
}

fn encode_message_pull(body: &CommandBody, dst: &mut BytesMut) -> Result<()> {
    let CommandBody::MessagePull(pull) = body else {
        return Err(mismatch("MessagePull"));
    };
    put_consumer_id(dst, &pull.consumer_id)?;
    put_destination(dst, &pull.destination)?;
    dst.put_i64(pull.timeout);
    put_opt(dst, pull.correlation_id.as_ref(), |d, s| put_string(d, s))?;
    put_opt(dst, pull.message_id.as_ref(), put_message_id)
}

fn decode_message_pull(reader: &mut FrameReader) -> Result<CommandBody> {
    Ok(CommandBody::MessagePull(MessagePull {
        consumer_id: get_consumer_id(reader)?,
        destination: get_destination(reader)?,
        timeout: reader.get_i64()?,
        correlation_id: reader.get_opt(FrameReader::get_string)?,
        message_id: reader.get_opt(get_message_id)?,
    }))
}

fn ack_type_tag(ack_type: AckType) -> u8 {
    match ack_type {
        AckType::Delivered => 0,
        AckType::Standard => 2,
        AckType::Redelivered => 3,
        AckType::Individual => 4,
    }
}

fn encode_message_ack(body: &CommandBody, dst: &mut BytesMut) -> Result<()> {
    let CommandBody::MessageAck(ack) = body else {
        return Err(mismatch("MessageAck"));
    };
    put_consumer_id(dst, &ack.consumer_id)?;
    put_opt(dst, ack.destination.as_ref(), put_destination)?;
    dst.put_u8(ack_type_tag(ack.ack_type));
    put_opt(dst, ack.first_message_id.as_ref(), put_message_id)?;
    put_opt(dst, ack.last_message_id.as_ref(), put_message_id)?;
    dst.put_i32(ack.message_count);
    put_opt(dst, ack.transaction_id.as_ref(), put_transaction_id)
}

fn decode_message_ack(reader: &mut FrameReader) -> Result<CommandBody> {
    let consumer_id = get_consumer_id(reader)?;
    let destination = reader.get_opt(get_destination)?;
    let ack_type = match reader.get_u8()? {
        0 => AckType::Delivered,
        2 => AckType::Standard,
        3 => AckType::Redelivered,
        4 => AckType::Individual,
        other => {
            return Err(MessagingError::protocol(format!(
                "invalid ack type {other}"
            )))
        }
    };
    Ok(CommandBody::MessageAck(MessageAck {
        consumer_id,
        destination,
        ack_type,
        first_message_id: reader.get_opt(get_message_id)?,
        last_message_id: reader.get_opt(get_message_id)?,
        message_count: reader.get_i32()?,
        transaction_id: reader.get_opt(get_transaction_id)?,
    }))
}

fn delivery_mode_tag(mode: DeliveryMode) -> u8 {
    match mode {
        DeliveryMode::NonPersistent => 1,
        DeliveryMode::Persistent => 2,
    }
}

fn encode_message(body: &CommandBody, dst: &mut BytesMut) -> Result<()> {
    let CommandBody::Message(message) = body else {
        return Err(mismatch("Message"));
    };
    put_opt(dst, message.message_id.as_ref(), put_message_id)?;
    put_opt(dst, message.destination.as_ref(), put_destination)?;
    put_opt(dst, message.reply_to.as_ref(), put_destination)?;
    put_opt(dst, message.correlation_id.as_ref(), |d, s| put_string(d, s))?;
    dst.put_u8(delivery_mode_tag(message.delivery_mode));
    dst.put_u8(message.priority);
    dst.put_i64(message.timestamp);
    dst.put_i64(message.expiration);
    put_bool(dst, message.redelivered);
    put_opt(dst, message.target_consumer_id.as_ref(), put_consumer_id)?;
    put_opt(dst, message.transaction_id.as_ref(), put_transaction_id)?;

    let count = u32::try_from(message.properties.len())
        .map_err(|_| MessagingError::protocol("too many message properties"))?;
    dst.put_u32(count);
    for (key, value) in &message.properties {
        put_string(dst, key)?;
        put_string(dst, value)?;
    }

    match &message.body {
        MessageBody::Empty => dst.put_u8(0),
        MessageBody::Text(text) => {
            dst.put_u8(1);
            put_long_bytes(dst, text.as_bytes())?;
        }
        MessageBody::Bytes(bytes) => {
            dst.put_u8(2);
            put_long_bytes(dst, bytes)?;
        }
        MessageBody::Map(entries) => {
            dst.put_u8(3);
            let count = u32::try_from(entries.len())
                .map_err(|_| MessagingError::protocol("map body too large"))?;
            dst.put_u32(count);
            for (key, value) in entries {
                put_string(dst, key)?;
                put_string(dst, value)?;
            }
        }
    }
    Ok(())
}

fn decode_message(reader: &mut FrameReader) -> Result<CommandBody> {
    let message_id = reader.get_opt(get_message_id)?;
    let destination = reader.get_opt(get_destination)?;
    let reply_to = reader.get_opt(get_destination)?;
    let correlation_id = reader.get_opt(FrameReader::get_string)?;
    let delivery_mode = match reader.get_u8()? {
        1 => DeliveryMode::NonPersistent,
        2 => DeliveryMode::Persistent,
        other => {
            return Err(MessagingError::protocol(format!(
                "invalid delivery mode {other}"
            )))
        }
    };
    let priority = reader.get_u8()?;
    let timestamp = reader.get_i64()?;
    let expiration = reader.get_i64()?;
    let redelivered = reader.get_bool()?;
    let target_consumer_id = reader.get_opt(get_consumer_id)?;
    let transaction_id = reader.get_opt(get_transaction_id)?;

    let property_count = reader.get_u32()?;
    let mut properties = std::collections::BTreeMap::new();
    for _ in 0..property_count {
        let key = reader.get_string()?;
        let value = reader.get_string()?;
        properties.insert(key, value);
    }

    let body = match reader.get_u8()? {
        0 => MessageBody::Empty,
        1 => MessageBody::Text(reader.get_long_string()?),
        2 => MessageBody::Bytes(reader.get_long_bytes()?),
        3 => {
            let count = reader.get_u32()?;
            let mut entries = std::collections::BTreeMap::new();
            for _ in 0..count {
                let key = reader.get_string()?;
                let value = reader.get_string()?;
                entries.insert(key, value);
            }
            MessageBody::Map(entries)
        }
        other => {
            return Err(MessagingError::protocol(format!(
                "invalid message body kind {other}"
            )))
        }
    };

    Ok(CommandBody::Message(BrokerMessage {
        message_id,
        destination,
        reply_to,
        correlation_id,
        delivery_mode,
        priority,
        timestamp,
        expiration,
        redelivered,
        target_consumer_id,
        transaction_id,
        properties,
        body,
    }))
}

fn encode_response(body: &CommandBody, dst: &mut BytesMut) -> Result<()> {
    let CommandBody::Response(response) = body else {
        return Err(mismatch("Response"));
    };
    dst.put_i32(response.correlation_id);
    Ok(())
}

fn decode_response(reader: &mut FrameReader) -> Result<CommandBody> {
    Ok(CommandBody::Response(Response {
        correlation_id: reader.get_i32()?,
    }))
}

fn encode_exception_response(body: &CommandBody, dst: &mut BytesMut) -> Result<()> {
    let CommandBody::ExceptionResponse(response) = body else {
        return Err(mismatch("ExceptionResponse"));
    };
    dst.put_i32(response.correlation_id);
    put_long_bytes(dst, response.message.as_bytes())?;
    put_string(dst, &response.exception_class)
}

fn decode_exception_response(reader: &mut FrameReader) -> Result<CommandBody> {
    Ok(CommandBody::ExceptionResponse(ExceptionResponse {
        correlation_id: reader.get_i32()?,
        message: reader.get_long_string()?,
        exception_class: reader.get_string()?,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(command: Command) -> Command {
        let mut codec = OpenWireCodec::new(1024 * 1024);
        let mut wire = BytesMut::new();
        codec.encode(command, &mut wire).expect("encode");
        codec
            .decode(&mut wire)
            .expect("decode")
            .expect("complete frame")
    }

    fn sample_consumer_id() -> ConsumerId {
        ConsumerId {
            connection_id: "ID:host-1".into(),
            session_id: 1,
            value: 7,
        }
    }

    #[test]
    fn round_trips_preserve_structure() {
        let mut message = BrokerMessage::text("hello broker");
        message.destination = Some(Destination::queue("q1"));
        message.correlation_id = Some("corr-1".into());
        message.set_property("region", "eu");
        let mut command = Command::new(CommandBody::Message(message));
        command.header.command_id = Some(41);
        command.header.response_required = true;

        assert_eq!(round_trip(command.clone()), command);

        let pull = Command::new(CommandBody::MessagePull(MessagePull {
            consumer_id: sample_consumer_id(),
            destination: Destination::queue("q1"),
            timeout: 1500,
            correlation_id: None,
            message_id: None,
        }));
        assert_eq!(round_trip(pull.clone()), pull);

        let exception = Command::new(CommandBody::ExceptionResponse(ExceptionResponse {
            correlation_id: 3,
            message: "no such destination".into(),
            exception_class: "javax.jms.InvalidDestinationException".into(),
        }));
        assert_eq!(round_trip(exception.clone()), exception);

        let begin = Command::new(CommandBody::TransactionInfo(TransactionInfo {
            connection_id: ConnectionId::new("ID:host-1"),
            transaction_id: TransactionId {
                connection_id: "ID:host-1".into(),
                value: 6,
            },
            operation_type: TransactionOperation::Begin,
        }));
        assert_eq!(round_trip(begin.clone()), begin);
    }

    #[test]
    fn partial_frames_wait_for_more_bytes() {
        let mut codec = OpenWireCodec::new(1024);
        let mut wire = BytesMut::new();
        codec
            .encode(
                Command::new(CommandBody::KeepAlive(KeepAlive)),
                &mut wire,
            )
            .expect("encode");
        let mut partial = wire.split_to(wire.len() - 1);
        assert!(codec.decode(&mut partial).expect("decode").is_none());
        partial.unsplit(wire);
        assert!(codec.decode(&mut partial).expect("decode").is_some());
    }

    #[test]
    fn oversized_declared_frames_are_fatal() {
        let mut codec = OpenWireCodec::new(16);
        let mut wire = BytesMut::new();
        wire.put_u32(1024);
        assert!(matches!(
            codec.decode(&mut wire),
            Err(MessagingError::Protocol(_))
        ));
    }

    #[test]
    fn unknown_tags_are_fatal() {
        let mut codec = OpenWireCodec::new(1024);
        let mut wire = BytesMut::new();
        // unknown tag 200, absent command id, no response required
        wire.put_u32(3);
        wire.put_u8(200);
        wire.put_u8(0);
        wire.put_u8(0);
        assert!(matches!(
            codec.decode(&mut wire),
            Err(MessagingError::Protocol(_))
        ));
    }
}
