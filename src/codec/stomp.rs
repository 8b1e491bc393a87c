//! Line-oriented text framing.
//!
//! Frames are a command line, header lines, a blank line, then a body
//! terminated by NUL. A lone newline between frames is a heartbeat. The
//! codec is symmetric — it speaks both directions of the dialogue — so
//! the same type drives the client and in-process broker test doubles.
//! Request/response correlation rides the `receipt`/`receipt-id`
//! headers. The text protocol cannot express every lifecycle command;
//! [`StompCodec::supports`] reports which commands have a wire mapping so
//! the transport can answer the rest locally.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::command::{
    AckType, BrokerMessage, Command, CommandBody, ConnectionId, ConnectionInfo, ConsumerId,
    ConsumerInfo, DeliveryMode, ExceptionResponse, KeepAlive, MessageAck, MessageBody, MessageId,
    ProducerId, RemoveInfo, RemovedEntity, Response, ShutdownInfo, TransactionId, TransactionInfo,
    TransactionOperation, WireFormatInfo,
};
use crate::destination::{Destination, DestinationKind};
use crate::error::{MessagingError, Result};

/// Codec for the text wire format.
#[derive(Debug)]
pub struct StompCodec {
    max_frame_size: usize,
}

impl StompCodec {
    /// Create a codec with the given frame-size bound.
    #[must_use]
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    /// Whether `command` has a mapping the broker can act on.
    ///
    /// Lifecycle commands outside this set are answered locally by the
    /// transport: the text protocol creates sessions and producers
    /// implicitly.
    #[must_use]
    pub fn supports(command: &Command) -> bool {
        match &command.body {
            CommandBody::Message(_)
            | CommandBody::MessageAck(_)
            | CommandBody::ConsumerInfo(_)
            | CommandBody::TransactionInfo(_)
            | CommandBody::ShutdownInfo(_)
            | CommandBody::KeepAlive(_) => true,
            CommandBody::RemoveInfo(info) => {
                matches!(info.object, RemovedEntity::Consumer(_))
            }
            _ => false,
        }
    }
}

struct Frame {
    command: &'static str,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl Frame {
    fn new(command: &'static str) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    fn header(&mut self, key: &str, value: impl Into<String>) {
        self.headers.push((key.to_owned(), value.into()));
    }
}

fn stomp_destination(destination: &Destination) -> String {
    let prefix = match destination.kind() {
        DestinationKind::Queue => "/queue/",
        DestinationKind::Topic => "/topic/",
        DestinationKind::TemporaryQueue => "/temp-queue/",
        DestinationKind::TemporaryTopic => "/temp-topic/",
    };
    format!("{prefix}{}", destination.physical_name())
}

fn parse_stomp_destination(value: &str) -> Result<Destination> {
    if let Some(rest) = value.strip_prefix("/queue/") {
        Ok(Destination::queue(rest))
    } else if let Some(rest) = value.strip_prefix("/topic/") {
        Ok(Destination::topic(rest))
    } else if let Some(rest) = value.strip_prefix("/temp-queue/") {
        Ok(Destination::temporary(DestinationKind::TemporaryQueue, rest))
    } else if let Some(rest) = value.strip_prefix("/temp-topic/") {
        Ok(Destination::temporary(DestinationKind::TemporaryTopic, rest))
    } else {
        Err(MessagingError::protocol(format!(
            "unrecognized destination `{value}`"
        )))
    }
}

fn parse_consumer_id(value: &str) -> Option<ConsumerId> {
    let mut parts = value.rsplitn(3, ':');
    let consumer = parts.next()?.parse().ok()?;
    let session = parts.next()?.parse().ok()?;
    let connection = parts.next()?;
    Some(ConsumerId {
        connection_id: connection.to_owned(),
        session_id: session,
        value: consumer,
    })
}

fn parse_transaction_id(value: &str) -> Option<TransactionId> {
    let rest = value.strip_prefix("TX:")?;
    let mut parts = rest.rsplitn(2, ':');
    let transaction = parts.next()?.parse().ok()?;
    let connection = parts.next()?;
    Some(TransactionId {
        connection_id: connection.to_owned(),
        value: transaction,
    })
}

fn parse_message_id(value: &str) -> Option<MessageId> {
    let mut parts = value.rsplitn(4, ':');
    let sequence = parts.next()?.parse().ok()?;
    let producer = parts.next()?.parse().ok()?;
    let session = parts.next()?.parse().ok()?;
    let connection = parts.next()?;
    Some(MessageId {
        producer_id: ProducerId {
            connection_id: connection.to_owned(),
            session_id: session,
            value: producer,
        },
        producer_sequence_id: sequence,
    })
}

impl Encoder<Command> for StompCodec {
    type Error = MessagingError;

    fn encode(&mut self, command: Command, dst: &mut BytesMut) -> Result<()> {
        let mut frame = match &command.body {
            CommandBody::KeepAlive(_) => {
                dst.put_u8(b'\n');
                return Ok(());
            }
            CommandBody::ConnectionInfo(info) => {
                let mut frame = Frame::new("CONNECT");
                frame.header("login", info.user_name.clone());
                frame.header("passcode", info.password.clone());
                if !info.client_id.is_empty() {
                    frame.header("client-id", info.client_id.clone());
                }
                frame
            }
            CommandBody::WireFormatInfo(_) => Frame::new("CONNECTED"),
            CommandBody::ShutdownInfo(_) => Frame::new("DISCONNECT"),
            CommandBody::TransactionInfo(info) => {
                let mut frame = Frame::new(match info.operation_type {
                    TransactionOperation::Begin => "BEGIN",
                    TransactionOperation::Commit => "COMMIT",
                    TransactionOperation::Rollback => "ABORT",
                });
                frame.header("transaction", info.transaction_id.to_string());
                frame
            }
            CommandBody::ConsumerInfo(info) => {
                let mut frame = Frame::new("SUBSCRIBE");
                frame.header("destination", stomp_destination(&info.destination));
                frame.header("id", info.consumer_id.to_string());
                frame.header("ack", "client");
                frame.header("activemq.prefetchSize", info.prefetch_size.to_string());
                if let Some(selector) = &info.selector {
                    frame.header("selector", selector.clone());
                }
                if info.no_local {
                    frame.header("activemq.noLocal", "true");
                }
                frame
            }
            CommandBody::RemoveInfo(info) => {
                let RemovedEntity::Consumer(id) = &info.object else {
                    return Err(MessagingError::Unsupported(
                        "only consumers are removable on the text protocol".into(),
                    ));
                };
                let mut frame = Frame::new("UNSUBSCRIBE");
                frame.header("id", id.to_string());
                frame
            }
            CommandBody::Message(message) => encode_message(message)?,
            CommandBody::MessageAck(ack) => {
                let mut frame = Frame::new(match ack.ack_type {
                    AckType::Redelivered => "NACK",
                    _ => "ACK",
                });
                frame.header("subscription", ack.consumer_id.to_string());
                if let Some(id) = &ack.last_message_id {
                    frame.header("message-id", id.to_string());
                }
                frame.header("activemq.ackCount", ack.message_count.to_string());
                if let Some(transaction) = &ack.transaction_id {
                    frame.header("transaction", transaction.to_string());
                }
                frame
            }
            CommandBody::Response(response) => {
                let mut frame = Frame::new("RECEIPT");
                frame.header("receipt-id", response.correlation_id.to_string());
                frame
            }
            CommandBody::ExceptionResponse(response) => {
                let mut frame = Frame::new("ERROR");
                if response.correlation_id >= 0 {
                    frame.header("receipt-id", response.correlation_id.to_string());
                }
                frame.header("message", response.message.clone());
                frame
            }
            other => {
                return Err(MessagingError::Unsupported(format!(
                    "command tag {} has no text protocol mapping",
                    other.type_tag()
                )))
            }
        };

        if command.header.response_required {
            if let Some(id) = command.header.command_id {
                frame.header("receipt", id.to_string());
            }
        }
        write_frame(&frame, dst, self.max_frame_size)
    }
}

fn encode_message(message: &BrokerMessage) -> Result<Frame> {
    let destination = message
        .destination
        .as_ref()
        .ok_or_else(|| MessagingError::protocol("message without destination"))?;
    // Broker-to-consumer deliveries are MESSAGE frames; sends are SEND.
    let mut frame = match &message.target_consumer_id {
        Some(consumer_id) => {
            let mut frame = Frame::new("MESSAGE");
            frame.header("subscription", consumer_id.to_string());
            frame
        }
        None => Frame::new("SEND"),
    };
    frame.header("destination", stomp_destination(destination));
    if let Some(id) = &message.message_id {
        frame.header("message-id", id.to_string());
    }
    if let Some(correlation) = &message.correlation_id {
        frame.header("correlation-id", correlation.clone());
    }
    if let Some(reply_to) = &message.reply_to {
        frame.header("reply-to", stomp_destination(reply_to));
    }
    frame.header(
        "persistent",
        if message.delivery_mode == DeliveryMode::Persistent {
            "true"
        } else {
            "false"
        },
    );
    frame.header("priority", message.priority.to_string());
    if message.timestamp != 0 {
        frame.header("timestamp", message.timestamp.to_string());
    }
    if message.expiration != 0 {
        frame.header("expires", message.expiration.to_string());
    }
    if message.redelivered {
        frame.header("redelivered", "true");
    }
    if let Some(transaction) = &message.transaction_id {
        frame.header("transaction", transaction.to_string());
    }
    for (key, value) in &message.properties {
        frame.header(key, value.clone());
    }
    match &message.body {
        MessageBody::Empty => {}
        MessageBody::Text(text) => {
            frame.header("content-type", "text/plain");
            frame.body = text.clone().into_bytes();
        }
        MessageBody::Bytes(bytes) => {
            frame.body = bytes.clone();
        }
        MessageBody::Map(_) => {
            return Err(MessagingError::Unsupported(
                "map bodies have no text protocol mapping".into(),
            ))
        }
    }
    Ok(frame)
}

fn write_frame(frame: &Frame, dst: &mut BytesMut, max_frame_size: usize) -> Result<()> {
    let mut out = BytesMut::new();
    out.put_slice(frame.command.as_bytes());
    out.put_u8(b'\n');
    for (key, value) in &frame.headers {
        out.put_slice(key.as_bytes());
        out.put_u8(b':');
        out.put_slice(value.as_bytes());
        out.put_u8(b'\n');
    }
    out.put_slice(format!("content-length:{}\n", frame.body.len()).as_bytes());
    out.put_u8(b'\n');
    out.put_slice(&frame.body);
    out.put_u8(0);

    if out.len() > max_frame_size {
        return Err(MessagingError::protocol(format!(
            "outbound frame of {} bytes exceeds limit of {max_frame_size} bytes",
            out.len()
        )));
    }
    dst.extend_from_slice(&out);
    Ok(())
}

impl Decoder for StompCodec {
    type Item = Command;
    type Error = MessagingError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Command>> {
        // Heartbeats are bare newlines between frames.
        if src.first() == Some(&b'\n') {
            src.advance(1);
            return Ok(Some(Command::new(CommandBody::KeepAlive(KeepAlive))));
        }
        if src.starts_with(b"\r\n") {
            src.advance(2);
            return Ok(Some(Command::new(CommandBody::KeepAlive(KeepAlive))));
        }

        let Some(headers_end) = find_blank_line(src) else {
            if src.len() > self.max_frame_size {
                return Err(MessagingError::protocol(format!(
                    "frame headers exceed limit of {} bytes",
                    self.max_frame_size
                )));
            }
            return Ok(None);
        };

        let header_text = std::str::from_utf8(&src[..headers_end])
            .map_err(|_| MessagingError::protocol("frame headers are not UTF-8"))?;
        let mut lines = header_text.lines();
        let command = lines
            .next()
            .ok_or_else(|| MessagingError::protocol("empty frame"))?
            .trim_end_matches('\r')
            .to_owned();
        let mut headers = Vec::new();
        for line in lines {
            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }
            let (key, value) = line.split_once(':').ok_or_else(|| {
                MessagingError::protocol(format!("header line without separator: `{line}`"))
            })?;
            headers.push((key.trim().to_owned(), value.trim().to_owned()));
        }

        let body_start = headers_end + 2;
        let content_length = header_value(&headers, "content-length")
            .map(|v| {
                v.parse::<usize>()
                    .map_err(|_| MessagingError::protocol("invalid content-length"))
            })
            .transpose()?;

        let body_end = match content_length {
            Some(length) => {
                let end = body_start + length;
                if end > self.max_frame_size {
                    return Err(MessagingError::protocol(format!(
                        "frame of {end} bytes exceeds limit of {} bytes",
                        self.max_frame_size
                    )));
                }
                if src.len() <= end {
                    return Ok(None);
                }
                if src[end] != 0 {
                    return Err(MessagingError::protocol("frame body not NUL-terminated"));
                }
                end
            }
            None => match src[body_start..].iter().position(|&b| b == 0) {
                Some(offset) => body_start + offset,
                None => {
                    if src.len() > self.max_frame_size {
                        return Err(MessagingError::protocol(format!(
                            "frame exceeds limit of {} bytes",
                            self.max_frame_size
                        )));
                    }
                    return Ok(None);
                }
            },
        };

        let body = src[body_start..body_end].to_vec();
        src.advance(body_end + 1);

        let mut decoded = decode_frame(&command, &headers, body)?;
        if let Some(receipt) = header_value(&headers, "receipt") {
            decoded.header.command_id = receipt.parse().ok();
            decoded.header.response_required = true;
        }
        Ok(Some(decoded))
    }
}

fn find_blank_line(src: &BytesMut) -> Option<usize> {
    src.windows(2).position(|pair| pair == b"\n\n")
}

fn header_value<'a>(headers: &'a [(String, String)], key: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

fn decode_frame(command: &str, headers: &[(String, String)], body: Vec<u8>) -> Result<Command> {
    match command {
        "CONNECT" => Ok(Command::new(CommandBody::ConnectionInfo(ConnectionInfo {
            connection_id: ConnectionId::new(
                header_value(headers, "client-id").unwrap_or_default(),
            ),
            client_id: header_value(headers, "client-id")
                .unwrap_or_default()
                .to_owned(),
            user_name: header_value(headers, "login").unwrap_or_default().to_owned(),
            password: header_value(headers, "passcode")
                .unwrap_or_default()
                .to_owned(),
        }))),
        // The connect handshake stands in for wire format negotiation.
        "CONNECTED" => Ok(Command::new(CommandBody::WireFormatInfo(
            WireFormatInfo::default(),
        ))),
        "DISCONNECT" => Ok(Command::new(CommandBody::ShutdownInfo(ShutdownInfo))),
        "BEGIN" | "COMMIT" | "ABORT" => {
            let transaction_id = header_value(headers, "transaction")
                .and_then(parse_transaction_id)
                .ok_or_else(|| {
                    MessagingError::protocol(format!("{command} without usable transaction"))
                })?;
            let operation_type = match command {
                "BEGIN" => TransactionOperation::Begin,
                "COMMIT" => TransactionOperation::Commit,
                _ => TransactionOperation::Rollback,
            };
            Ok(Command::new(CommandBody::TransactionInfo(TransactionInfo {
                connection_id: ConnectionId::new(transaction_id.connection_id.clone()),
                transaction_id,
                operation_type,
            })))
        }
        "SUBSCRIBE" => {
            let destination = header_value(headers, "destination")
                .ok_or_else(|| MessagingError::protocol("SUBSCRIBE without destination"))
                .and_then(parse_stomp_destination)?;
            let consumer_id = header_value(headers, "id")
                .and_then(parse_consumer_id)
                .ok_or_else(|| MessagingError::protocol("SUBSCRIBE without usable id"))?;
            Ok(Command::new(CommandBody::ConsumerInfo(ConsumerInfo {
                consumer_id,
                destination,
                prefetch_size: header_value(headers, "activemq.prefetchSize")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(1),
                selector: header_value(headers, "selector").map(str::to_owned),
                no_local: header_value(headers, "activemq.noLocal") == Some("true"),
            })))
        }
        "UNSUBSCRIBE" => {
            let consumer_id = header_value(headers, "id")
                .and_then(parse_consumer_id)
                .ok_or_else(|| MessagingError::protocol("UNSUBSCRIBE without usable id"))?;
            Ok(Command::new(CommandBody::RemoveInfo(RemoveInfo {
                object: RemovedEntity::Consumer(consumer_id),
            })))
        }
        "ACK" | "NACK" => {
            let consumer_id = header_value(headers, "subscription")
                .and_then(parse_consumer_id)
                .ok_or_else(|| MessagingError::protocol("acknowledge without subscription"))?;
            Ok(Command::new(CommandBody::MessageAck(MessageAck {
                consumer_id,
                destination: None,
                ack_type: if command == "NACK" {
                    AckType::Redelivered
                } else {
                    AckType::Standard
                },
                first_message_id: None,
                last_message_id: header_value(headers, "message-id").and_then(parse_message_id),
                message_count: header_value(headers, "activemq.ackCount")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(1),
                transaction_id: header_value(headers, "transaction")
                    .and_then(parse_transaction_id),
            })))
        }
        "RECEIPT" => {
            let id = header_value(headers, "receipt-id")
                .ok_or_else(|| MessagingError::protocol("RECEIPT without receipt-id"))?
                .parse()
                .map_err(|_| MessagingError::protocol("invalid receipt-id"))?;
            Ok(Command::new(CommandBody::Response(Response {
                correlation_id: id,
            })))
        }
        "ERROR" => {
            let correlation_id = header_value(headers, "receipt-id")
                .and_then(|v| v.parse().ok())
                .unwrap_or(-1);
            let message = header_value(headers, "message")
                .map(str::to_owned)
                .unwrap_or_else(|| String::from_utf8_lossy(&body).into_owned());
            Ok(Command::new(CommandBody::ExceptionResponse(
                ExceptionResponse {
                    correlation_id,
                    message,
                    exception_class: "stomp.error".to_owned(),
                },
            )))
        }
        "SEND" | "MESSAGE" => decode_message(headers, body),
        other => Err(MessagingError::protocol(format!(
            "unrecognized frame command `{other}`"
        ))),
    }
}

const RESERVED_HEADERS: &[&str] = &[
    "destination",
    "message-id",
    "subscription",
    "correlation-id",
    "reply-to",
    "persistent",
    "priority",
    "timestamp",
    "expires",
    "redelivered",
    "content-type",
    "content-length",
    "receipt",
    "receipt-id",
    "transaction",
];

fn decode_message(headers: &[(String, String)], body: Vec<u8>) -> Result<Command> {
    let destination = header_value(headers, "destination")
        .map(parse_stomp_destination)
        .transpose()?;
    let mut message = BrokerMessage::empty();
    message.destination = destination;
    message.message_id = header_value(headers, "message-id").and_then(parse_message_id);
    message.target_consumer_id =
        header_value(headers, "subscription").and_then(parse_consumer_id);
    message.correlation_id = header_value(headers, "correlation-id").map(str::to_owned);
    message.reply_to = header_value(headers, "reply-to")
        .map(parse_stomp_destination)
        .transpose()?;
    message.delivery_mode = if header_value(headers, "persistent") == Some("false") {
        DeliveryMode::NonPersistent
    } else {
        DeliveryMode::Persistent
    };
    if let Some(priority) = header_value(headers, "priority").and_then(|v| v.parse().ok()) {
        message.priority = priority;
    }
    if let Some(timestamp) = header_value(headers, "timestamp").and_then(|v| v.parse().ok()) {
        message.timestamp = timestamp;
    }
    if let Some(expires) = header_value(headers, "expires").and_then(|v| v.parse().ok()) {
        message.expiration = expires;
    }
    message.redelivered = header_value(headers, "redelivered") == Some("true");
    message.transaction_id = header_value(headers, "transaction").and_then(parse_transaction_id);
    for (key, value) in headers {
        if !RESERVED_HEADERS.contains(&key.as_str()) {
            message.properties.insert(key.clone(), value.clone());
        }
    }
    let is_text = header_value(headers, "content-type")
        .is_some_and(|v| v.starts_with("text/"));
    message.body = if is_text {
        MessageBody::Text(
            String::from_utf8(body)
                .map_err(|_| MessagingError::protocol("text body is not UTF-8"))?,
        )
    } else if body.is_empty() {
        MessageBody::Empty
    } else {
        MessageBody::Bytes(body)
    };
    Ok(Command::new(CommandBody::Message(message)))
}

#[cfg(test)]
mod tests {
    use crate::command::SessionId;

    use super::*;

    fn codec() -> StompCodec {
        StompCodec::new(1024 * 1024)
    }

    fn consumer_id() -> ConsumerId {
        ConsumerId {
            connection_id: "ID:host-9".into(),
            session_id: 2,
            value: 5,
        }
    }

    fn round_trip(command: Command) -> Command {
        let mut codec = codec();
        let mut wire = BytesMut::new();
        codec.encode(command, &mut wire).expect("encode");
        codec
            .decode(&mut wire)
            .expect("decode")
            .expect("complete frame")
    }

    #[test]
    fn subscribe_carries_receipt_and_prefetch() {
        let mut command = Command::new(CommandBody::ConsumerInfo(ConsumerInfo {
            consumer_id: consumer_id(),
            destination: Destination::topic("prices"),
            prefetch_size: 32,
            selector: Some("region = 'eu'".into()),
            no_local: false,
        }));
        command.header.command_id = Some(12);
        command.header.response_required = true;

        let mut wire = BytesMut::new();
        codec().encode(command.clone(), &mut wire).expect("encode");
        let text = String::from_utf8(wire.to_vec()).expect("frame text");
        assert!(text.starts_with("SUBSCRIBE\n"));
        assert!(text.contains("destination:/topic/prices\n"));
        assert!(text.contains("activemq.prefetchSize:32\n"));
        assert!(text.contains("receipt:12\n"));

        // The broker side of the codec reads the same frame back.
        let decoded = round_trip(command.clone());
        assert_eq!(decoded.header, command.header);
        assert_eq!(decoded.body, command.body);
    }

    #[test]
    fn deliveries_round_trip_with_their_subscription() {
        let mut message = BrokerMessage::text("hi");
        message.destination = Some(Destination::queue("q1"));
        message.target_consumer_id = Some(consumer_id());
        message.message_id = parse_message_id("ID:host-9:2:1:44");
        let decoded = round_trip(Command::new(CommandBody::Message(message.clone())));
        let CommandBody::Message(decoded) = decoded.body else {
            panic!("expected a message");
        };
        assert_eq!(decoded.target_consumer_id, Some(consumer_id()));
        assert_eq!(decoded.body_text(), Some("hi"));
        assert_eq!(decoded.message_id, message.message_id);
    }

    #[test]
    fn receipts_and_errors_resolve_correlation() {
        let mut wire = BytesMut::from(&b"RECEIPT\nreceipt-id:7\n\n\0"[..]);
        let decoded = codec().decode(&mut wire).expect("decode").expect("frame");
        assert_eq!(
            decoded.body,
            CommandBody::Response(Response { correlation_id: 7 })
        );

        let mut wire =
            BytesMut::from(&b"ERROR\nreceipt-id:9\nmessage:bad destination\n\n\0"[..]);
        let decoded = codec().decode(&mut wire).expect("decode").expect("frame");
        let CommandBody::ExceptionResponse(response) = decoded.body else {
            panic!("expected exception response");
        };
        assert_eq!(response.correlation_id, 9);
        assert_eq!(response.message, "bad destination");
    }

    #[test]
    fn acks_cover_the_delivered_window() {
        let ack = Command::new(CommandBody::MessageAck(MessageAck {
            consumer_id: consumer_id(),
            destination: None,
            ack_type: AckType::Standard,
            first_message_id: None,
            last_message_id: parse_message_id("ID:host-9:2:1:3"),
            message_count: 3,
            transaction_id: None,
        }));
        let decoded = round_trip(ack.clone());
        assert_eq!(decoded.body, ack.body);
    }

    #[test]
    fn transaction_frames_round_trip() {
        let transaction_id = TransactionId {
            connection_id: "ID:host-9".into(),
            value: 4,
        };
        for (operation, frame_command) in [
            (TransactionOperation::Begin, "BEGIN"),
            (TransactionOperation::Commit, "COMMIT"),
            (TransactionOperation::Rollback, "ABORT"),
        ] {
            let command = Command::new(CommandBody::TransactionInfo(TransactionInfo {
                connection_id: ConnectionId::new("ID:host-9"),
                transaction_id: transaction_id.clone(),
                operation_type: operation,
            }));
            let mut wire = BytesMut::new();
            codec().encode(command.clone(), &mut wire).expect("encode");
            let text = String::from_utf8(wire.to_vec()).expect("frame text");
            assert!(text.starts_with(frame_command));
            assert!(text.contains("transaction:TX:ID:host-9:4\n"));

            let mut wire = BytesMut::from(text.as_bytes());
            let decoded = codec().decode(&mut wire).expect("decode").expect("frame");
            assert_eq!(decoded.body, command.body);
        }
    }

    #[test]
    fn heartbeats_decode_as_keep_alive() {
        let mut wire = BytesMut::from(&b"\n"[..]);
        let decoded = codec().decode(&mut wire).expect("decode").expect("frame");
        assert_eq!(decoded.body, CommandBody::KeepAlive(KeepAlive));
    }

    #[test]
    fn partial_frames_wait_for_the_terminator() {
        let mut wire = BytesMut::from(&b"MESSAGE\ndestination:/queue/q1\n\npartial"[..]);
        assert!(codec().decode(&mut wire).expect("decode").is_none());
    }

    #[test]
    fn lifecycle_commands_without_mappings_are_local() {
        let session = Command::new(CommandBody::SessionInfo(crate::command::SessionInfo {
            session_id: SessionId {
                connection_id: "ID:host-9".into(),
                value: 2,
            },
        }));
        assert!(!StompCodec::supports(&session));
        assert!(StompCodec::supports(&Command::new(CommandBody::KeepAlive(
            KeepAlive
        ))));
    }
}
