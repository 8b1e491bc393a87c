//! TCP connect and wire format negotiation.
//!
//! Dialing applies the socket options from the URI, then runs the
//! handshake for the selected wire format: the binary protocol exchanges
//! `WireFormatInfo` and adopts the minimum common version; the text
//! protocol sends the connect frame and waits for the broker's answer.

use futures::{SinkExt, StreamExt};
use socket2::SockRef;
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tokio_util::codec::Framed;

use crate::codec::{negotiated_version, CommandCodec, MAX_OPENWIRE_VERSION};
use crate::command::{Command, CommandBody, ConnectionInfo, WireFormatInfo};
use crate::error::{MessagingError, Result};
use crate::uri::WireFormatKind;

use super::TransportConfig;

/// Bound on the whole dial-plus-handshake sequence.
const NEGOTIATE_TIMEOUT: Duration = Duration::from_secs(15);

/// Establish a framed, negotiated connection to the broker.
pub(crate) async fn dial_and_negotiate(
    config: &TransportConfig,
) -> Result<Framed<TcpStream, CommandCodec>> {
    timeout(NEGOTIATE_TIMEOUT, connect_inner(config))
        .await
        .map_err(|_| MessagingError::Timeout)?
}

async fn connect_inner(config: &TransportConfig) -> Result<Framed<TcpStream, CommandCodec>> {
    let uri = &config.uri;
    let stream = TcpStream::connect((uri.host.as_str(), uri.port)).await?;
    stream.set_nodelay(uri.options.tcp_no_delay)?;
    let socket = SockRef::from(&stream);
    let linger = (uri.options.so_linger >= 0).then(|| {
        Duration::from_secs(u64::try_from(uri.options.so_linger).unwrap_or_default())
    });
    socket.set_linger(linger)?;

    let codec = CommandCodec::new(uri.options.wire_format, uri.options.max_frame_size);
    let mut framed = Framed::new(stream, codec);
    match uri.options.wire_format {
        WireFormatKind::OpenWire => negotiate_openwire(config, &mut framed).await?,
        WireFormatKind::Stomp => negotiate_stomp(config, &mut framed).await?,
    }
    Ok(framed)
}

async fn negotiate_openwire(
    config: &TransportConfig,
    framed: &mut Framed<TcpStream, CommandCodec>,
) -> Result<()> {
    let options = &config.uri.options;
    let local = WireFormatInfo {
        version: MAX_OPENWIRE_VERSION,
        max_inactivity_duration: i64::try_from(options.max_inactivity_duration.as_millis())
            .unwrap_or(i64::MAX),
        max_frame_size: i64::try_from(options.max_frame_size).unwrap_or(i64::MAX),
        tight_encoding_enabled: options.tight_encoding_enabled,
        tcp_no_delay_enabled: options.tcp_no_delay,
        ..WireFormatInfo::default()
    };
    framed
        .send(Command::new(CommandBody::WireFormatInfo(local.clone())))
        .await?;

    let remote = match first_command(framed).await? {
        Command {
            body: CommandBody::WireFormatInfo(info),
            ..
        } => info,
        other => {
            return Err(MessagingError::protocol(format!(
                "expected wire format info as the first frame, got {other}"
            )))
        }
    };
    let version = negotiated_version(local.version, remote.version)?;
    framed.codec_mut().set_version(version);
    log::debug!(
        "negotiated wire format version {version} (tight encoding {})",
        if local.tight_encoding_enabled && remote.tight_encoding_enabled {
            "advertised by both peers, marshaling loose"
        } else {
            "off"
        }
    );
    Ok(())
}

async fn negotiate_stomp(
    config: &TransportConfig,
    framed: &mut Framed<TcpStream, CommandCodec>,
) -> Result<()> {
    framed
        .send(Command::new(CommandBody::ConnectionInfo(ConnectionInfo {
            connection_id: config.connection_id.clone(),
            client_id: config.client_id.clone(),
            user_name: config.user_name.clone(),
            password: config.password.clone(),
        })))
        .await?;

    match first_command(framed).await? {
        Command {
            body: CommandBody::WireFormatInfo(_),
            ..
        } => Ok(()),
        Command {
            body: CommandBody::ExceptionResponse(response),
            ..
        } => Err(MessagingError::Broker {
            message: response.message,
            exception_class: response.exception_class,
        }),
        other => Err(MessagingError::protocol(format!(
            "unexpected connect answer {other}"
        ))),
    }
}

async fn first_command(framed: &mut Framed<TcpStream, CommandCodec>) -> Result<Command> {
    loop {
        match framed.next().await {
            Some(Ok(Command {
                body: CommandBody::KeepAlive(_),
                ..
            })) => continue,
            Some(Ok(command)) => return Ok(command),
            Some(Err(error)) => return Err(error),
            None => {
                return Err(MessagingError::transport(
                    "connection closed during negotiation",
                ))
            }
        }
    }
}
