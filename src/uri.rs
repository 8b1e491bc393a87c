//! Broker URI parsing.
//!
//! A broker is addressed as `protocol://host:port?opt=val&opt=val`. The
//! recognized option set is deliberately small; unknown options are logged
//! and ignored so URIs written for richer clients still connect.

use std::time::Duration;

use crate::error::{MessagingError, Result};

/// Wire protocol selected by the `wireFormat` URI option.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum WireFormatKind {
    /// Length-prefixed binary framing, the broker's native protocol.
    #[default]
    OpenWire,
    /// Line-oriented text framing terminated by NUL.
    Stomp,
}

/// Options recognized in the URI query string.
///
/// Durations are given in milliseconds on the wire; `so_linger` follows the
/// socket convention where a negative value disables lingering entirely.
#[derive(Clone, Debug)]
pub struct UriOptions {
    /// `wireFormat` — protocol spoken after connect.
    pub wire_format: WireFormatKind,
    /// `wireFormat.maxInactivityDuration` — read-side liveness window.
    pub max_inactivity_duration: Duration,
    /// `wireFormat.tightEncodingEnabled` — advertise tight encoding support.
    pub tight_encoding_enabled: bool,
    /// `wireFormat.maxFrameSize` — upper bound accepted for a single frame.
    pub max_frame_size: usize,
    /// `transport.useAsyncSend` — fire-and-forget message sends.
    pub use_async_send: bool,
    /// `transport.commandTracingEnabled` — log every command at trace level.
    pub command_tracing_enabled: bool,
    /// `transport.requestTimeout` — deadline on correlated requests.
    pub request_timeout: Duration,
    /// `transport.closeTimeout` — bound on the shutdown handshake.
    pub close_timeout: Duration,
    /// `socket.tcpNoDelay`.
    pub tcp_no_delay: bool,
    /// `socket.soLinger` in seconds, `-1` disables.
    pub so_linger: i32,
    /// `failover.maxReconnectAttempts` — zero leaves failover off.
    pub max_reconnect_attempts: u32,
    /// `failover.initialReconnectDelay`.
    pub initial_reconnect_delay: Duration,
}

impl Default for UriOptions {
    fn default() -> Self {
        Self {
            wire_format: WireFormatKind::OpenWire,
            max_inactivity_duration: Duration::from_millis(30_000),
            tight_encoding_enabled: false,
            max_frame_size: 16 * 1024 * 1024,
            use_async_send: false,
            command_tracing_enabled: false,
            request_timeout: Duration::from_millis(30_000),
            close_timeout: Duration::from_millis(15_000),
            tcp_no_delay: true,
            so_linger: -1,
            max_reconnect_attempts: 0,
            initial_reconnect_delay: Duration::from_millis(1_000),
        }
    }
}

impl UriOptions {
    /// Whether the failover layer should wrap the transport.
    #[must_use]
    pub fn failover_enabled(&self) -> bool {
        self.max_reconnect_attempts > 0
    }
}

/// A parsed broker address.
#[derive(Clone, Debug)]
pub struct BrokerUri {
    /// Transport scheme, currently always `tcp`.
    pub scheme: String,
    /// Broker host name or address literal.
    pub host: String,
    /// Broker port.
    pub port: u16,
    /// Parsed query options.
    pub options: UriOptions,
}

impl BrokerUri {
    /// Parse a `protocol://host:port?opt=val` URI.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::IllegalArgument`] when the URI is
    /// structurally malformed or a recognized option has an unparsable
    /// value.
    pub fn parse(uri: &str) -> Result<Self> {
        let (scheme, rest) = uri
            .split_once("://")
            .ok_or_else(|| MessagingError::illegal_argument(format!("missing scheme: {uri}")))?;
        if scheme != "tcp" {
            return Err(MessagingError::illegal_argument(format!(
                "unsupported scheme `{scheme}`"
            )));
        }

        let (authority, query) = match rest.split_once('?') {
            Some((authority, query)) => (authority, Some(query)),
            None => (rest, None),
        };
        let (host, port) = authority
            .rsplit_once(':')
            .ok_or_else(|| MessagingError::illegal_argument(format!("missing port: {uri}")))?;
        if host.is_empty() {
            return Err(MessagingError::illegal_argument(format!(
                "missing host: {uri}"
            )));
        }
        let port: u16 = port
            .parse()
            .map_err(|_| MessagingError::illegal_argument(format!("invalid port `{port}`")))?;

        let mut options = UriOptions::default();
        if let Some(query) = query {
            for pair in query.split('&').filter(|p| !p.is_empty()) {
                let (key, value) = pair.split_once('=').ok_or_else(|| {
                    MessagingError::illegal_argument(format!("option without value: `{pair}`"))
                })?;
                apply_option(&mut options, key, value)?;
            }
        }

        Ok(Self {
            scheme: scheme.to_owned(),
            host: host.to_owned(),
            port,
            options,
        })
    }
}

impl std::fmt::Display for BrokerUri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

fn apply_option(options: &mut UriOptions, key: &str, value: &str) -> Result<()> {
    match key {
        "wireFormat" => {
            options.wire_format = match value {
                "openwire" => WireFormatKind::OpenWire,
                "stomp" => WireFormatKind::Stomp,
                other => {
                    return Err(MessagingError::illegal_argument(format!(
                        "unknown wire format `{other}`"
                    )))
                }
            };
        }
        "wireFormat.maxInactivityDuration" => {
            options.max_inactivity_duration = Duration::from_millis(parse_num(key, value)?);
        }
        "wireFormat.tightEncodingEnabled" => {
            options.tight_encoding_enabled = parse_bool(key, value)?;
        }
        "wireFormat.maxFrameSize" => {
            options.max_frame_size = usize::try_from(parse_num(key, value)?)
                .map_err(|_| MessagingError::illegal_argument("maxFrameSize out of range"))?;
        }
        "transport.useAsyncSend" => options.use_async_send = parse_bool(key, value)?,
        "transport.commandTracingEnabled" => {
            options.command_tracing_enabled = parse_bool(key, value)?;
        }
        "transport.requestTimeout" => {
            options.request_timeout = Duration::from_millis(parse_num(key, value)?);
        }
        "transport.closeTimeout" => {
            options.close_timeout = Duration::from_millis(parse_num(key, value)?);
        }
        "socket.tcpNoDelay" => options.tcp_no_delay = parse_bool(key, value)?,
        "socket.soLinger" => {
            options.so_linger = value.parse().map_err(|_| {
                MessagingError::illegal_argument(format!("invalid {key} `{value}`"))
            })?;
        }
        "failover.maxReconnectAttempts" => {
            options.max_reconnect_attempts = u32::try_from(parse_num(key, value)?)
                .map_err(|_| MessagingError::illegal_argument("maxReconnectAttempts out of range"))?;
        }
        "failover.initialReconnectDelay" => {
            options.initial_reconnect_delay = Duration::from_millis(parse_num(key, value)?);
        }
        other => log::warn!("ignoring unrecognized URI option `{other}`"),
    }
    Ok(())
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(MessagingError::illegal_argument(format!(
            "invalid {key} `{other}`, expected true or false"
        ))),
    }
}

fn parse_num(key: &str, value: &str) -> Result<u64> {
    value
        .parse()
        .map_err(|_| MessagingError::illegal_argument(format!("invalid {key} `{value}`")))
}
