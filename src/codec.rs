//! Pluggable wire codecs for the broker dialogue.
//!
//! A [`CommandCodec`] turns raw bytes into [`Command`] values and back,
//! implementing the `tokio_util` [`Decoder`]/[`Encoder`] pair so the
//! transport can drive it through a `Framed` stream. Two codecs are
//! provided: the broker's native length-prefixed binary format and the
//! NUL-terminated text format. Both enforce the configured maximum frame
//! size; a frame that declares more is a fatal protocol error.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use crate::command::Command;
use crate::error::{MessagingError, Result};
use crate::uri::WireFormatKind;

pub mod openwire;
pub mod stomp;

pub use openwire::OpenWireCodec;
pub use stomp::StompCodec;

/// Lowest protocol version this client can speak.
pub const MIN_OPENWIRE_VERSION: i32 = 1;

/// Highest protocol version this client can speak.
pub const MAX_OPENWIRE_VERSION: i32 = 1;

/// Pick the version both peers support.
///
/// # Errors
///
/// Returns [`MessagingError::Protocol`] when the peers share no version at
/// or above [`MIN_OPENWIRE_VERSION`].
pub fn negotiated_version(local: i32, remote: i32) -> Result<i32> {
    let version = local.min(remote);
    if version < MIN_OPENWIRE_VERSION {
        return Err(MessagingError::protocol(format!(
            "no common wire format version (local {local}, remote {remote})"
        )));
    }
    Ok(version)
}

/// Codec for one negotiated wire format.
#[derive(Debug)]
pub enum CommandCodec {
    /// Length-prefixed binary framing.
    OpenWire(OpenWireCodec),
    /// NUL-terminated text framing.
    Stomp(StompCodec),
}

impl CommandCodec {
    /// Create the codec for `kind` with the given frame-size bound.
    #[must_use]
    pub fn new(kind: WireFormatKind, max_frame_size: usize) -> Self {
        match kind {
            WireFormatKind::OpenWire => Self::OpenWire(OpenWireCodec::new(max_frame_size)),
            WireFormatKind::Stomp => Self::Stomp(StompCodec::new(max_frame_size)),
        }
    }

    /// Whether `command` has a mapping on this wire format.
    ///
    /// The text format cannot express several lifecycle commands; the
    /// transport answers those locally instead of putting them on the wire.
    #[must_use]
    pub fn supports(&self, command: &Command) -> bool {
        match self {
            Self::OpenWire(_) => true,
            Self::Stomp(_) => StompCodec::supports(command),
        }
    }

    /// Adopt the negotiated protocol version.
    ///
    /// Selects the marshaler registry variant for the binary format; the
    /// text format is unversioned and ignores this.
    pub fn set_version(&mut self, version: i32) {
        if let Self::OpenWire(codec) = self {
            codec.set_version(version);
        }
    }
}

impl Decoder for CommandCodec {
    type Item = Command;
    type Error = MessagingError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Command>> {
        match self {
            Self::OpenWire(codec) => codec.decode(src),
            Self::Stomp(codec) => codec.decode(src),
        }
    }
}

impl Encoder<Command> for CommandCodec {
    type Error = MessagingError;

    fn encode(&mut self, command: Command, dst: &mut BytesMut) -> Result<()> {
        match self {
            Self::OpenWire(codec) => codec.encode(command, dst),
            Self::Stomp(codec) => codec.encode(command, dst),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_negotiation_picks_the_minimum() {
        assert_eq!(negotiated_version(1, 9).expect("negotiate"), 1);
        assert_eq!(negotiated_version(5, 1).expect("negotiate"), 1);
    }

    #[test]
    fn version_below_the_floor_is_a_protocol_error() {
        assert!(matches!(
            negotiated_version(1, 0),
            Err(MessagingError::Protocol(_))
        ));
    }
}
