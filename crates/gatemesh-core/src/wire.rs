//! gatemesh wire format: framing and protocol constants.
//!
//! Messages travel as JSON inside length-delimited frames: a 4-byte
//! big-endian length followed by that many bytes of UTF-8 JSON. Frames
//! larger than [`MAX_FRAME_LEN`] are a stream error and close the
//! connection. A well-framed body that fails to parse is reported per
//! frame so the reader can drop it and keep the connection.

use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::error::NetworkError;
use crate::message::Message;

/// Largest accepted frame body.
pub const MAX_FRAME_LEN: usize = 1 << 20;

/// Heartbeat interval is `window / HEARTBEAT_DIVISOR`.
pub const HEARTBEAT_DIVISOR: u32 = 4;

/// Maximum peers offered in a single `JoinResponse`.
pub const ALTERNATIVES_LIMIT: usize = 8;

/// HTTP header marking a request relayed by another gateway node. The
/// value is the relaying node's id.
pub const FROM_PEER_HEADER: &str = "x-gatemesh-from-peer";

/// UDP hole-punch datagrams.
pub const PUNCH_PROBE: &[u8] = b"gatemesh/punch";
pub const PUNCH_ACK: &[u8] = b"gatemesh/punch-ack";

/// Length-delimited JSON codec for [`Message`].
#[derive(Debug)]
pub struct MessageCodec {
    frames: LengthDelimitedCodec,
}

impl MessageCodec {
    pub fn new() -> Self {
        Self {
            frames: LengthDelimitedCodec::builder()
                .max_frame_length(MAX_FRAME_LEN)
                .new_codec(),
        }
    }
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for MessageCodec {
    /// Inner `Err` is a bad body in an otherwise intact frame.
    type Item = Result<Message, serde_json::Error>;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.frames.decode(src)? {
            Some(frame) => Ok(Some(Message::from_bytes(&frame))),
            None => Ok(None),
        }
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = NetworkError;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let body = msg.to_bytes()?;
        self.frames.encode(Bytes::from(body), dst)?;
        Ok(())
    }
}
