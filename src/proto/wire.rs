//! Length-prefixed frame codec for the handshake.
//!
//! Frames are a 4-byte big-endian length prefix followed by a JSON payload.
//! The length field describes only the payload size. The payload limit keeps
//! every frame small enough to travel as a single UDP datagram, which is how
//! UDP clients deliver their options.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use super::{Ack, Handshake, HandshakeError, Options, PROTOCOL_VERSION};

/// Maximum frame payload size.
pub const MAX_FRAME_SIZE: usize = 65_000;

/// Width of the length prefix.
const LENGTH_FIELD_LEN: usize = 4;

/// Handshake codec.
///
/// Wraps a [`LengthDelimitedCodec`] configured for:
/// - u32 big-endian length prefix (4 bytes)
/// - Max frame size: [`MAX_FRAME_SIZE`]
/// - Length field covers payload only (not the prefix itself)
pub struct HandshakeCodec {
    inner: LengthDelimitedCodec,
}

impl HandshakeCodec {
    pub fn new() -> Self {
        let inner = LengthDelimitedCodec::builder()
            .big_endian()
            .length_field_length(LENGTH_FIELD_LEN)
            .max_frame_length(MAX_FRAME_SIZE)
            .length_adjustment(0)
            .new_codec();

        Self { inner }
    }
}

impl Default for HandshakeCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder<Handshake> for HandshakeCodec {
    type Error = HandshakeError;

    fn encode(&mut self, item: Handshake, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = serde_json::to_vec(&item)?;
        if json.len() > MAX_FRAME_SIZE {
            return Err(HandshakeError::FrameTooLarge {
                len: json.len(),
                max: MAX_FRAME_SIZE,
            });
        }
        self.inner.encode(Bytes::from(json), dst)?;
        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = HandshakeError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src)? {
            Some(payload) => Ok(Some(serde_json::from_slice(&payload)?)),
            None => Ok(None),
        }
    }
}

// ---------------------------------------------------------------------------
// Frame helpers
// ---------------------------------------------------------------------------

/// Encode one message into a complete frame (prefix + payload).
pub fn encode_frame(msg: Handshake) -> Result<Bytes, HandshakeError> {
    let mut buf = BytesMut::new();
    HandshakeCodec::new().encode(msg, &mut buf)?;
    Ok(buf.freeze())
}

/// Decode a message carried by a single datagram.
///
/// The datagram must contain exactly one frame: a prefix announcing more or
/// fewer bytes than the datagram holds is rejected.
pub fn decode_datagram(datagram: &[u8]) -> Result<Handshake, HandshakeError> {
    if datagram.len() < LENGTH_FIELD_LEN {
        return Err(HandshakeError::LengthMismatch {
            announced: LENGTH_FIELD_LEN,
            actual: datagram.len(),
        });
    }
    let mut prefix = [0u8; LENGTH_FIELD_LEN];
    prefix.copy_from_slice(&datagram[..LENGTH_FIELD_LEN]);
    let announced = u32::from_be_bytes(prefix) as usize;
    if announced > MAX_FRAME_SIZE {
        return Err(HandshakeError::FrameTooLarge {
            len: announced,
            max: MAX_FRAME_SIZE,
        });
    }
    let actual = datagram.len() - LENGTH_FIELD_LEN;
    if announced != actual {
        return Err(HandshakeError::LengthMismatch { announced, actual });
    }

    let mut src = BytesMut::from(datagram);
    match HandshakeCodec::new().decode(&mut src)? {
        Some(msg) => Ok(msg),
        None => Err(HandshakeError::LengthMismatch { announced, actual }),
    }
}

/// Write one framed message and flush.
pub async fn write_message<S>(stream: &mut S, msg: Handshake) -> Result<(), HandshakeError>
where
    S: AsyncWrite + Unpin,
{
    let frame = encode_frame(msg)?;
    stream.write_all(&frame).await?;
    stream.flush().await?;
    Ok(())
}

/// Read exactly one framed message.
///
/// Reads the prefix and then exactly the announced payload, so nothing that
/// follows the frame on the stream is consumed.
pub async fn read_message<S>(stream: &mut S) -> Result<Handshake, HandshakeError>
where
    S: AsyncRead + Unpin,
{
    let mut prefix = [0u8; LENGTH_FIELD_LEN];
    stream.read_exact(&mut prefix).await?;
    let len = u32::from_be_bytes(prefix) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(HandshakeError::FrameTooLarge {
            len,
            max: MAX_FRAME_SIZE,
        });
    }

    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await?;
    Ok(serde_json::from_slice(&payload)?)
}

// ---------------------------------------------------------------------------
// Handshake steps
// ---------------------------------------------------------------------------

pub async fn send_options<S>(stream: &mut S, opt: &Options) -> Result<(), HandshakeError>
where
    S: AsyncWrite + Unpin,
{
    write_message(stream, Handshake::Options(opt.clone())).await
}

pub async fn recv_options<S>(stream: &mut S) -> Result<Options, HandshakeError>
where
    S: AsyncRead + Unpin,
{
    match read_message(stream).await? {
        Handshake::Options(opt) => {
            opt.check()?;
            Ok(opt)
        }
        other => Err(HandshakeError::Unexpected {
            expected: "options",
            got: other.kind(),
        }),
    }
}

pub async fn send_ack<S>(stream: &mut S) -> Result<(), HandshakeError>
where
    S: AsyncWrite + Unpin,
{
    write_message(stream, Handshake::Ack(Ack::new())).await
}

/// Wait for the server's ack and check its protocol version.
pub async fn recv_ack<S>(stream: &mut S) -> Result<Ack, HandshakeError>
where
    S: AsyncRead + Unpin,
{
    match read_message(stream).await? {
        Handshake::Ack(ack) if ack.version == PROTOCOL_VERSION => Ok(ack),
        Handshake::Ack(ack) => Err(HandshakeError::VersionMismatch {
            got: ack.version,
            expected: PROTOCOL_VERSION,
        }),
        other => Err(HandshakeError::Unexpected {
            expected: "ack",
            got: other.kind(),
        }),
    }
}

/// Encode options as the first datagram of a UDP session.
pub fn options_datagram(opt: &Options) -> Result<Bytes, HandshakeError> {
    encode_frame(Handshake::Options(opt.clone()))
}

/// Decode the first datagram of a UDP session.
pub fn decode_options_datagram(datagram: &[u8]) -> Result<Options, HandshakeError> {
    match decode_datagram(datagram)? {
        Handshake::Options(opt) => {
            opt.check()?;
            Ok(opt)
        }
        other => Err(HandshakeError::Unexpected {
            expected: "options",
            got: other.kind(),
        }),
    }
}
