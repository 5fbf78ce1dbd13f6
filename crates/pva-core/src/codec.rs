//! Frame codec for the pva wire protocol.
//!
//! Every frame starts with an 8-byte header:
//!
//! ```text
//! [magic 0xCA] [version] [flags] [command] [payload size, u32]
//! ```
//!
//! Flag bit 0 marks a control frame, bit 6 marks server-to-client traffic,
//! and bit 7 gives the byte order of the size field. Application frames are
//! followed by `payload size` bytes of CBOR; control frames carry their
//! value in the size field and have no payload. Encoders here always write
//! big-endian headers, decoders honor the flag on each frame.

use std::io::Cursor;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{PvaError, PvaResult};

/// First byte of every frame.
pub const MAGIC: u8 = 0xCA;
/// Protocol version spoken by this implementation.
pub const PROTOCOL_VERSION: u8 = 2;
/// Size of the fixed frame header.
pub const HEADER_SIZE: usize = 8;

/// Flag bit: this frame is a control frame.
pub const FLAG_CONTROL: u8 = 0x01;
/// Flag bit: this frame was sent by a server.
pub const FLAG_FROM_SERVER: u8 = 0x40;
/// Flag bit: the size field is big-endian.
pub const FLAG_BIG_ENDIAN: u8 = 0x80;

/// Control command: fix the byte order for the rest of the connection.
pub const CTRL_SET_BYTE_ORDER: u8 = 0x02;

/// Hard cap on the payload of a single frame.
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;
/// Receive buffer size advertised during connection validation.
pub const RECEIVE_BUFFER_SIZE: usize = 32 * 1024;

/// Decoded fixed-size frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub version: u8,
    pub flags: u8,
    pub command: u8,
    pub payload_size: u32,
}

impl FrameHeader {
    pub fn is_control(&self) -> bool {
        self.flags & FLAG_CONTROL != 0
    }

    pub fn parse(bytes: &[u8; HEADER_SIZE]) -> PvaResult<Self> {
        if bytes[0] != MAGIC {
            return Err(PvaError::Codec(format!("bad frame magic: {:#04x}", bytes[0])));
        }
        let flags = bytes[2];
        let size = [bytes[4], bytes[5], bytes[6], bytes[7]];
        let payload_size = if flags & FLAG_BIG_ENDIAN != 0 {
            u32::from_be_bytes(size)
        } else {
            u32::from_le_bytes(size)
        };
        Ok(FrameHeader { version: bytes[1], flags, command: bytes[3], payload_size })
    }

    /// Serializes the header. The size field is written big-endian, so
    /// `flags` should include [`FLAG_BIG_ENDIAN`].
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0] = MAGIC;
        out[1] = self.version;
        out[2] = self.flags;
        out[3] = self.command;
        out[4..].copy_from_slice(&self.payload_size.to_be_bytes());
        out
    }
}

/// An application message: command byte plus CBOR payload.
#[derive(Debug, Clone)]
pub struct Message {
    pub command: u8,
    pub payload: Vec<u8>,
}

impl Message {
    /// Encodes a message body to CBOR under the given command.
    pub fn encode<T: Serialize>(command: impl Into<u8>, body: &T) -> PvaResult<Message> {
        let mut payload = Vec::new();
        ciborium::into_writer(body, &mut payload)?;
        Ok(Message { command: command.into(), payload })
    }

    /// Decodes the CBOR payload into a typed message body.
    pub fn decode<T: DeserializeOwned>(&self) -> PvaResult<T> {
        Ok(ciborium::from_reader(Cursor::new(&self.payload))?)
    }
}

/// Reads frames from a byte stream and yields application messages.
///
/// Control frames are consumed internally and never surface to the caller.
pub struct FramedReader<R> {
    inner: R,
}

impl<R: AsyncRead + Unpin> FramedReader<R> {
    pub fn new(inner: R) -> Self {
        FramedReader { inner }
    }

    /// Next application message, or `None` once the peer closes the stream
    /// between frames. A close in the middle of a frame is an error.
    pub async fn next(&mut self) -> PvaResult<Option<Message>> {
        loop {
            let mut header = [0u8; HEADER_SIZE];
            // EOF before the first header byte is a clean shutdown.
            let n = self.inner.read(&mut header[..1]).await?;
            if n == 0 {
                return Ok(None);
            }
            self.inner.read_exact(&mut header[1..]).await?;
            let header = FrameHeader::parse(&header)?;
            if header.is_control() {
                // The only control frame we expect is SET_BYTE_ORDER; our
                // decoder already honors the per-frame byte order flag, so
                // control frames carry nothing actionable.
                continue;
            }
            let size = header.payload_size as usize;
            if size > MAX_PAYLOAD_SIZE {
                return Err(PvaError::Codec(format!(
                    "frame payload of {size} bytes exceeds the {MAX_PAYLOAD_SIZE} byte limit"
                )));
            }
            let mut payload = vec![0u8; size];
            self.inner.read_exact(&mut payload).await?;
            return Ok(Some(Message { command: header.command, payload }));
        }
    }
}

/// Writes frames to a byte stream.
///
/// The direction flag is fixed at construction; headers always go out
/// big-endian.
pub struct FramedWriter<W> {
    inner: W,
    flags: u8,
}

impl<W: AsyncWrite + Unpin> FramedWriter<W> {
    /// Writer for the server side of a connection.
    pub fn server(inner: W) -> Self {
        FramedWriter { inner, flags: FLAG_FROM_SERVER | FLAG_BIG_ENDIAN }
    }

    /// Writer for the client side of a connection.
    pub fn client(inner: W) -> Self {
        FramedWriter { inner, flags: FLAG_BIG_ENDIAN }
    }

    pub async fn send_app(&mut self, msg: &Message) -> PvaResult<()> {
        if msg.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(PvaError::Codec(format!(
                "refusing to send a {} byte payload",
                msg.payload.len()
            )));
        }
        let header = FrameHeader {
            version: PROTOCOL_VERSION,
            flags: self.flags,
            command: msg.command,
            payload_size: msg.payload.len() as u32,
        };
        self.inner.write_all(&header.to_bytes()).await?;
        self.inner.write_all(&msg.payload).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Sends a control frame. The value rides in the size field; no payload
    /// follows.
    pub async fn send_control(&mut self, command: u8, value: u32) -> PvaResult<()> {
        let header = FrameHeader {
            version: PROTOCOL_VERSION,
            flags: self.flags | FLAG_CONTROL,
            command,
            payload_size: value,
        };
        self.inner.write_all(&header.to_bytes()).await?;
        self.inner.flush().await?;
        Ok(())
    }
}

/// Serializes one message as a single datagram.
pub fn encode_datagram(msg: &Message, from_server: bool) -> PvaResult<Vec<u8>> {
    if msg.payload.len() > MAX_PAYLOAD_SIZE {
        return Err(PvaError::Codec(format!(
            "refusing to send a {} byte datagram payload",
            msg.payload.len()
        )));
    }
    let mut flags = FLAG_BIG_ENDIAN;
    if from_server {
        flags |= FLAG_FROM_SERVER;
    }
    let header = FrameHeader {
        version: PROTOCOL_VERSION,
        flags,
        command: msg.command,
        payload_size: msg.payload.len() as u32,
    };
    let mut out = Vec::with_capacity(HEADER_SIZE + msg.payload.len());
    out.extend_from_slice(&header.to_bytes());
    out.extend_from_slice(&msg.payload);
    Ok(out)
}

/// Parses one datagram into a message. The datagram must contain exactly
/// one application frame.
pub fn decode_datagram(buf: &[u8]) -> PvaResult<Message> {
    if buf.len() < HEADER_SIZE {
        return Err(PvaError::Codec(format!("short datagram: {} bytes", buf.len())));
    }
    let mut header = [0u8; HEADER_SIZE];
    header.copy_from_slice(&buf[..HEADER_SIZE]);
    let header = FrameHeader::parse(&header)?;
    if header.is_control() {
        return Err(PvaError::InvalidMessage("control frame in datagram".into()));
    }
    let body = &buf[HEADER_SIZE..];
    if header.payload_size as usize != body.len() {
        return Err(PvaError::Codec(format!(
            "datagram size mismatch: header says {}, got {}",
            header.payload_size,
            body.len()
        )));
    }
    Ok(Message { command: header.command, payload: body.to_vec() })
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};
    use tokio::io::AsyncWriteExt;

    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Ping {
        seq: i32,
        text: String,
    }

    #[test]
    fn header_round_trip() {
        let header = FrameHeader {
            version: PROTOCOL_VERSION,
            flags: FLAG_FROM_SERVER | FLAG_BIG_ENDIAN,
            command: 0x14,
            payload_size: 513,
        };
        let parsed = FrameHeader::parse(&header.to_bytes()).unwrap();
        assert_eq!(parsed, header);
        assert!(!parsed.is_control());
    }

    #[test]
    fn header_honors_little_endian_flag() {
        let bytes = [MAGIC, 1, 0x00, 0x07, 0x02, 0x01, 0x00, 0x00];
        let header = FrameHeader::parse(&bytes).unwrap();
        assert_eq!(header.payload_size, 0x0102);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let bytes = [0x00, 1, 0x80, 0x07, 0, 0, 0, 0];
        let err = FrameHeader::parse(&bytes).unwrap_err();
        assert!(err.to_string().contains("magic"));
    }

    #[test]
    fn message_body_round_trip() {
        let body = Ping { seq: 7, text: "hello".into() };
        let msg = Message::encode(0x02u8, &body).unwrap();
        assert_eq!(msg.command, 0x02);
        let back: Ping = msg.decode().unwrap();
        assert_eq!(back, body);
    }

    #[tokio::test]
    async fn reader_skips_control_frames() {
        let (client, server) = tokio::io::duplex(4096);
        let mut writer = FramedWriter::server(client);
        let mut reader = FramedReader::new(server);

        writer.send_control(CTRL_SET_BYTE_ORDER, 0).await.unwrap();
        let msg = Message::encode(0x02u8, &Ping { seq: 1, text: "after".into() }).unwrap();
        writer.send_app(&msg).await.unwrap();

        let got = reader.next().await.unwrap().unwrap();
        assert_eq!(got.command, 0x02);
        let body: Ping = got.decode().unwrap();
        assert_eq!(body.text, "after");
    }

    #[tokio::test]
    async fn reader_reports_clean_eof_as_none() {
        let (client, server) = tokio::io::duplex(4096);
        let mut writer = FramedWriter::client(client);
        let mut reader = FramedReader::new(server);

        let msg = Message::encode(0x02u8, &Ping { seq: 1, text: "bye".into() }).unwrap();
        writer.send_app(&msg).await.unwrap();
        drop(writer);

        assert!(reader.next().await.unwrap().is_some());
        assert!(reader.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn truncated_frame_is_an_error() {
        let (mut client, server) = tokio::io::duplex(4096);
        let mut reader = FramedReader::new(server);

        client.write_all(&[MAGIC, PROTOCOL_VERSION, 0x80]).await.unwrap();
        drop(client);

        assert!(reader.next().await.is_err());
    }

    #[tokio::test]
    async fn oversize_payload_is_rejected_before_reading_it() {
        let (mut client, server) = tokio::io::duplex(4096);
        let mut reader = FramedReader::new(server);

        let header = FrameHeader {
            version: PROTOCOL_VERSION,
            flags: FLAG_BIG_ENDIAN,
            command: 0x14,
            payload_size: (MAX_PAYLOAD_SIZE as u32) + 1,
        };
        client.write_all(&header.to_bytes()).await.unwrap();

        let err = reader.next().await.unwrap_err();
        assert!(err.to_string().contains("exceeds"));
    }

    #[test]
    fn datagram_round_trip() {
        let msg = Message::encode(0x03u8, &Ping { seq: 9, text: "find".into() }).unwrap();
        let wire = encode_datagram(&msg, true).unwrap();
        assert_eq!(wire[0], MAGIC);
        assert_eq!(wire[2] & FLAG_FROM_SERVER, FLAG_FROM_SERVER);

        let back = decode_datagram(&wire).unwrap();
        assert_eq!(back.command, 0x03);
        let body: Ping = back.decode().unwrap();
        assert_eq!(body.seq, 9);
    }

    #[test]
    fn datagram_rejects_control_and_short_input() {
        assert!(decode_datagram(&[MAGIC, 1]).is_err());

        let control = FrameHeader {
            version: PROTOCOL_VERSION,
            flags: FLAG_BIG_ENDIAN | FLAG_CONTROL,
            command: CTRL_SET_BYTE_ORDER,
            payload_size: 0,
        };
        assert!(decode_datagram(&control.to_bytes()).is_err());
    }

    #[test]
    fn datagram_rejects_size_mismatch() {
        let msg = Message::encode(0x03u8, &Ping { seq: 1, text: "x".into() }).unwrap();
        let mut wire = encode_datagram(&msg, false).unwrap();
        wire.push(0xFF);
        assert!(decode_datagram(&wire).is_err());
    }
}
