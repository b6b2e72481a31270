//! Length-prefixed protobuf framing
//!
//! Every stream interface in bhid (tracker TCP, CLI UNIX socket, peer UTP)
//! carries messages as a 4-byte big-endian length followed by the encoded
//! protobuf body. Datagrams carry the same layout in a single packet.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use prost::Message;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ProtocolError;

/// Upper bound on a single frame body
pub const MAX_FRAME: usize = 4 * 1024 * 1024;

/// Length prefix size
pub const HEADER_LEN: usize = 4;

/// Encode a message with its length prefix
pub fn encode_frame<M: Message>(msg: &M) -> Bytes {
    let body_len = msg.encoded_len();
    let mut buf = BytesMut::with_capacity(HEADER_LEN + body_len);
    buf.put_u32(body_len as u32);
    msg.encode(&mut buf).expect("BytesMut grows on demand");
    buf.freeze()
}

/// Decode a message from a complete frame (prefix included), as found in
/// a single UDP datagram
pub fn decode_datagram<M: Message + Default>(data: &[u8]) -> Result<M, ProtocolError> {
    if data.len() < HEADER_LEN {
        return Err(ProtocolError::FrameTooLarge {
            size: data.len(),
            max: MAX_FRAME,
        });
    }
    let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
    if len > MAX_FRAME || data.len() < HEADER_LEN + len {
        return Err(ProtocolError::FrameTooLarge {
            size: len,
            max: MAX_FRAME,
        });
    }
    Ok(M::decode(&data[HEADER_LEN..HEADER_LEN + len])?)
}

/// Read one framed message from a stream
pub async fn read_frame<R, M>(reader: &mut R) -> std::io::Result<Result<M, ProtocolError>>
where
    R: AsyncRead + Unpin,
    M: Message + Default,
{
    let len = reader.read_u32().await? as usize;
    if len > MAX_FRAME {
        return Ok(Err(ProtocolError::FrameTooLarge {
            size: len,
            max: MAX_FRAME,
        }));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(M::decode(&body[..]).map_err(ProtocolError::from))
}

/// Write one framed message to a stream
pub async fn write_frame<W, M>(writer: &mut W, msg: &M) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
    M: Message,
{
    writer.write_all(&encode_frame(msg)).await?;
    writer.flush().await
}

/// Incremental frame reassembler for chunked byte streams (UTP delivery)
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: BytesMut,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append incoming bytes
    pub fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Pop the next complete frame body, if one is buffered
    pub fn next_frame(&mut self) -> Result<Option<Bytes>, ProtocolError> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let len =
            u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if len > MAX_FRAME {
            return Err(ProtocolError::FrameTooLarge {
                size: len,
                max: MAX_FRAME,
            });
        }
        if self.buf.len() < HEADER_LEN + len {
            return Ok(None);
        }
        self.buf.advance(HEADER_LEN);
        Ok(Some(self.buf.split_to(len).freeze()))
    }

    /// Bytes currently buffered
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::peer::{inner_message, InnerMessage};

    fn sample() -> InnerMessage {
        InnerMessage {
            r#type: inner_message::Type::Data as i32,
            id: "0b0e48fa-22e5-4355-92ad-45c2a0998994".to_string(),
            data: b"ping".to_vec(),
        }
    }

    #[test]
    fn test_datagram_round_trip() {
        let frame = encode_frame(&sample());
        let decoded: InnerMessage = decode_datagram(&frame).unwrap();
        assert_eq!(decoded, sample());
    }

    #[test]
    fn test_datagram_truncated() {
        let frame = encode_frame(&sample());
        let result: Result<InnerMessage, _> = decode_datagram(&frame[..frame.len() - 1]);
        assert!(result.is_err());
    }

    #[test]
    fn test_frame_buffer_split_delivery() {
        let frame = encode_frame(&sample());
        let mut fb = FrameBuffer::new();

        // Feed one byte at a time; the frame must appear exactly once
        let mut seen = 0;
        for b in frame.iter() {
            fb.extend(std::slice::from_ref(b));
            if let Some(body) = fb.next_frame().unwrap() {
                let msg = InnerMessage::decode(&body[..]).unwrap();
                assert_eq!(msg, sample());
                seen += 1;
            }
        }
        assert_eq!(seen, 1);
        assert!(fb.is_empty());
    }

    #[test]
    fn test_frame_buffer_back_to_back() {
        let frame = encode_frame(&sample());
        let mut fb = FrameBuffer::new();
        fb.extend(&frame);
        fb.extend(&frame);

        assert!(fb.next_frame().unwrap().is_some());
        assert!(fb.next_frame().unwrap().is_some());
        assert!(fb.next_frame().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stream_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, &sample()).await.unwrap();
        let msg: InnerMessage = read_frame(&mut b).await.unwrap().unwrap();
        assert_eq!(msg, sample());
    }
}
