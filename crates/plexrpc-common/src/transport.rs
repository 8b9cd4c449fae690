//! Length-prefixed framing over async byte streams.
//!
//! Wire format for every frame: `[4-byte length as u32 big-endian] + [payload]`.
//!
//! [`FrameReader`] and [`FrameWriter`] move raw frames; [`WireReader`] and
//! [`WireWriter`] layer the negotiated codec on top of them and speak in
//! header/body message pairs.

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};

use crate::codec::CodecKind;
use crate::error::{Result, RpcError};
use crate::protocol::Header;

/// Maximum frame size (100 MB), guarding against hostile length prefixes.
pub const MAX_FRAME_SIZE: usize = 100 * 1024 * 1024;

/// Reads length-prefixed frames from an async byte stream.
pub struct FrameReader<R> {
    reader: R,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    /// Reads the next frame.
    ///
    /// Returns `Ok(None)` on a clean end of stream, i.e. EOF before the first
    /// byte of a length prefix. EOF in the middle of a frame is a framing
    /// error: the peer died mid-message.
    pub async fn read_frame(&mut self) -> Result<Option<Vec<u8>>> {
        let mut len_buf = [0u8; 4];
        // The first prefix byte is read separately: EOF here is a clean close,
        // EOF anywhere later is a peer dying mid-message.
        if self.reader.read(&mut len_buf[..1]).await? == 0 {
            return Ok(None);
        }
        self.reader.read_exact(&mut len_buf[1..]).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                RpcError::Frame("stream ended mid-frame".to_string())
            } else {
                RpcError::from(e)
            }
        })?;

        let len = u32::from_be_bytes(len_buf) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(RpcError::Frame(format!(
                "frame too large: {} bytes (max {} bytes)",
                len, MAX_FRAME_SIZE
            )));
        }

        let mut buf = vec![0u8; len];
        self.reader.read_exact(&mut buf).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                RpcError::Frame("stream ended mid-frame".to_string())
            } else {
                e.into()
            }
        })?;

        Ok(Some(buf))
    }
}

/// Writes length-prefixed frames through a buffered writer.
///
/// Frames accumulate in the buffer until [`flush`](Self::flush) is called, so
/// a header/body pair can be pushed to the socket as one write.
pub struct FrameWriter<W: AsyncWrite + Unpin> {
    writer: BufWriter<W>,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: BufWriter::new(writer),
        }
    }

    pub async fn write_frame(&mut self, payload: &[u8]) -> Result<()> {
        let len = payload.len() as u32;
        self.writer.write_all(&len.to_be_bytes()).await?;
        self.writer.write_all(payload).await?;
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<()> {
        self.writer.flush().await?;
        Ok(())
    }

    /// Shuts down the underlying stream, flushing buffered frames first.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

/// Codec-aware reading side of a connection.
pub struct WireReader<R> {
    frames: FrameReader<R>,
    codec: CodecKind,
}

impl<R: AsyncRead + Unpin> WireReader<R> {
    pub fn new(frames: FrameReader<R>, codec: CodecKind) -> Self {
        Self { frames, codec }
    }

    pub fn codec(&self) -> CodecKind {
        self.codec
    }

    /// Reads the next message header; `Ok(None)` on a clean end of stream.
    pub async fn read_header(&mut self) -> Result<Option<Header>> {
        match self.frames.read_frame().await? {
            None => Ok(None),
            Some(frame) => {
                let header = self
                    .codec
                    .decode::<Header>(&frame)
                    .map_err(|e| RpcError::Frame(format!("header decode failed: {}", e)))?;
                Ok(Some(header))
            }
        }
    }

    /// Reads the body frame that follows a header.
    ///
    /// A header is always followed by a body frame, so EOF here means the
    /// stream died mid-message. The body is returned undecoded; the caller
    /// decides what (if anything) to decode it into, which keeps the stream
    /// in frame even when the message is discarded.
    pub async fn read_body(&mut self) -> Result<Vec<u8>> {
        match self.frames.read_frame().await? {
            Some(frame) => Ok(frame),
            None => Err(RpcError::Frame(
                "stream ended between header and body".to_string(),
            )),
        }
    }
}

/// Codec-aware writing side of a connection.
///
/// [`write_message`](Self::write_message) emits header then body and flushes
/// before returning, so a message is either fully on the socket or not sent
/// at all. Callers serialize access with a per-connection lock.
pub struct WireWriter<W: AsyncWrite + Unpin> {
    frames: FrameWriter<W>,
    codec: CodecKind,
}

impl<W: AsyncWrite + Unpin> WireWriter<W> {
    pub fn new(frames: FrameWriter<W>, codec: CodecKind) -> Self {
        Self { frames, codec }
    }

    pub fn codec(&self) -> CodecKind {
        self.codec
    }

    pub async fn write_message<T: Serialize>(&mut self, header: &Header, body: &T) -> Result<()> {
        let body = self.codec.encode(body)?;
        self.write_raw(header, &body).await
    }

    /// Writes a header plus an already-encoded body.
    pub async fn write_raw(&mut self, header: &Header, body: &[u8]) -> Result<()> {
        let header = self.codec.encode(header)?;
        self.frames.write_frame(&header).await?;
        self.frames.write_frame(body).await?;
        self.frames.flush().await
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.frames.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_round_trip() {
        let (client, server) = tokio::io::duplex(1024);
        let mut writer = FrameWriter::new(client);
        let mut reader = FrameReader::new(server);

        writer.write_frame(b"hello").await.unwrap();
        writer.write_frame(b"").await.unwrap();
        writer.flush().await.unwrap();

        assert_eq!(reader.read_frame().await.unwrap().unwrap(), b"hello");
        assert_eq!(reader.read_frame().await.unwrap().unwrap(), b"");
    }

    #[tokio::test]
    async fn test_clean_eof_returns_none() {
        let (client, server) = tokio::io::duplex(1024);
        let mut reader = FrameReader::new(server);
        drop(client);

        assert!(reader.read_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_truncated_frame_is_error() {
        let (mut client, server) = tokio::io::duplex(1024);
        let mut reader = FrameReader::new(server);

        // A length prefix promising 10 bytes, followed by EOF.
        client.write_all(&10u32.to_be_bytes()).await.unwrap();
        drop(client);

        let err = reader.read_frame().await.unwrap_err();
        assert!(matches!(err, RpcError::Frame(_)));
    }

    #[tokio::test]
    async fn test_truncated_length_prefix_is_error() {
        let (mut client, server) = tokio::io::duplex(1024);
        let mut reader = FrameReader::new(server);

        client.write_all(&[0u8, 0]).await.unwrap();
        drop(client);

        let err = reader.read_frame().await.unwrap_err();
        assert!(matches!(err, RpcError::Frame(_)));
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut client, server) = tokio::io::duplex(1024);
        let mut reader = FrameReader::new(server);

        let len = (MAX_FRAME_SIZE as u32) + 1;
        client.write_all(&len.to_be_bytes()).await.unwrap();

        let err = reader.read_frame().await.unwrap_err();
        assert!(err.to_string().contains("frame too large"));
    }

    #[tokio::test]
    async fn test_message_round_trip() {
        let (client, server) = tokio::io::duplex(4096);
        let mut writer = WireWriter::new(FrameWriter::new(client), CodecKind::Json);
        let mut reader = WireReader::new(FrameReader::new(server), CodecKind::Json);

        let header = Header::request("Arith.Sum", 1);
        writer.write_message(&header, &vec![1, 2, 3]).await.unwrap();

        let got = reader.read_header().await.unwrap().unwrap();
        assert_eq!(got, header);
        let body = reader.read_body().await.unwrap();
        let args: Vec<i32> = CodecKind::Json.decode(&body).unwrap();
        assert_eq!(args, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_missing_body_is_error() {
        let (client, server) = tokio::io::duplex(4096);
        let mut writer = WireWriter::new(FrameWriter::new(client), CodecKind::Json);
        let mut reader = WireReader::new(FrameReader::new(server), CodecKind::Json);

        // Emit a lone header frame, then close the stream.
        let header = CodecKind::Json.encode(&Header::request("Arith.Sum", 1)).unwrap();
        writer.frames.write_frame(&header).await.unwrap();
        writer.frames.flush().await.unwrap();
        drop(writer);

        assert!(reader.read_header().await.unwrap().is_some());
        let err = reader.read_body().await.unwrap_err();
        assert!(matches!(err, RpcError::Frame(_)));
    }

    #[tokio::test]
    async fn test_garbage_header_is_frame_error() {
        let (client, server) = tokio::io::duplex(1024);
        let mut writer = FrameWriter::new(client);
        let mut reader = WireReader::new(FrameReader::new(server), CodecKind::Json);

        writer.write_frame(b"not json").await.unwrap();
        writer.flush().await.unwrap();

        let err = reader.read_header().await.unwrap_err();
        assert!(matches!(err, RpcError::Frame(_)));
    }
}
