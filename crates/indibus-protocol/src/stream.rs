//! Async message reader and writer over byte streams.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use indibus_core::Message;

use crate::decode::StreamDecoder;
use crate::encode::encode_message;
use crate::error::ProtocolResult;

const READ_CHUNK: usize = 64 * 1024;

/// Reads messages from a byte stream.
#[derive(Debug)]
pub struct FrameReader<R> {
    inner: R,
    decoder: StreamDecoder,
    chunk: Vec<u8>,
    eof: bool,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_decoder(inner, StreamDecoder::new())
    }

    /// Uses a preconfigured decoder (for example with a smaller frame limit).
    pub fn with_decoder(inner: R, decoder: StreamDecoder) -> Self {
        Self {
            inner,
            decoder,
            chunk: vec![0; READ_CHUNK],
            eof: false,
        }
    }

    /// Returns the next message, or `Ok(None)` once the peer closed the stream.
    ///
    /// Recoverable errors (see [`ProtocolError::is_recoverable`]) leave the
    /// reader usable; the caller decides whether to log and continue.
    ///
    /// [`ProtocolError::is_recoverable`]: crate::ProtocolError::is_recoverable
    pub async fn read_message(&mut self) -> ProtocolResult<Option<Message>> {
        loop {
            if let Some(result) = self.decoder.next_message() {
                return result.map(Some);
            }
            if self.eof {
                if self.decoder.has_partial_frame() {
                    tracing::debug!("stream closed in the middle of a frame");
                }
                return Ok(None);
            }
            let n = self.inner.read(&mut self.chunk).await?;
            if n == 0 {
                self.eof = true;
            } else {
                self.decoder.feed(&self.chunk[..n]);
            }
        }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

/// Writes messages to a byte stream, one frame per call.
#[derive(Debug)]
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Encodes and flushes one message.
    pub async fn write_message(&mut self, message: &Message) -> ProtocolResult<()> {
        let bytes = encode_message(message)?;
        self.write_raw(&bytes).await
    }

    /// Writes an already encoded frame.
    pub async fn write_raw(&mut self, frame: &[u8]) -> ProtocolResult<()> {
        self.inner.write_all(frame).await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> ProtocolResult<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProtocolError;
    use indibus_core::{DelProperty, GetProperties};

    #[tokio::test]
    async fn reads_until_eof() {
        let (client, server) = tokio::io::duplex(64);
        let mut writer = FrameWriter::new(client);
        let mut reader = FrameReader::new(server);

        writer
            .write_message(&Message::GetProperties(GetProperties::all()))
            .await
            .unwrap();
        writer
            .write_message(&Message::Delete(DelProperty::device("Camera")))
            .await
            .unwrap();
        writer.shutdown().await.unwrap();
        drop(writer);

        assert!(matches!(
            reader.read_message().await.unwrap(),
            Some(Message::GetProperties(_))
        ));
        assert!(matches!(
            reader.read_message().await.unwrap(),
            Some(Message::Delete(_))
        ));
        assert!(reader.read_message().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reader_survives_malformed_frames() {
        let input: &[u8] = b"<delProperty/><delProperty device=\"A\"/>";
        let mut reader = FrameReader::new(input);
        assert!(matches!(
            reader.read_message().await,
            Err(ProtocolError::Parse { .. })
        ));
        assert!(matches!(
            reader.read_message().await.unwrap(),
            Some(Message::Delete(d)) if d.device == "A"
        ));
        assert!(reader.read_message().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oversized_frames_are_skipped() {
        let mut big = b"<message message=\"".to_vec();
        big.extend(std::iter::repeat_n(b'x', 256));
        big.extend_from_slice(b"\"/><delProperty device=\"A\"/>");
        let mut reader =
            FrameReader::with_decoder(big.as_slice(), StreamDecoder::with_max_frame_size(64));
        assert!(matches!(
            reader.read_message().await,
            Err(ProtocolError::FrameTooLarge { max: 64 })
        ));
        assert!(matches!(
            reader.read_message().await.unwrap(),
            Some(Message::Delete(_))
        ));
    }
}
