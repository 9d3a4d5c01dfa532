use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::frame::{encode_frame, FrameDecoder, FrameError};

/// Bytes reserved in the decoder before each read.
const READ_CHUNK: usize = 8 * 1024;

/// Lazy sequence of frames read from an async byte stream.
///
/// The decode buffer belongs to the reader, so bytes that arrive after the
/// frame a caller was waiting for are kept for the next call.
pub struct FrameReader<R> {
    inner: R,
    decoder: FrameDecoder,
    eof: bool,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            decoder: FrameDecoder::new(),
            eof: false,
        }
    }

    /// Read the next frame, or `None` once the stream is exhausted.
    pub async fn next_frame(&mut self) -> Result<Option<Value>, FrameError> {
        loop {
            if let Some(value) = self.decoder.next_frame()? {
                return Ok(Some(value));
            }
            if self.eof {
                return self.decoder.finish();
            }

            let buffer = self.decoder.buffer_mut();
            buffer.reserve(READ_CHUNK);
            let read = self.inner.read_buf(buffer).await?;
            trace!(bytes = read, "Read chunk from frame stream");
            if read == 0 {
                self.eof = true;
            }
        }
    }

    /// Read the next frame and deserialize it as `T`.
    pub async fn next_frame_as<T: DeserializeOwned>(&mut self) -> Result<Option<T>, FrameError> {
        match self.next_frame().await? {
            Some(value) => {
                let frame = value.to_string();
                serde_json::from_value(value)
                    .map(Some)
                    .map_err(|source| FrameError::Parse { frame, source })
            }
            None => Ok(None),
        }
    }

    /// Whether the underlying stream has reported end of file.
    pub fn is_exhausted(&self) -> bool {
        self.eof && self.decoder.buffered() == 0
    }
}

/// Writes frames to an async byte stream.
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Encode and write one frame.
    ///
    /// The sink is flushed before the write so earlier output is drained, and
    /// again afterwards; the frame counts as sent only once the second flush
    /// completes.
    pub async fn send<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), FrameError> {
        let bytes = encode_frame(value)?;
        self.inner.flush().await?;
        self.inner.write_all(&bytes).await?;
        self.inner.flush().await?;
        trace!(bytes = bytes.len(), "Wrote frame");
        Ok(())
    }

    /// The underlying sink, for bytes that bypass framing.
    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    /// Close the write half so the peer observes end of stream.
    pub async fn shutdown(&mut self) -> Result<(), FrameError> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_writer_to_reader_over_pipe() {
        let (client, server) = duplex(16);
        let mut writer = FrameWriter::new(client);
        let mut reader = FrameReader::new(server);

        let sent = vec![
            json!({"type": "ready"}),
            json!({"type": "response", "body": "x".repeat(100)}),
        ];
        let expected = sent.clone();

        let write = tokio::spawn(async move {
            for value in &sent {
                writer.send(value).await.unwrap();
            }
            writer.shutdown().await.unwrap();
        });

        let mut received = Vec::new();
        while let Some(value) = reader.next_frame().await.unwrap() {
            received.push(value);
        }
        write.await.unwrap();

        assert_eq!(received, expected);
        assert!(reader.is_exhausted());
    }

    #[tokio::test]
    async fn test_parse_error_aborts_only_that_read() {
        let input: &[u8] = b"{\"a\":1}\r\n{broken\r\n{\"b\":2}\r\n";
        let mut reader = FrameReader::new(input);

        assert_eq!(reader.next_frame().await.unwrap(), Some(json!({"a": 1})));
        assert!(matches!(
            reader.next_frame().await,
            Err(FrameError::Parse { .. })
        ));
        assert_eq!(reader.next_frame().await.unwrap(), Some(json!({"b": 2})));
        assert_eq!(reader.next_frame().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_next_frame_as_typed() {
        #[derive(serde::Deserialize, Debug, PartialEq)]
        struct Ping {
            seq: u32,
        }

        let input: &[u8] = b"{\"seq\":7}\r\n{\"seq\":\"x\"}\r\n";
        let mut reader = FrameReader::new(input);
        assert_eq!(
            reader.next_frame_as::<Ping>().await.unwrap(),
            Some(Ping { seq: 7 })
        );
        assert!(reader.next_frame_as::<Ping>().await.is_err());
    }
}
