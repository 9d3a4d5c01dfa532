//! Line-delimited JSON framing for the relay pipe.
//!
//! Wire format: UTF-8 JSON objects, one per frame, each terminated by
//! `\r\n`. The codec knows nothing about message semantics.

mod codec;
mod io;

pub use codec::{encode_frame, FrameDecoder, DEFAULT_MAX_FRAME_BYTES, FRAME_DELIMITER};
pub use io::{FrameReader, FrameWriter};

/// Errors that can occur during frame encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// A frame's text is not valid JSON (or not the expected shape).
    #[error("malformed frame {frame:?}: {source}")]
    Parse {
        frame: String,
        #[source]
        source: serde_json::Error,
    },

    /// A frame's bytes are not valid UTF-8.
    #[error("frame is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    /// A value could not be serialized.
    #[error("failed to encode frame: {0}")]
    Encode(#[source] serde_json::Error),

    /// A frame exceeded the decoder's size limit and was dropped.
    #[error("frame of {size} bytes exceeds the {max} byte limit")]
    TooLarge { size: usize, max: usize },

    /// A serialized value contained the frame delimiter.
    #[error("encoded frame contains the frame delimiter")]
    EmbeddedDelimiter,

    /// An I/O error occurred while reading or writing frames.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),
}
