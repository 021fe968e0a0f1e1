//! Newline-delimited JSON codec for worker streams.
//!
//! One JSON value per line, terminated by `\n` and flushed before the peer's
//! next read. Works over any AsyncRead/AsyncWrite (child stdio, pipes,
//! in-memory duplex streams).

use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Maximum accepted line length: 8 MiB.
///
/// Caps buffering for an unterminated or runaway line from a misbehaving
/// worker. A frame this large has no business on the control stream.
pub const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

/// Framing and parse errors on the line transport.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// A complete line was read but is not valid JSON. Carries the raw text
    /// so the caller can report exactly what the peer sent.
    #[error("malformed frame ({source}): {line:?}")]
    Malformed {
        line: String,
        source: serde_json::Error,
    },

    /// A line exceeded [`MAX_FRAME_BYTES`] without a terminating newline.
    #[error("frame too long: exceeded {} bytes", MAX_FRAME_BYTES)]
    TooLong,

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Codec that frames messages with `\n` and serializes with JSON.
///
/// Decoding an incomplete buffer yields `None` (more bytes needed); end of
/// stream with no buffered bytes is stream end, not an error. A line that
/// fails to parse is [`FrameError::Malformed`].
pub struct JsonLinesCodec<T> {
    _phantom: PhantomData<T>,
}

impl<T> Default for JsonLinesCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JsonLinesCodec<T> {
    pub fn new() -> Self {
        Self {
            _phantom: PhantomData,
        }
    }
}

fn parse_line<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, FrameError> {
    // Tolerate a CR left by a \r\n-writing peer.
    let bytes = match bytes {
        [head @ .., b'\r'] => head,
        _ => bytes,
    };
    serde_json::from_slice(bytes).map_err(|source| FrameError::Malformed {
        line: String::from_utf8_lossy(bytes).into_owned(),
        source,
    })
}

impl<T: DeserializeOwned> Decoder for JsonLinesCodec<T> {
    type Item = T;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match src.iter().position(|&b| b == b'\n') {
            Some(pos) => {
                let line = src.split_to(pos + 1);
                parse_line(&line[..pos]).map(Some)
            }
            None if src.len() > MAX_FRAME_BYTES => Err(FrameError::TooLong),
            None => Ok(None),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(item) => Ok(Some(item)),
            None if src.is_empty() => Ok(None),
            None => {
                // Final line without a trailing newline; the peer closed the
                // stream right after it.
                let line = src.split_to(src.len());
                parse_line(&line).map(Some)
            }
        }
    }
}

impl<T: Serialize> Encoder<T> for JsonLinesCodec<T> {
    type Error = FrameError;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = serde_json::to_vec(&item)
            .map_err(|e| FrameError::Io(io::Error::new(io::ErrorKind::InvalidData, e)))?;
        dst.reserve(json.len() + 1);
        dst.put_slice(&json);
        dst.put_u8(b'\n');
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    #[test]
    fn codec_roundtrip_value() {
        let mut codec = JsonLinesCodec::<Value>::new();
        let mut buf = BytesMut::new();

        codec.encode(json!({"geometry": "orange"}), &mut buf).unwrap();
        assert!(buf.ends_with(b"\n"));

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, json!({"geometry": "orange"}));
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_splits_multiple_frames() {
        let mut codec = JsonLinesCodec::<Value>::new();
        let mut buf = BytesMut::from(&b"1\n\"two\"\n[3]\n"[..]);

        assert_eq!(codec.decode(&mut buf).unwrap(), Some(json!(1)));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(json!("two")));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(json!([3])));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn decode_waits_for_newline() {
        let mut codec = JsonLinesCodec::<Value>::new();
        let mut buf = BytesMut::from(&b"{\"partial\":"[..]);

        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b" 1}\n");
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(json!({"partial": 1})));
    }

    #[test]
    fn malformed_frame_keeps_raw_line() {
        let mut codec = JsonLinesCodec::<Value>::new();
        let mut buf = BytesMut::from(&b"not json\n"[..]);

        match codec.decode(&mut buf) {
            Err(FrameError::Malformed { line, .. }) => assert_eq!(line, "not json"),
            other => panic!("expected Malformed, got {other:?}"),
        }
    }

    #[test]
    fn tolerates_crlf() {
        let mut codec = JsonLinesCodec::<Value>::new();
        let mut buf = BytesMut::from(&b"\"closing\"\r\n"[..]);

        assert_eq!(codec.decode(&mut buf).unwrap(), Some(json!("closing")));
    }

    #[test]
    fn decode_eof_parses_unterminated_tail() {
        let mut codec = JsonLinesCodec::<Value>::new();
        let mut buf = BytesMut::from(&b"\"closing\""[..]);

        assert_eq!(codec.decode_eof(&mut buf).unwrap(), Some(json!("closing")));
        assert_eq!(codec.decode_eof(&mut buf).unwrap(), None);
    }

    #[test]
    fn decode_eof_empty_is_stream_end() {
        let mut codec = JsonLinesCodec::<Value>::new();
        let mut buf = BytesMut::new();

        assert_eq!(codec.decode_eof(&mut buf).unwrap(), None);
    }

    #[test]
    fn oversized_line_is_rejected() {
        let mut codec = JsonLinesCodec::<Value>::new();
        let mut buf = BytesMut::new();
        buf.resize(MAX_FRAME_BYTES + 1, b'x');

        assert!(matches!(codec.decode(&mut buf), Err(FrameError::TooLong)));
    }
}
