//! Length-prefixed JSON frames over a byte stream.
//!
//! Each frame is a 4-byte big-endian length followed by one JSON document.
//! Works over any AsyncRead/AsyncWrite (child pipes, in-memory duplex streams).

use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Upper bound for a single frame. Scripts travel inside `execute` frames,
/// so this is well above anything a sane plugin sends.
pub const MAX_FRAME_LENGTH: usize = 64 * 1024 * 1024;

/// Frames values of `T` as length-delimited JSON.
pub struct FrameCodec<T> {
    framing: LengthDelimitedCodec,
    _message: PhantomData<fn() -> T>,
}

impl<T> Default for FrameCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> FrameCodec<T> {
    pub fn new() -> Self {
        Self::with_max_frame_length(MAX_FRAME_LENGTH)
    }

    pub fn with_max_frame_length(max: usize) -> Self {
        Self {
            framing: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .max_frame_length(max)
                .new_codec(),
            _message: PhantomData,
        }
    }
}

fn invalid_data(err: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}

impl<T: DeserializeOwned> Decoder for FrameCodec<T> {
    type Item = T;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<T>, io::Error> {
        let Some(frame) = self.framing.decode(src)? else {
            return Ok(None);
        };
        serde_json::from_slice(&frame).map(Some).map_err(invalid_data)
    }
}

impl<T: Serialize> Encoder<T> for FrameCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), io::Error> {
        let json = serde_json::to_vec(&item).map_err(invalid_data)?;
        tracing::trace!(frame_bytes = json.len(), "Encoding frame");
        if json.len() > 1024 * 1024 {
            tracing::debug!(frame_kb = json.len() / 1024, "Large frame being encoded");
        }
        self.framing.encode(Bytes::from(json), dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::{HostMessage, WorkerMessage};

    #[test]
    fn frame_has_big_endian_length_prefix() {
        let mut codec = FrameCodec::<HostMessage>::new();
        let mut buf = BytesMut::new();
        codec.encode(HostMessage::Heartbeat, &mut buf).unwrap();

        let body = br#"{"kind":"heartbeat"}"#;
        assert_eq!(&buf[..4], &(body.len() as u32).to_be_bytes());
        assert_eq!(&buf[4..], body);
    }

    #[test]
    fn decodes_frames_split_across_reads() {
        let mut codec = FrameCodec::<WorkerMessage>::new();
        let mut encoded = BytesMut::new();
        FrameCodec::<WorkerMessage>::new()
            .encode(
                WorkerMessage::ImportFailure {
                    url: "/plugins/a.js".into(),
                    error: "ReferenceError: x is not defined".into(),
                },
                &mut encoded,
            )
            .unwrap();

        let mut partial = encoded.split_to(7);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        partial.unsplit(encoded);

        let decoded = codec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(
            decoded,
            WorkerMessage::ImportFailure {
                url: "/plugins/a.js".into(),
                error: "ReferenceError: x is not defined".into(),
            }
        );
        assert!(partial.is_empty());
    }

    #[test]
    fn rejects_unknown_kind() {
        let mut codec = FrameCodec::<WorkerMessage>::new();
        let mut buf = BytesMut::new();
        FrameCodec::<serde_json::Value>::new()
            .encode(serde_json::json!({"kind": "explode"}), &mut buf)
            .unwrap();

        let err = codec.decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn rejects_oversized_frame() {
        let mut codec = FrameCodec::<HostMessage>::with_max_frame_length(16);
        let mut buf = BytesMut::new();
        FrameCodec::<HostMessage>::new()
            .encode(
                HostMessage::Execute {
                    code: "application.setInterface({});".into(),
                },
                &mut buf,
            )
            .unwrap();

        assert!(codec.decode(&mut buf).is_err());
    }
}
