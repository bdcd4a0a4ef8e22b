//! EOT-delimited JSON framing.
//!
//! ## Wire format
//!
//! One frame is one UTF-8 JSON document followed by a single sentinel byte
//! `0x04` (ASCII EOT). A zero-length frame (a sentinel with no preceding
//! bytes) is reserved as a no-op keepalive and is consumed silently.
//!
//! serde_json escapes every control character inside strings (``), so
//! the sentinel cannot occur inside a well-formed encoded document. The
//! decoder relies on this guarantee; `sentinel_never_escapes_into_payload`
//! below pins it.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::envelope::Envelope;

/// Frame sentinel, ASCII End-Of-Transmission.
pub const EOT: u8 = 0x04;

/// Errors during frame encode/decode.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed JSON in frame: {0}")]
    Json(#[from] serde_json::Error),
}

/// Codec for [`Envelope`] frames. Stateless; the buffer carries all state.
#[derive(Debug, Default, Clone, Copy)]
pub struct EotCodec;

impl Decoder for EotCodec {
    type Item = Envelope;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Envelope>, FrameError> {
        loop {
            let Some(pos) = src.iter().position(|&b| b == EOT) else {
                return Ok(None);
            };
            let frame = src.split_to(pos);
            src.advance(1);
            if frame.is_empty() {
                // keepalive
                continue;
            }
            // The sentinel is already consumed, so a malformed document
            // poisons only this frame, not the stream.
            return Ok(Some(serde_json::from_slice(&frame)?));
        }
    }
}

impl<'a> Encoder<&'a Envelope> for EotCodec {
    type Error = FrameError;

    fn encode(&mut self, item: &'a Envelope, dst: &mut BytesMut) -> Result<(), FrameError> {
        let encoded = serde_json::to_vec(item)?;
        dst.reserve(encoded.len() + 1);
        dst.put_slice(&encoded);
        dst.put_u8(EOT);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::RequestType;
    use pretty_assertions::assert_eq;
    use uuid::Uuid;

    fn encode(env: &Envelope) -> BytesMut {
        let mut buf = BytesMut::new();
        EotCodec.encode(env, &mut buf).unwrap();
        buf
    }

    #[test]
    fn roundtrip() {
        let env = Envelope::blocking("echo", serde_json::json!({"ping": 42}), Uuid::new_v4());
        let mut buf = encode(&env);

        let decoded = EotCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, env);
        assert!(buf.is_empty());
    }

    #[test]
    fn multiple_frames_in_one_buffer() {
        let a = Envelope::fire_and_forget("a", serde_json::json!({"n": 1}));
        let b = Envelope::fire_and_forget("b", serde_json::json!({"n": 2}));
        let mut buf = encode(&a);
        buf.extend_from_slice(&encode(&b));

        assert_eq!(EotCodec.decode(&mut buf).unwrap().unwrap(), a);
        assert_eq!(EotCodec.decode(&mut buf).unwrap().unwrap(), b);
        assert_eq!(EotCodec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn chunked_delivery_reassembles() {
        let env = Envelope::fire_and_forget("chunked", serde_json::json!({"payload": "x".repeat(3000)}));
        let full = encode(&env);

        // Feed in 1024-byte reads, the way the receive loop sees them.
        let mut buf = BytesMut::new();
        let mut decoded = None;
        for chunk in full.chunks(1024) {
            buf.extend_from_slice(chunk);
            if let Some(env) = EotCodec.decode(&mut buf).unwrap() {
                decoded = Some(env);
            }
        }
        assert_eq!(decoded.unwrap(), env);
    }

    #[test]
    fn keepalive_is_skipped() {
        let env = Envelope::fire_and_forget("after-keepalive", serde_json::json!({}));
        let mut buf = BytesMut::new();
        buf.put_u8(EOT);
        buf.put_u8(EOT);
        buf.extend_from_slice(&encode(&env));

        assert_eq!(EotCodec.decode(&mut buf).unwrap().unwrap(), env);
    }

    #[test]
    fn lone_keepalive_yields_nothing() {
        let mut buf = BytesMut::new();
        buf.put_u8(EOT);
        assert_eq!(EotCodec.decode(&mut buf).unwrap(), None);
        assert!(buf.is_empty());
    }

    #[test]
    fn sentinel_never_escapes_into_payload() {
        // A string containing the raw sentinel must encode without one.
        let env = Envelope::fire_and_forget("evil", serde_json::json!({"s": "a\u{4}b"}));
        let buf = encode(&env);

        let sentinels = buf.iter().filter(|&&b| b == EOT).count();
        assert_eq!(sentinels, 1, "only the terminal sentinel may appear");
        assert_eq!(buf[buf.len() - 1], EOT);

        let mut buf = buf;
        let decoded = EotCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.data["s"], "a\u{4}b");
    }

    #[test]
    fn malformed_frame_errors_but_stream_stays_aligned() {
        let good = Envelope::fire_and_forget("ok", serde_json::json!({}));
        let mut buf = BytesMut::new();
        buf.put_slice(b"{not json");
        buf.put_u8(EOT);
        buf.extend_from_slice(&encode(&good));

        assert!(matches!(EotCodec.decode(&mut buf), Err(FrameError::Json(_))));
        assert_eq!(EotCodec.decode(&mut buf).unwrap().unwrap(), good);
    }

    #[test]
    fn partial_frame_waits_for_more() {
        let env = Envelope::fire_and_forget("partial", serde_json::json!({"k": "v"}));
        let full = encode(&env);
        let mut buf = BytesMut::from(&full[..full.len() - 1]);

        assert_eq!(EotCodec.decode(&mut buf).unwrap(), None);
        buf.put_u8(EOT);
        assert_eq!(EotCodec.decode(&mut buf).unwrap().unwrap(), env);
        assert_eq!(
            env.rtype,
            RequestType::FireAndForget,
            "constructor picks the one-way kind"
        );
    }
}
