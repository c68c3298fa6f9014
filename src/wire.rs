//! Wire protocol (spec §6.1) and the length-prefixed framing codec
//! (spec §4.1).
//!
//! Frame format on the byte stream: `[4 bytes u32 BE length][JSON tuple]`.
//! Expressed as a `tokio_util::codec` `Decoder`/`Encoder` pair so the
//! unconsumed-bytes `BytesMut` that `Framed` already threads through
//! plays the role of the spec's `carry` parameter across reads.

use crate::error::RelayError;
use bytes::{Buf, BufMut, BytesMut};
use serde_json::Value;
use tokio_util::codec::{Decoder, Encoder};

/// Event tags (spec §6.1).
pub mod tag {
    pub const HANDSHAKE: u8 = 0;
    pub const CONNECT: u8 = 1;
    pub const BROADCAST: u8 = 2;
    pub const INVOKE: u8 = 3;
    pub const RETURN: u8 = 4;
    pub const YIELD: u8 = 5;
    pub const THROW: u8 = 6;
    pub const PING: u8 = 7;
    pub const PONG: u8 = 8;
}

/// A decoded/encodable wire message.
///
/// `INVOKE` carries two distinct payload shapes depending on direction
/// (spec §6.1 table); they're split into `InvokeRequest`/`InvokeAck` here
/// because Rust's enum is a better fit for that than a single variant
/// with direction-dependent fields.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Handshake { client_id: String },
    Connect { server_id: String },
    Broadcast { topic: String, data: Value },
    InvokeRequest {
        task_id: u64,
        mod_name: String,
        method: String,
        args: Vec<Value>,
    },
    InvokeAck { task_id: u64, value: Value },
    Return { task_id: u64, value: Value },
    Yield { task_id: u64, value: Value },
    Throw { task_id: u64, error: Value },
    Ping { client_id: String },
    Pong,
}

impl Frame {
    fn to_tuple(&self) -> Vec<Value> {
        match self {
            Frame::Handshake { client_id } => {
                vec![Value::from(tag::HANDSHAKE), Value::from(client_id.clone())]
            }
            Frame::Connect { server_id } => {
                vec![Value::from(tag::CONNECT), Value::from(server_id.clone())]
            }
            Frame::Broadcast { topic, data } => vec![
                Value::from(tag::BROADCAST),
                Value::from(topic.clone()),
                data.clone(),
            ],
            Frame::InvokeRequest { task_id, mod_name, method, args } => {
                let mut v = vec![
                    Value::from(tag::INVOKE),
                    Value::from(*task_id),
                    Value::from(mod_name.clone()),
                    Value::from(method.clone()),
                ];
                v.extend(args.iter().cloned());
                v
            }
            Frame::InvokeAck { task_id, value } => {
                vec![Value::from(tag::INVOKE), Value::from(*task_id), value.clone()]
            }
            Frame::Return { task_id, value } => {
                vec![Value::from(tag::RETURN), Value::from(*task_id), value.clone()]
            }
            Frame::Yield { task_id, value } => {
                vec![Value::from(tag::YIELD), Value::from(*task_id), value.clone()]
            }
            Frame::Throw { task_id, error } => {
                vec![Value::from(tag::THROW), Value::from(*task_id), error.clone()]
            }
            Frame::Ping { client_id } => {
                vec![Value::from(tag::PING), Value::from(client_id.clone())]
            }
            Frame::Pong => vec![Value::from(tag::PONG)],
        }
    }

    /// Reconstruct a `Frame` from a decoded tuple.
    ///
    /// For codecs lacking a top-level array type (e.g. BSON), the spec
    /// requires the decoder to re-tuple from an integer-keyed object
    /// first; this crate's one shipped codec (JSON) already has a native
    /// array, so that reconstruction step is a no-op here and is left as
    /// a documented requirement for any future non-array codec.
    pub fn from_tuple(mut values: Vec<Value>) -> Result<Frame, RelayError> {
        if values.is_empty() {
            return Err(RelayError::Decode("empty frame tuple".into()));
        }
        let tag = values[0]
            .as_u64()
            .ok_or_else(|| RelayError::Decode("frame tag is not an integer".into()))?;
        let rest = values.split_off(1);
        let mut it = rest.into_iter();
        let mut next = |what: &str| -> Result<Value, RelayError> {
            it.next()
                .ok_or_else(|| RelayError::Decode(format!("missing field: {what}")))
        };
        let next_str = |v: Value, what: &str| -> Result<String, RelayError> {
            v.as_str()
                .map(|s| s.to_string())
                .ok_or_else(|| RelayError::Decode(format!("field {what} is not a string")))
        };
        let next_u64 = |v: Value, what: &str| -> Result<u64, RelayError> {
            v.as_u64()
                .ok_or_else(|| RelayError::Decode(format!("field {what} is not a u64")))
        };

        Ok(match tag as u8 {
            tag::HANDSHAKE => Frame::Handshake {
                client_id: next_str(next("clientId")?, "clientId")?,
            },
            tag::CONNECT => Frame::Connect {
                server_id: next_str(next("serverId")?, "serverId")?,
            },
            tag::BROADCAST => Frame::Broadcast {
                topic: next_str(next("topic")?, "topic")?,
                data: next("data")?,
            },
            tag::INVOKE => {
                let task_id = next_u64(next("taskId")?, "taskId")?;
                let remaining: Vec<Value> = it.collect();
                if remaining.len() == 1 {
                    Frame::InvokeAck {
                        task_id,
                        value: remaining.into_iter().next().unwrap(),
                    }
                } else if remaining.len() >= 2 {
                    let mut r = remaining.into_iter();
                    let mod_name = next_str(r.next().unwrap(), "modName")?;
                    let method = next_str(r.next().unwrap(), "method")?;
                    Frame::InvokeRequest {
                        task_id,
                        mod_name,
                        method,
                        args: r.collect(),
                    }
                } else {
                    return Err(RelayError::Decode("INVOKE frame missing payload".into()));
                }
            }
            tag::RETURN => Frame::Return {
                task_id: next_u64(next("taskId")?, "taskId")?,
                value: next("value")?,
            },
            tag::YIELD => Frame::Yield {
                task_id: next_u64(next("taskId")?, "taskId")?,
                value: next("value")?,
            },
            tag::THROW => Frame::Throw {
                task_id: next_u64(next("taskId")?, "taskId")?,
                error: next("error")?,
            },
            tag::PING => Frame::Ping {
                client_id: next_str(next("clientId")?, "clientId")?,
            },
            tag::PONG => Frame::Pong,
            other => return Err(RelayError::Decode(format!("unknown event tag {other}"))),
        })
    }
}

/// Length-prefixed `Frame` codec: `[u32 BE length][JSON array payload]`.
#[derive(Debug, Default)]
pub struct FrameCodec {
    /// Length of the frame currently being assembled, once known.
    pending_len: Option<u32>,
}

const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = RelayError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, RelayError> {
        let len = match self.pending_len {
            Some(len) => len,
            None => {
                if src.len() < 4 {
                    src.reserve(4);
                    return Ok(None);
                }
                let len = (&src[..4]).get_u32();
                if len > MAX_FRAME_LEN {
                    return Err(RelayError::Decode(format!(
                        "frame length {len} exceeds max {MAX_FRAME_LEN}"
                    )));
                }
                src.advance(4);
                self.pending_len = Some(len);
                len
            }
        };

        if (src.len() as u64) < len as u64 {
            src.reserve(len as usize - src.len());
            return Ok(None);
        }

        let payload = src.split_to(len as usize);
        self.pending_len = None;

        let values: Vec<Value> = serde_json::from_slice(&payload)
            .map_err(|e| RelayError::Decode(format!("invalid frame JSON: {e}")))?;
        Frame::from_tuple(values).map(Some)
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = RelayError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), RelayError> {
        let tuple = item.to_tuple();
        let json = serde_json::to_vec(&tuple)
            .map_err(|e| RelayError::Decode(format!("failed to serialize frame: {e}")))?;
        dst.reserve(4 + json.len());
        dst.put_u32(json.len() as u32);
        dst.put_slice(&json);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn round_trip(frame: Frame) -> Frame {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        codec.encode(frame.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().expect("one frame");
        assert!(buf.is_empty());
        decoded
    }

    #[test]
    fn handshake_round_trips() {
        let f = Frame::Handshake { client_id: "abc".into() };
        assert_eq!(round_trip(f.clone()), f);
    }

    #[test]
    fn invoke_request_and_ack_round_trip() {
        let req = Frame::InvokeRequest {
            task_id: 1,
            mod_name: "user".into(),
            method: "getName".into(),
            args: vec![json!("a"), json!(2)],
        };
        assert_eq!(round_trip(req.clone()), req);

        let ack = Frame::InvokeAck { task_id: 1, value: json!(null) };
        assert_eq!(round_trip(ack.clone()), ack);
    }

    #[test]
    fn decoder_handles_partial_reads() {
        let mut codec = FrameCodec::default();
        let mut full = BytesMut::new();
        codec
            .encode(Frame::Ping { client_id: "c1".into() }, &mut full)
            .unwrap();

        // Feed one byte at a time; only the final byte should yield Some.
        let bytes = full.to_vec();
        let mut buf = BytesMut::new();
        let mut result = None;
        for b in bytes {
            buf.put_u8(b);
            result = codec.decode(&mut buf).unwrap();
            if result.is_some() {
                break;
            }
        }
        assert_eq!(result, Some(Frame::Ping { client_id: "c1".into() }));
    }

    #[test]
    fn multiple_frames_in_one_buffer_decode_in_order() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        codec.encode(Frame::Pong, &mut buf).unwrap();
        codec
            .encode(Frame::Connect { server_id: "s1".into() }, &mut buf)
            .unwrap();

        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Frame::Pong));
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Frame::Connect { server_id: "s1".into() })
        );
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn oversized_frame_length_is_rejected() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        buf.put_u32(MAX_FRAME_LEN + 1);
        assert!(codec.decode(&mut buf).is_err());
    }
}
