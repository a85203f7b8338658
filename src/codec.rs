//! Bin codec: many logical records inside one physical payload.
//!
//! Layout is a sequence of frames, each a big-endian `u32` length followed by
//! that many bytes of JSON (one value list per frame). A zero length is the
//! end marker. Decoding is lazy and single-pass: [`BinDecoder`] yields one
//! record per frame and stops at the marker.

use crate::value::Value;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Length value reserved as the end-of-bin marker.
pub const END_MARKER: u32 = 0;

const FRAME_HEADER: usize = 4;

/// Error type for bin encoding and decoding.
#[derive(Error, Debug)]
pub enum CodecError {
  /// A record could not be serialized or deserialized.
  #[error("record serialization failed: {0}")]
  Serialization(#[from] serde_json::Error),
  /// The payload ended in the middle of a frame.
  #[error("truncated bin: needed {needed} bytes, {remaining} remaining")]
  Truncated {
    /// Bytes required by the current frame.
    needed: usize,
    /// Bytes left in the payload.
    remaining: usize,
  },
  /// The payload ended without an end marker.
  #[error("bin has no end marker")]
  MissingEndMarker,
  /// A record is too large to frame.
  #[error("record of {0} bytes exceeds frame limit")]
  Oversized(usize),
}

/// Accumulates logical records into one payload.
#[derive(Debug, Default)]
pub struct BinEncoder {
  buf: BytesMut,
  count: usize,
}

impl BinEncoder {
  /// Creates an empty encoder.
  pub fn new() -> Self {
    Self::default()
  }

  /// Appends one record.
  pub fn push(&mut self, values: &[Value]) -> Result<(), CodecError> {
    let body = serde_json::to_vec(values)?;
    let len = u32::try_from(body.len()).map_err(|_| CodecError::Oversized(body.len()))?;
    self.buf.reserve(FRAME_HEADER + body.len());
    self.buf.put_u32(len);
    self.buf.put_slice(&body);
    self.count += 1;
    Ok(())
  }

  /// Number of records pushed so far.
  pub fn len(&self) -> usize {
    self.count
  }

  /// True if nothing has been pushed.
  pub fn is_empty(&self) -> bool {
    self.count == 0
  }

  /// Terminates the bin and returns the payload, leaving the encoder empty.
  pub fn finish(&mut self) -> Bytes {
    self.buf.put_u32(END_MARKER);
    self.count = 0;
    self.buf.split().freeze()
  }

  /// Drops everything pushed so far.
  pub fn clear(&mut self) {
    self.buf.clear();
    self.count = 0;
  }
}

/// Lazy, single-pass reader over one payload.
///
/// Not restartable: decode the payload again to re-read it. After the first
/// error the decoder yields nothing further.
#[derive(Debug)]
pub struct BinDecoder {
  buf: Bytes,
  done: bool,
}

impl BinDecoder {
  /// Starts decoding `payload`.
  pub fn new(payload: Bytes) -> Self {
    Self {
      buf: payload,
      done: false,
    }
  }

  fn next_frame(&mut self) -> Result<Option<Vec<Value>>, CodecError> {
    if self.buf.remaining() < FRAME_HEADER {
      return Err(if self.buf.has_remaining() {
        CodecError::Truncated {
          needed: FRAME_HEADER,
          remaining: self.buf.remaining(),
        }
      } else {
        CodecError::MissingEndMarker
      });
    }
    let len = self.buf.get_u32();
    if len == END_MARKER {
      return Ok(None);
    }
    let len = len as usize;
    if self.buf.remaining() < len {
      return Err(CodecError::Truncated {
        needed: len,
        remaining: self.buf.remaining(),
      });
    }
    let body = self.buf.split_to(len);
    Ok(Some(serde_json::from_slice(&body)?))
  }
}

impl Iterator for BinDecoder {
  type Item = Result<Vec<Value>, CodecError>;

  fn next(&mut self) -> Option<Self::Item> {
    if self.done {
      return None;
    }
    match self.next_frame() {
      Ok(Some(values)) => Some(Ok(values)),
      Ok(None) => {
        self.done = true;
        None
      }
      Err(e) => {
        self.done = true;
        Some(Err(e))
      }
    }
  }
}

/// Decodes `payload` lazily.
pub fn decode(payload: Bytes) -> BinDecoder {
  BinDecoder::new(payload)
}

/// Encodes a sequence of records into one terminated payload.
pub fn encode<'a, I>(records: I) -> Result<Bytes, CodecError>
where
  I: IntoIterator<Item = &'a [Value]>,
{
  let mut enc = BinEncoder::new();
  for r in records {
    enc.push(r)?;
  }
  Ok(enc.finish())
}

#[cfg(test)]
mod tests {
  use super::*;
  use proptest::prelude::*;

  fn value() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
      Just(Value::Null),
      any::<bool>().prop_map(Value::Bool),
      any::<i64>().prop_map(Value::Int),
      any::<i32>().prop_map(|n| Value::Float(f64::from(n) / 8.0)),
      ".{0,12}".prop_map(Value::Str),
      prop::collection::vec(any::<u8>(), 0..8).prop_map(Value::Bytes),
    ];
    leaf.prop_recursive(2, 16, 4, |inner| {
      prop::collection::vec(inner, 0..4).prop_map(Value::List)
    })
  }

  proptest! {
    #[test]
    fn any_record_sequence_round_trips(
      records in prop::collection::vec(prop::collection::vec(value(), 0..5), 0..12)
    ) {
      let payload = encode(records.iter().map(Vec::as_slice)).unwrap();
      let decoded: Vec<Vec<Value>> = decode(payload).collect::<Result<_, _>>().unwrap();
      prop_assert_eq!(decoded, records);
    }
  }

  #[test]
  fn round_trip_preserves_order() {
    let records = vec![
      vec![Value::from("a"), Value::Int(1)],
      vec![],
      vec![Value::Null, Value::Float(2.5), Value::Bytes(vec![0, 1, 2])],
      vec![Value::List(vec![Value::Bool(true), Value::from("nested")])],
    ];
    let payload = encode(records.iter().map(Vec::as_slice)).unwrap();
    let decoded: Vec<Vec<Value>> = decode(payload).collect::<Result<_, _>>().unwrap();
    assert_eq!(decoded, records);
  }

  #[test]
  fn empty_bin_is_just_the_marker() {
    let payload = encode(std::iter::empty()).unwrap();
    assert_eq!(payload.len(), 4);
    assert_eq!(decode(payload).count(), 0);
  }

  #[test]
  fn encoder_is_reusable_after_finish() {
    let mut enc = BinEncoder::new();
    enc.push(&[Value::Int(1)]).unwrap();
    let first = enc.finish();
    assert!(enc.is_empty());
    enc.push(&[Value::Int(2)]).unwrap();
    let second = enc.finish();
    let a: Vec<_> = decode(first).map(Result::unwrap).collect();
    let b: Vec<_> = decode(second).map(Result::unwrap).collect();
    assert_eq!(a, vec![vec![Value::Int(1)]]);
    assert_eq!(b, vec![vec![Value::Int(2)]]);
  }

  #[test]
  fn missing_marker_is_reported_once() {
    let full = encode([[Value::Int(1)].as_slice()]).unwrap();
    let cut = full.slice(..full.len() - 4);
    let items: Vec<_> = decode(cut).collect();
    assert_eq!(items.len(), 2);
    assert!(items[0].is_ok());
    assert!(matches!(items[1], Err(CodecError::MissingEndMarker)));
  }

  #[test]
  fn truncated_frame_is_reported() {
    let full = encode([[Value::from("abcdef")].as_slice()]).unwrap();
    let cut = full.slice(..7);
    let first = decode(cut).next().unwrap();
    assert!(matches!(first, Err(CodecError::Truncated { .. })));
  }
}
