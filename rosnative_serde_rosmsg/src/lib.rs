//! # rosnative_serde_rosmsg
//! Serde support for the ROS1 binary wire format.
//!
//! The encoding is little-endian fixed-width primitives, `bool` as a single
//! byte, strings and variable-length arrays prefixed by a `u32` length /
//! element count, and fixed-length arrays as bare contiguous elements. A
//! complete message on the wire is the body prefixed by its `u32` byte
//! length; [to_vec] / [from_slice] handle that outer header, while the
//! `_body` variants operate on the bare body (used by the service response
//! path, where a success byte sits between the length and the payload).

use serde::{Deserialize, Serialize};
use std::io::Write;

mod de;
mod error;
mod ser;

pub use de::Deserializer;
pub use error::{Error, Result};
pub use ser::Serializer;

/// Serializes a message body and prefixes it with its `u32` byte length.
pub fn to_vec<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let body = to_vec_body(value)?;
    let mut out = Vec::with_capacity(body.len() + 4);
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Serializes a message body with no outer length header.
pub fn to_vec_body<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    to_writer_body(&mut out, value)?;
    Ok(out)
}

/// Serializes a message body into any [Write], no outer length header.
pub fn to_writer_body<W: Write, T: Serialize>(writer: W, value: &T) -> Result<()> {
    let mut serializer = Serializer::new(writer);
    value.serialize(&mut serializer)
}

/// Returns the exact number of bytes [to_vec_body] would produce.
///
/// Runs a counting serializer over the value; for a message whose schema is
/// all fixed-size fields the result is a constant independent of the value.
pub fn serialized_len<T: Serialize>(value: &T) -> Result<u32> {
    let mut counter = ser::CountingWriter { count: 0 };
    let mut serializer = Serializer::new(&mut counter);
    value.serialize(&mut serializer)?;
    u32::try_from(counter.count).map_err(|_| Error::Unsupported("message exceeding u32 length"))
}

/// Deserializes a message from its wire form: `u32` length header + body.
///
/// The header has to announce exactly the remaining input length.
pub fn from_slice<'de, T: Deserialize<'de>>(input: &'de [u8]) -> Result<T> {
    if input.len() < 4 {
        return Err(Error::Eof);
    }
    let announced = u32::from_le_bytes([input[0], input[1], input[2], input[3]]) as usize;
    let body = &input[4..];
    if announced > body.len() {
        return Err(Error::Eof);
    }
    if announced < body.len() {
        return Err(Error::TrailingBytes {
            remaining: body.len() - announced,
        });
    }
    from_slice_body(body)
}

/// Deserializes a bare message body, requiring it to be consumed completely.
pub fn from_slice_body<'de, T: Deserialize<'de>>(input: &'de [u8]) -> Result<T> {
    let mut deserializer = Deserializer::new(input);
    let value = T::deserialize(&mut deserializer)?;
    let remaining = deserializer.remaining();
    if remaining != 0 {
        return Err(Error::TrailingBytes { remaining });
    }
    Ok(value)
}
