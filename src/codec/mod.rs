//! Codec module - data-plane sentinel framing.
//!
//! This module provides the byte-stream codec used on the data plane:
//!
//! - [`encode`] / [`decode`] - pure 7-in-8 repacking of whole buffers
//! - [`FrameDecoder`] - incremental decoder that resynchronises on the
//!   next sentinel after corruption
//!
//! # Design
//!
//! The codec is a pure transform over byte slices with no state shared
//! between calls. The link is transparent (no escaping), so the only thing
//! that makes frame starts recoverable is that [`SENTINEL`] never occurs
//! inside an encoded group.
//!
//! # Example
//!
//! ```
//! use blueteeth::codec::{decode, encode, pad_to_group};
//!
//! let audio = b"pcm bytes";
//! let padded = pad_to_group(audio);
//! let framed = encode(&padded).unwrap();
//! assert_eq!(decode(&framed).unwrap(), padded);
//! ```

mod decoder;
mod septet;

pub use decoder::FrameDecoder;
pub use septet::{
    decode, decode_group, encode, encode_group, encoded_len, pad_to_group, ENCODED_GROUP_SIZE,
    RAW_GROUP_SIZE, SENTINEL, SEPTETS_PER_GROUP,
};
