//! Protocol module containing the message catalog, quantisation helpers and the
//! binary codec.

pub mod codec;
pub mod messages;
pub mod quantize;
pub mod sequence;

pub use codec::{decode_message, encode_message, ProtocolError, WireCodec};
pub use messages::*;
pub use sequence::SequenceCounter;
