//! Core block/transaction types and consensus serialization.

pub mod block;
pub mod encoding;
pub mod hash;
pub mod merkle;
pub mod transaction;

pub use block::{Block, BlockHeader};
pub use encoding::{decode, encode, Decodable, DecodeError, Decoder, Encodable, Encoder};
pub use hash::{sha256, sha256d};
pub use merkle::merkle_root;
pub use transaction::{OutPoint, Transaction, TxIn, TxOut};
