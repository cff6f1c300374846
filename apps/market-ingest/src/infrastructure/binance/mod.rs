//! Binance stream adapters: wire messages, the account-type endpoint table
//! and the inbound frame codec.

pub mod codec;
pub mod messages;

pub use codec::{Inbound, ProtocolError, StreamCodec};
pub use messages::{AccountType, StreamRequest};
