//! Wire protocol shared by the roomrelay server and its clients.
//!
//! Every frame on the duplex channel is one JSON text message. Requests carry a
//! `requestId` and are answered by exactly one reply with the same id;
//! notifications carry no id and flow in either direction unsolicited.

mod messages;
mod types;

pub use messages::*;
pub use types::*;
