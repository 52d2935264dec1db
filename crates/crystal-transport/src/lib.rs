#![warn(missing_docs)]

//! Netsphere transport: encrypted packet framing, gene-based reliable
//! delivery, sliding-window retransmission, and CUBIC congestion control
//! over unreliable datagrams.

pub mod ack;
pub mod cancel;
pub mod congestion;
pub mod connection;
pub mod embryo;
pub mod error;
pub mod gene;
pub mod packet;
pub mod sliding;
pub mod transmission;

pub use cancel::CancelToken;
pub use connection::{Agreement, Connection, SendHandle};
pub use error::{TransportError, TransportResult};
pub use transmission::{ReceiveEvent, ReceivedBlock, StreamChunk, TransmissionMode};
