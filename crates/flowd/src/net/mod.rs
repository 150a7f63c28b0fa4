//! External interfaces: the TCP endpoint, wire protocol, and contact file.

pub mod contact;
pub mod protocol;
pub mod server;

pub use contact::ContactFile;
pub use protocol::{Envelope, ProtocolError, Request, Response};
pub use server::{InboundRequest, SharedSecret, TcpServer};
