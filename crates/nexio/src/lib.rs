//! Multiplexing Layer
//!
//! Presents applications with namespaces, rooms, and acknowledgements over
//! the transport engine. One engine connection carries one `Client`, which
//! demultiplexes packets to per-namespace `Socket`s; each `Namespace` owns a
//! middleware chain and an `Adapter` holding the room index and implementing
//! broadcast fan-out.

pub mod adapter;
pub mod client;
pub mod error;
pub mod namespace;
pub mod operator;
pub mod recovery;
pub mod server;
pub mod socket;

pub use adapter::{Adapter, AdapterFactory, AckStreamItem, BroadcastFlags, BroadcastOptions};
pub use client::Client;
pub use error::{AckError, BroadcastError, ConnectDenial, EmitError};
pub use namespace::Namespace;
pub use operator::BroadcastOperator;
pub use recovery::RecoveryOptions;
pub use server::{Server, ServerOptions};
pub use socket::{AckResponder, DisconnectReason, Socket, SocketEvent};

pub use nexio_parser::{Data, Packet};

/// Socket and connection identifier
pub type Sid = String;

/// Room name within a namespace
pub type Room = String;
