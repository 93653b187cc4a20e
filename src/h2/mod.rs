pub mod client;
pub mod connection;
pub mod consts;
pub mod flow_control;
pub mod framing;
pub mod hpack;
pub mod send_flow;
pub mod server;

pub use client::H2Client;
pub use connection::{Body, ConnectionCore};
pub use flow_control::{FlowLedger, Released, WindowManager, WindowUpdate};
pub use server::{ConnectionStats, H2Server, Handler, Request};
