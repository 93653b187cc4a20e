//! Cleartext HTTP/2 client and server built around connection-level receive
//! flow control that survives request bodies closed before they were read.

pub mod h2;
pub mod handlers;
pub mod stream;
pub mod types;
pub mod utils;

pub use h2::{Body, H2Client, H2Server, Handler, Request};
pub use types::*;
pub use utils::*;
