//! Application handlers used to reproduce the unread-body window leak.
//!
//! `/drop` gives up on its request body after at most a configured prefix,
//! every other path echoes its body verbatim. A connection that leaks credit
//! on the first starves the second.

use crate::h2::server::{Handler, Request};
use crate::types::{Header, ProtocolError, Response};
use crate::utils::{APPLICATION_RAW, CONTENT_TYPE_HEADER};
use async_trait::async_trait;
use bytes::BytesMut;

pub const DROP_PATH: &str = "/drop";
/// Path the harness sends its echo request to. Any path but `/drop` echoes.
pub const ECHO_PATH: &str = "/";

/// Payload the harness posts to the echo route.
pub const ECHO_PAYLOAD: &[u8] = br#"{"hello": "world"}"#;

/// Reads at most `read_prefix` bytes, closes the body and answers 200.
#[derive(Debug, Clone, Copy, Default)]
pub struct DropHandler {
    pub read_prefix: usize,
}

impl DropHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_read_prefix(read_prefix: usize) -> Self {
        Self { read_prefix }
    }

    async fn drop_body(&self, mut request: Request) -> Result<Response, ProtocolError> {
        let stream_id = request.stream_id();
        let mut read = 0;
        while read < self.read_prefix {
            match request.body.chunk().await? {
                Some(chunk) => read += chunk.len(),
                None => break,
            }
        }
        let released = request.body.close()?;
        tracing::debug!(
            stream_id,
            read,
            returned = released.returned,
            leaked = released.leaked,
            "request body dropped"
        );
        Ok(Response::new(200))
    }
}

#[async_trait]
impl Handler for DropHandler {
    async fn handle(&self, request: Request) -> Response {
        self.drop_body(request)
            .await
            .unwrap_or_else(|err| Response::error(500, err))
    }
}

/// Reads the whole body and sends it back.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoHandler;

impl EchoHandler {
    async fn echo(&self, mut request: Request) -> Result<Response, ProtocolError> {
        let mut body = BytesMut::new();
        if let Some(len) = request.content_length() {
            body.reserve(len.min(1 << 20) as usize);
        }
        while let Some(chunk) = request.body.chunk().await? {
            body.extend_from_slice(&chunk);
        }

        let content_type = request
            .header(CONTENT_TYPE_HEADER)
            .unwrap_or(APPLICATION_RAW)
            .to_string();
        Ok(Response::new(200)
            .with_header(Header::new(CONTENT_TYPE_HEADER, content_type))
            .with_body(body.freeze()))
    }
}

#[async_trait]
impl Handler for EchoHandler {
    async fn handle(&self, request: Request) -> Response {
        self.echo(request)
            .await
            .unwrap_or_else(|err| Response::error(500, err))
    }
}

/// Routes `/drop` to the drop handler and echoes everything else.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReproHandler {
    pub drop: DropHandler,
    pub echo: EchoHandler,
}

impl ReproHandler {
    pub fn new(drop: DropHandler) -> Self {
        Self {
            drop,
            echo: EchoHandler,
        }
    }
}

#[async_trait]
impl Handler for ReproHandler {
    async fn handle(&self, request: Request) -> Response {
        if request.path == DROP_PATH {
            self.drop.handle(request).await
        } else {
            self.echo.handle(request).await
        }
    }
}
