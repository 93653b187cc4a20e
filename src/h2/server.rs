//! Cleartext HTTP/2 server speaking prior knowledge (no HTTP/1.1 upgrade).
//!
//! Every connection gets a frame reader and a writer task. Every request
//! stream gets its own handler task; the handler owns the request [`Body`]
//! and the server answers with `RST_STREAM(NO_ERROR)` once the response is out
//! if the client was still sending.

use crate::h2::connection::state::StreamEvent;
use crate::h2::connection::{drive, Body, ConnectionCore, StreamDispatch};
use crate::h2::flow_control::FlowLedger;
use crate::h2::framing::FrameReader;
use crate::h2::hpack::HeaderDecoder;
use crate::stream::{accepted, bind_listener};
use crate::types::{
    FrameTypeH2, H2ErrorCode, H2StreamErrorKind, Header, ProtocolError, Response, ServerConfig,
};
use crate::utils::{header_value, CONTENT_LENGTH_HEADER};
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, Notify};

/// A request as seen by a [`Handler`].
#[derive(Debug)]
pub struct Request {
    pub method: String,
    pub path: String,
    pub scheme: Option<String>,
    pub authority: Option<String>,
    /// Regular (non-pseudo) headers in arrival order.
    pub headers: Vec<Header>,
    pub body: Body,
}

impl Request {
    pub fn stream_id(&self) -> u32 {
        self.body.stream_id()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        header_value(&self.headers, name)
    }

    pub fn content_length(&self) -> Option<u64> {
        self.header(CONTENT_LENGTH_HEADER)
            .and_then(|value| value.parse().ok())
    }
}

#[derive(Debug)]
struct RequestHead {
    method: String,
    path: String,
    scheme: Option<String>,
    authority: Option<String>,
    headers: Vec<Header>,
}

impl RequestHead {
    fn from_headers(headers: Vec<Header>) -> Result<Self, ProtocolError> {
        let mut method = None;
        let mut path = None;
        let mut scheme = None;
        let mut authority = None;
        let mut regular = Vec::new();

        for header in headers {
            if !header.is_pseudo() {
                regular.push(header);
                continue;
            }
            if !regular.is_empty() {
                return Err(malformed("pseudo-header after regular header"));
            }
            let slot = match header.name.as_str() {
                ":method" => &mut method,
                ":path" => &mut path,
                ":scheme" => &mut scheme,
                ":authority" => &mut authority,
                _ => return Err(malformed("unknown request pseudo-header")),
            };
            if slot.replace(header.value.unwrap_or_default()).is_some() {
                return Err(malformed("duplicate pseudo-header"));
            }
        }

        Ok(Self {
            method: method.ok_or_else(|| malformed("missing :method"))?,
            path: path
                .filter(|p| !p.is_empty())
                .ok_or_else(|| malformed("missing :path"))?,
            scheme,
            authority,
            headers: regular,
        })
    }
}

fn malformed(reason: &str) -> ProtocolError {
    H2StreamErrorKind::ProtocolViolation(format!("malformed request: {}", reason)).into()
}

#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, request: Request) -> Response;
}

/// Flow-control snapshot of one live server connection.
#[derive(Debug, Clone)]
pub struct ConnectionStats {
    pub peer: SocketAddr,
    pub initial_window: u32,
    pub available_credit: u32,
    pub active_streams: usize,
    pub ledger: FlowLedger,
}

type Registry = Mutex<Vec<(SocketAddr, Weak<ConnectionCore>)>>;

pub struct H2Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    config: ServerConfig,
    connections: Registry,
    stopping: AtomicBool,
    stop_signal: Notify,
}

impl H2Server {
    pub async fn bind<A: ToSocketAddrs>(addr: A, config: ServerConfig) -> Result<Self, ProtocolError> {
        config.connection.validate()?;
        let (listener, local_addr) = bind_listener(addr).await?;
        tracing::info!(%local_addr, "h2c server listening");
        Ok(Self {
            listener,
            local_addr,
            config,
            connections: Mutex::new(Vec::new()),
            stopping: AtomicBool::new(false),
            stop_signal: Notify::new(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Accepts connections until [`H2Server::shutdown`] is called.
    pub async fn serve<H: Handler>(self: &Arc<Self>, handler: Arc<H>) -> Result<(), ProtocolError> {
        loop {
            let stopped = self.stop_signal.notified();
            tokio::pin!(stopped);
            stopped.as_mut().enable();
            if self.stopping.load(Ordering::Acquire) {
                break;
            }

            tokio::select! {
                _ = &mut stopped => break,
                accepted = self.listener.accept() => {
                    let (tcp, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(err) => {
                            tracing::warn!(error = %err, "accept failed");
                            continue;
                        }
                    };
                    let server = Arc::clone(self);
                    let handler = Arc::clone(&handler);
                    tokio::spawn(async move {
                        if let Err(err) = server.serve_connection(tcp, handler).await {
                            tracing::debug!(%peer, error = %err, "connection ended with error");
                        }
                    });
                }
            }
        }
        Ok(())
    }

    /// Runs the HTTP/2 session for one accepted TCP connection.
    pub async fn serve_connection<H: Handler>(
        &self,
        tcp: TcpStream,
        handler: Arc<H>,
    ) -> Result<(), ProtocolError> {
        let peer = tcp.peer_addr()?;
        let tcp = accepted(tcp)?;
        let (read_half, write_half) = tcp.into_split();
        let connection = &self.config.connection;

        let (core, writer) =
            ConnectionCore::start(write_half, connection.clone(), self.config.write_timeout)?;
        let mut reader = FrameReader::new(read_half, connection.max_frame_size);

        if let Err(err) = reader.read_preface().await {
            core.fail(0, &err);
            let _ = writer.await;
            return Err(err);
        }
        core.queue_handshake(false)?;

        // The client's first frame after the preface must be SETTINGS.
        let first = match reader.read_frame().await {
            Ok(Some(frame)) if frame.frame_type == FrameTypeH2::Settings && !frame.is_ack() => {
                Ok(frame)
            }
            Ok(_) => Err(ProtocolError::H2ProtocolError(
                "expected SETTINGS after the connection preface".to_string(),
            )),
            Err(err) => Err(err),
        };
        if let Err(err) = first.and_then(|frame| core.handle_control_frame(&frame)) {
            core.fail(0, &err);
            let _ = writer.await;
            return Err(err);
        }

        self.register(peer, &core);
        tracing::debug!(%peer, "connection established");

        let dispatch = ServerDispatch {
            core: Arc::clone(&core),
            handler,
            streams: HashMap::new(),
            last_stream_id: 0,
            active: Arc::new(AtomicUsize::new(0)),
            max_concurrent: connection.max_concurrent_streams as usize,
        };
        let decoder = HeaderDecoder::new(connection.header_table_size as usize);
        let result = drive(Arc::clone(&core), reader, decoder, dispatch).await;

        match writer.await {
            Ok(Err(err)) => tracing::debug!(%peer, error = %err, "writer failed"),
            Err(err) => tracing::warn!(%peer, error = %err, "writer task panicked"),
            Ok(Ok(())) => {}
        }
        tracing::debug!(%peer, "connection closed");
        result
    }

    fn register(&self, peer: SocketAddr, core: &Arc<ConnectionCore>) {
        let mut connections = self.connections.lock().unwrap_or_else(PoisonError::into_inner);
        connections.retain(|(_, weak)| weak.strong_count() > 0);
        connections.push((peer, Arc::downgrade(core)));
    }

    fn live_connections(&self) -> Vec<(SocketAddr, Arc<ConnectionCore>)> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter_map(|(peer, weak)| weak.upgrade().map(|core| (*peer, core)))
            .filter(|(_, core)| !core.is_closed())
            .collect()
    }

    pub fn connection_stats(&self) -> Vec<ConnectionStats> {
        self.live_connections()
            .into_iter()
            .map(|(peer, core)| {
                let flow = core.recv_flow();
                ConnectionStats {
                    peer,
                    initial_window: flow.config().initial_connection_window,
                    available_credit: flow.available_connection_credit(),
                    active_streams: flow.active_streams(),
                    ledger: flow.ledger(),
                }
            })
            .collect()
    }

    /// Stops accepting and sends GOAWAY(NO_ERROR) on every live connection.
    pub fn shutdown(&self) {
        self.stopping.store(true, Ordering::Release);
        self.stop_signal.notify_waiters();
        for (peer, core) in self.live_connections() {
            tracing::debug!(%peer, "sending GOAWAY");
            core.shutdown(core.recv_flow().last_stream_id());
        }
    }
}

struct InboundStream {
    events: mpsc::UnboundedSender<StreamEvent>,
    remote_done: Arc<AtomicBool>,
}

struct ServerDispatch<H> {
    core: Arc<ConnectionCore>,
    handler: Arc<H>,
    streams: HashMap<u32, InboundStream>,
    last_stream_id: u32,
    active: Arc<AtomicUsize>,
    max_concurrent: usize,
}

impl<H: Handler> ServerDispatch<H> {
    fn open_request(
        &mut self,
        stream_id: u32,
        headers: Vec<Header>,
        end_stream: bool,
    ) -> Result<(), ProtocolError> {
        if stream_id % 2 == 0 {
            return Err(ProtocolError::H2ProtocolError(format!(
                "client opened even-numbered stream {}",
                stream_id
            )));
        }
        if stream_id <= self.last_stream_id {
            return Err(H2StreamErrorKind::StreamClosed.into());
        }
        if self.core.goaway_last_stream_id().is_some() || self.core.is_closed() {
            return Err(H2StreamErrorKind::Reset(H2ErrorCode::RefusedStream).into());
        }

        self.last_stream_id = stream_id;
        self.core.recv_flow().open_stream(stream_id, end_stream)?;
        self.core.send_flow().open_stream(stream_id);

        if self.active.load(Ordering::Acquire) >= self.max_concurrent {
            return Err(H2StreamErrorKind::Reset(H2ErrorCode::RefusedStream).into());
        }
        let head = RequestHead::from_headers(headers)?;

        // Routes whose body was closed no longer receive events.
        self.streams.retain(|_, stream| !stream.events.is_closed());

        let (tx, rx) = mpsc::unbounded_channel();
        let remote_done = Arc::new(AtomicBool::new(end_stream));
        if !end_stream {
            self.streams.insert(
                stream_id,
                InboundStream {
                    events: tx,
                    remote_done: Arc::clone(&remote_done),
                },
            );
        }

        let request = Request {
            method: head.method,
            path: head.path,
            scheme: head.scheme,
            authority: head.authority,
            headers: head.headers,
            body: Body::new(stream_id, rx, Arc::clone(&self.core), end_stream),
        };
        tracing::debug!(stream_id, method = %request.method, path = %request.path, "request");

        let task = HandlerTask {
            core: Arc::clone(&self.core),
            stream_id,
            remote_done,
            _active: ActiveGuard::new(Arc::clone(&self.active)),
        };
        tokio::spawn(task.run(Arc::clone(&self.handler), request));
        Ok(())
    }
}

impl<H: Handler> StreamDispatch for ServerDispatch<H> {
    fn on_headers(
        &mut self,
        stream_id: u32,
        headers: Vec<Header>,
        end_stream: bool,
    ) -> Result<(), ProtocolError> {
        let Some(stream) = self.streams.get(&stream_id) else {
            return self.open_request(stream_id, headers, end_stream);
        };
        if !end_stream {
            return Err(H2StreamErrorKind::ProtocolViolation(
                "trailers without END_STREAM".to_string(),
            )
            .into());
        }
        stream.remote_done.store(true, Ordering::Release);
        let _ = stream.events.send(StreamEvent::Headers {
            headers,
            end_stream,
            is_trailer: true,
        });
        self.streams.remove(&stream_id);
        Ok(())
    }

    fn on_data(&mut self, stream_id: u32, event: StreamEvent) {
        let end_stream = matches!(event, StreamEvent::Data { end_stream: true, .. });
        if let Some(stream) = self.streams.get(&stream_id) {
            if end_stream {
                stream.remote_done.store(true, Ordering::Release);
            }
            let delivered = stream.events.send(event).is_ok();
            if end_stream || !delivered {
                self.streams.remove(&stream_id);
            }
        }
    }

    fn on_reset(&mut self, stream_id: u32, error_code: H2ErrorCode) {
        if let Some(stream) = self.streams.remove(&stream_id) {
            stream.remote_done.store(true, Ordering::Release);
            let _ = stream.events.send(StreamEvent::RstStream { error_code });
        }
    }

    fn on_goaway(&mut self, _last_stream_id: u32) {}

    fn last_stream_id(&self) -> u32 {
        self.last_stream_id
    }

    fn on_connection_closed(&mut self) {
        for (_, stream) in self.streams.drain() {
            let _ = stream.events.send(StreamEvent::ConnectionClosed);
        }
    }
}

struct ActiveGuard(Arc<AtomicUsize>);

impl ActiveGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

struct HandlerTask {
    core: Arc<ConnectionCore>,
    stream_id: u32,
    remote_done: Arc<AtomicBool>,
    _active: ActiveGuard,
}

impl HandlerTask {
    async fn run<H: Handler>(self, handler: Arc<H>, request: Request) {
        let stream_id = self.stream_id;
        let response = handler.handle(request).await;
        let status = response.status;

        if let Err(err) = send_response(&self.core, stream_id, response).await {
            tracing::debug!(stream_id, error = %err, "response not delivered");
            return;
        }
        tracing::debug!(stream_id, status, "response sent");

        if !self.remote_done.load(Ordering::Acquire) && !self.core.is_closed() {
            // The client is still sending a body nobody will read.
            if let Err(err) = self.core.reset_stream(stream_id, H2ErrorCode::NoError) {
                tracing::debug!(stream_id, error = %err, "failed to reset stream");
            }
        }
    }
}

async fn send_response(
    core: &ConnectionCore,
    stream_id: u32,
    response: Response,
) -> Result<(), ProtocolError> {
    let mut headers = vec![Header::new(":status", response.status.to_string())];
    let mut has_length = false;
    for header in response.headers {
        let name = header.name.to_ascii_lowercase();
        if header.is_pseudo() || is_connection_specific(&name) {
            continue;
        }
        has_length |= name == CONTENT_LENGTH_HEADER;
        headers.push(Header {
            name,
            value: header.value,
        });
    }
    if !has_length {
        headers.push(Header::new(
            CONTENT_LENGTH_HEADER,
            response.body.len().to_string(),
        ));
    }

    let has_body = !response.body.is_empty();
    let trailers = response.trailers.filter(|t| !t.is_empty());
    core.send_headers(stream_id, headers, !has_body && trailers.is_none())?;
    if has_body {
        core.send_data(stream_id, response.body, trailers.is_none())
            .await?;
    }
    if let Some(trailers) = trailers {
        core.send_headers(stream_id, trailers, true)?;
    }
    Ok(())
}

// RFC 7540 Section 8.1.2.2
fn is_connection_specific(name: &str) -> bool {
    matches!(
        name,
        "connection" | "keep-alive" | "proxy-connection" | "transfer-encoding" | "upgrade"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_head_splits_pseudo_headers() {
        let head = RequestHead::from_headers(vec![
            Header::new(":method", "POST"),
            Header::new(":scheme", "http"),
            Header::new(":path", "/echo"),
            Header::new(":authority", "localhost"),
            Header::new("content-type", "application/json"),
        ])
        .unwrap();
        assert_eq!(head.method, "POST");
        assert_eq!(head.path, "/echo");
        assert_eq!(head.authority.as_deref(), Some("localhost"));
        assert_eq!(head.headers.len(), 1);
    }

    #[test]
    fn request_head_rejects_missing_path() {
        let err = RequestHead::from_headers(vec![Header::new(":method", "GET")]).unwrap_err();
        assert!(err.is_stream_error());
        assert_eq!(err.h2_code(), H2ErrorCode::ProtocolError);
    }

    #[test]
    fn request_head_rejects_late_pseudo_header() {
        let err = RequestHead::from_headers(vec![
            Header::new(":method", "GET"),
            Header::new("accept", "*/*"),
            Header::new(":path", "/"),
        ])
        .unwrap_err();
        assert!(err.is_stream_error());
    }

    #[test]
    fn connection_specific_headers_are_filtered() {
        assert!(is_connection_specific("transfer-encoding"));
        assert!(!is_connection_specific("content-type"));
    }
}
