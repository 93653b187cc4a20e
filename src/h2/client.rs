//! Persistent cleartext HTTP/2 client.
//!
//! One [`H2Client`] owns one TCP connection and multiplexes every request
//! over it. Request bodies are uploaded while the response is being read, so
//! a server that answers early and resets the stream never leaves the call
//! waiting on send credit.

use crate::h2::connection::state::StreamEvent;
use crate::h2::connection::{drive, Body, ConnectionCore, StreamDispatch};
use crate::h2::framing::FrameReader;
use crate::h2::hpack::HeaderDecoder;
use crate::stream::create_tcp_stream;
use crate::types::{
    ClientConfig, ClientTimeouts, FrameTypeH2, H2ConnectionErrorKind, H2ErrorCode,
    H2StreamErrorKind, Header, ProtocolError, Response, Target,
};
use crate::utils::{
    ensure_user_agent, parse_target, timeout_result, CONTENT_LENGTH_HEADER, CONTENT_TYPE_HEADER,
};
use bytes::Bytes;
use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const MAX_STREAM_ID: u32 = 0x7FFF_FFFF;

#[derive(Debug)]
struct Routes {
    next_stream_id: u32,
    streams: HashMap<u32, mpsc::UnboundedSender<StreamEvent>>,
}

type SharedRoutes = Arc<Mutex<Routes>>;

fn lock_routes(routes: &SharedRoutes) -> MutexGuard<'_, Routes> {
    routes.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct H2Client {
    target: Target,
    timeouts: ClientTimeouts,
    core: Arc<ConnectionCore>,
    routes: SharedRoutes,
    reader: JoinHandle<()>,
    writer: Mutex<Option<JoinHandle<Result<(), ProtocolError>>>>,
}

impl H2Client {
    /// Opens a connection to `target` (an `http://host:port` URL) and
    /// completes the SETTINGS exchange.
    pub async fn connect(target: &str, config: ClientConfig) -> Result<Self, ProtocolError> {
        config.connection.validate()?;
        let target = parse_target(target)?;
        let host = target
            .host()
            .ok_or_else(|| ProtocolError::InvalidTarget("missing host".to_string()))?
            .to_string();
        let port = target
            .port()
            .ok_or_else(|| ProtocolError::InvalidTarget("missing port".to_string()))?;

        let tcp = create_tcp_stream(&host, port, config.timeouts.connect)
            .await
            .map_err(|err| match err.kind() {
                io::ErrorKind::TimedOut => ProtocolError::Timeout,
                _ => ProtocolError::ConnectionFailed(format!("{}:{}: {}", host, port, err)),
            })?;
        let (read_half, write_half) = tcp.into_split();

        let (core, writer) =
            ConnectionCore::start(write_half, config.connection.clone(), config.timeouts.write)?;
        core.queue_handshake(true)?;

        let mut reader = FrameReader::new(read_half, config.connection.max_frame_size);
        let settings = timeout_result(config.timeouts.read, async {
            match reader.read_frame().await {
                Ok(Some(frame))
                    if frame.frame_type == FrameTypeH2::Settings && !frame.is_ack() =>
                {
                    Ok(frame)
                }
                Ok(Some(_)) => Err(ProtocolError::H2ProtocolError(
                    "expected SETTINGS as the server's first frame".to_string(),
                )),
                Ok(None) => Err(ProtocolError::ConnectionFailed(
                    "connection closed during handshake".to_string(),
                )),
                Err(err) => Err(err),
            }
        })
        .await;
        if let Err(err) = settings.and_then(|frame| core.handle_control_frame(&frame)) {
            core.fail(0, &err);
            return Err(err);
        }
        tracing::debug!(target = %target, "h2c connection established");

        let routes = Arc::new(Mutex::new(Routes {
            next_stream_id: 1,
            streams: HashMap::new(),
        }));
        let dispatch = ClientDispatch {
            core: Arc::clone(&core),
            routes: Arc::clone(&routes),
        };
        let decoder = HeaderDecoder::new(config.connection.header_table_size as usize);
        let reader = tokio::spawn({
            let core = Arc::clone(&core);
            async move {
                if let Err(err) = drive(core, reader, decoder, dispatch).await {
                    tracing::debug!(error = %err, "client connection ended");
                }
            }
        });

        Ok(Self {
            target,
            timeouts: config.timeouts,
            core,
            routes,
            reader,
            writer: Mutex::new(Some(writer)),
        })
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    /// Shared connection state, mainly for inspecting flow control.
    pub fn connection(&self) -> &ConnectionCore {
        &self.core
    }

    pub fn is_closed(&self) -> bool {
        self.core.is_closed()
    }

    pub async fn get(&self, path: &str) -> Result<Response, ProtocolError> {
        self.send("GET", path, Vec::new(), None).await
    }

    pub async fn post(
        &self,
        path: &str,
        content_type: &str,
        body: impl Into<Bytes>,
    ) -> Result<Response, ProtocolError> {
        let headers = vec![Header::new(CONTENT_TYPE_HEADER, content_type)];
        self.send("POST", path, headers, Some(body.into())).await
    }

    /// Sends a request and waits for the complete response, bounded by the
    /// configured request timeout. A timed-out call cancels its stream.
    pub async fn send(
        &self,
        method: &str,
        path: &str,
        headers: Vec<Header>,
        body: Option<Bytes>,
    ) -> Result<Response, ProtocolError> {
        timeout_result(self.timeouts.request, self.exchange(method, path, headers, body)).await
    }

    async fn exchange(
        &self,
        method: &str,
        path: &str,
        headers: Vec<Header>,
        body: Option<Bytes>,
    ) -> Result<Response, ProtocolError> {
        let body = body.filter(|b| !b.is_empty());
        let request_headers =
            self.request_headers(method, path, headers, body.as_ref().map(Bytes::len));
        let mut stream = self.open_stream(request_headers, body.is_none())?;
        let stream_id = stream.stream_id;
        let events = stream.take_events();
        let core = &self.core;

        let upload = async {
            match body {
                Some(body) => core.send_data(stream_id, body, true).await,
                None => Ok(()),
            }
        };
        let download = async {
            let result = read_response(core, stream_id, events).await;
            if result.is_err() {
                core.send_flow().close_stream(stream_id);
            }
            result
        };

        let (sent, received) = tokio::join!(upload, download);
        let response = received?;
        match sent {
            Ok(()) => {}
            Err(err) if is_upload_cut_short(&err) => {
                tracing::debug!(stream_id, error = %err, "server stopped the request body");
            }
            Err(err) => return Err(err),
        }

        stream.finish();
        Ok(response)
    }

    fn request_headers(
        &self,
        method: &str,
        path: &str,
        headers: Vec<Header>,
        body_len: Option<usize>,
    ) -> Vec<Header> {
        let authority = self.target.authority().unwrap_or_default();
        let mut pseudo = vec![
            Header::new(":method", method.to_uppercase()),
            Header::new(":scheme", self.target.scheme()),
            Header::new(":authority", authority),
            Header::new(":path", path),
        ];
        let mut regular = Vec::new();

        for header in headers {
            let name = header.name.to_lowercase();
            let header = Header {
                name,
                value: header.value,
            };
            if header.is_pseudo() {
                // Caller-supplied pseudo-headers replace the defaults.
                pseudo.retain(|h| h.name != header.name);
                pseudo.push(header);
            } else {
                regular.push(header);
            }
        }

        ensure_user_agent(&mut regular);
        if let Some(len) = body_len {
            if !regular.iter().any(|h| h.name == CONTENT_LENGTH_HEADER) {
                regular.push(Header::new(CONTENT_LENGTH_HEADER, len.to_string()));
            }
        }

        pseudo.extend(regular);
        pseudo
    }

    fn open_stream(&self, headers: Vec<Header>, end_stream: bool) -> Result<ClientStream, ProtocolError> {
        let (stream_id, events, queued) = {
            let mut routes = lock_routes(&self.routes);
            if self.core.is_closed() || self.core.goaway_last_stream_id().is_some() {
                return Err(self.core.goaway_error());
            }
            let stream_id = routes.next_stream_id;
            if stream_id > MAX_STREAM_ID {
                return Err(H2ConnectionErrorKind::ProtocolViolation(
                    "stream identifiers exhausted".to_string(),
                )
                .into());
            }
            routes.next_stream_id += 2;

            self.core.recv_flow().open_stream(stream_id, false)?;
            self.core.send_flow().open_stream(stream_id);
            let (tx, rx) = mpsc::unbounded_channel();
            routes.streams.insert(stream_id, tx);
            // Queued under the routes lock so stream ids hit the wire in order.
            let queued = self.core.send_headers(stream_id, headers, end_stream);
            (stream_id, rx, queued)
        };

        let stream = ClientStream {
            stream_id,
            core: Arc::clone(&self.core),
            routes: Arc::clone(&self.routes),
            events: Some(events),
            finished: false,
        };
        queued?;
        tracing::trace!(stream_id, "request stream opened");
        Ok(stream)
    }

    /// Sends GOAWAY and closes the connection.
    pub async fn close(&self) -> Result<(), ProtocolError> {
        self.core.shutdown(0);
        let writer = self
            .writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(writer) = writer {
            writer
                .await
                .map_err(|err| ProtocolError::ConnectionFailed(err.to_string()))??;
        }
        self.reader.abort();
        Ok(())
    }
}

impl Drop for H2Client {
    fn drop(&mut self) {
        self.core.shutdown(0);
        self.reader.abort();
    }
}

fn is_upload_cut_short(err: &ProtocolError) -> bool {
    matches!(
        err,
        ProtocolError::H2StreamError(H2StreamErrorKind::StreamClosed)
            | ProtocolError::H2StreamError(H2StreamErrorKind::Reset(H2ErrorCode::NoError))
    )
}

async fn read_response(
    core: &Arc<ConnectionCore>,
    stream_id: u32,
    mut events: mpsc::UnboundedReceiver<StreamEvent>,
) -> Result<Response, ProtocolError> {
    let (status, headers, end_stream) = loop {
        let event = events.recv().await.unwrap_or(StreamEvent::ConnectionClosed);
        match event {
            StreamEvent::Headers {
                headers,
                end_stream,
                ..
            } => {
                let (status, headers) = split_status(headers)?;
                // Interim 1xx responses are skipped.
                if (100..200).contains(&status) && !end_stream {
                    continue;
                }
                break (status, headers, end_stream);
            }
            StreamEvent::Data { .. } => {
                return Err(ProtocolError::InvalidResponse(
                    "DATA received before response headers".to_string(),
                ))
            }
            StreamEvent::RstStream { error_code } => {
                return Err(H2StreamErrorKind::Reset(error_code).into())
            }
            StreamEvent::ConnectionClosed => return Err(core.goaway_error()),
        }
    };

    let mut body = Body::new(stream_id, events, Arc::clone(core), end_stream);
    let data = body.read_to_end().await?;
    let trailers = body.trailers().map(<[Header]>::to_vec);
    body.close()?;

    let mut response = Response::new(status).with_body(data);
    response.headers = headers;
    response.trailers = trailers;
    Ok(response)
}

fn split_status(headers: Vec<Header>) -> Result<(u16, Vec<Header>), ProtocolError> {
    let mut status = None;
    let mut regular = Vec::with_capacity(headers.len());
    for header in headers {
        if header.name == ":status" {
            status = header.value.as_deref().and_then(|v| v.parse::<u16>().ok());
        } else if !header.is_pseudo() {
            regular.push(header);
        }
    }
    let status = status.ok_or_else(|| {
        ProtocolError::InvalidResponse("missing or invalid :status".to_string())
    })?;
    Ok((status, regular))
}

/// Cancels the stream with RST_STREAM(CANCEL) unless it completed.
struct ClientStream {
    stream_id: u32,
    core: Arc<ConnectionCore>,
    routes: SharedRoutes,
    events: Option<mpsc::UnboundedReceiver<StreamEvent>>,
    finished: bool,
}

impl ClientStream {
    fn take_events(&mut self) -> mpsc::UnboundedReceiver<StreamEvent> {
        match self.events.take() {
            Some(events) => events,
            None => mpsc::unbounded_channel().1,
        }
    }

    fn finish(&mut self) {
        self.finished = true;
        self.forget();
        self.core.send_flow().close_stream(self.stream_id);
        if let Err(err) = self.core.close_stream_by_application(self.stream_id) {
            tracing::debug!(stream_id = self.stream_id, error = %err, "stream release failed");
        }
    }

    fn forget(&self) {
        lock_routes(&self.routes).streams.remove(&self.stream_id);
    }
}

impl Drop for ClientStream {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        self.forget();
        tracing::debug!(stream_id = self.stream_id, "cancelling request stream");
        if self.core.is_closed() {
            self.core.send_flow().close_stream(self.stream_id);
            let _ = self.core.close_stream_by_application(self.stream_id);
        } else if let Err(err) = self.core.reset_stream(self.stream_id, H2ErrorCode::Cancel) {
            tracing::debug!(stream_id = self.stream_id, error = %err, "cancel failed");
        }
    }
}

struct ClientDispatch {
    core: Arc<ConnectionCore>,
    routes: SharedRoutes,
}

impl StreamDispatch for ClientDispatch {
    fn on_headers(
        &mut self,
        stream_id: u32,
        headers: Vec<Header>,
        end_stream: bool,
    ) -> Result<(), ProtocolError> {
        let mut routes = lock_routes(&self.routes);
        if stream_id % 2 == 0 || stream_id >= routes.next_stream_id {
            return Err(ProtocolError::H2ProtocolError(format!(
                "HEADERS on stream {} which was never opened",
                stream_id
            )));
        }
        // Streams we already cancelled are ignored.
        if let Some(tx) = routes.streams.get(&stream_id) {
            let _ = tx.send(StreamEvent::Headers {
                headers,
                end_stream,
                is_trailer: false,
            });
            if end_stream {
                routes.streams.remove(&stream_id);
            }
        }
        Ok(())
    }

    fn on_data(&mut self, stream_id: u32, event: StreamEvent) {
        let end_stream = matches!(event, StreamEvent::Data { end_stream: true, .. });
        let mut routes = lock_routes(&self.routes);
        if let Some(tx) = routes.streams.get(&stream_id) {
            let _ = tx.send(event);
            if end_stream {
                routes.streams.remove(&stream_id);
            }
        }
    }

    fn on_reset(&mut self, stream_id: u32, error_code: H2ErrorCode) {
        if let Some(tx) = lock_routes(&self.routes).streams.remove(&stream_id) {
            let _ = tx.send(StreamEvent::RstStream { error_code });
        }
    }

    fn on_goaway(&mut self, last_stream_id: u32) {
        let mut routes = lock_routes(&self.routes);
        let refused: Vec<u32> = routes
            .streams
            .keys()
            .copied()
            .filter(|id| *id > last_stream_id)
            .collect();
        for stream_id in refused {
            self.core.send_flow().close_stream(stream_id);
            if let Some(tx) = routes.streams.remove(&stream_id) {
                let _ = tx.send(StreamEvent::ConnectionClosed);
            }
        }
    }

    fn last_stream_id(&self) -> u32 {
        0
    }

    fn on_connection_closed(&mut self) {
        for (_, tx) in lock_routes(&self.routes).streams.drain() {
            let _ = tx.send(StreamEvent::ConnectionClosed);
        }
    }
}
