//! Framed transports at `/socket.io/`.
//!
//! # Responsibilities
//! - Negotiate the transport the client asks for: `websocket`,
//!   `xhr-polling` or `jsonp-polling`
//! - Relay WebSocket frames between the client and the worker's `/socket`
//! - Emulate the same channel over long-polling for clients without
//!   WebSocket support
//!
//! # Design Decisions
//! - There is no default transport; a missing or unknown one is a 400
//! - A polling channel keeps one WebSocket open to the worker and buffers
//!   the worker's frames until the client polls
//! - A polling channel is bound to the session key it was opened with;
//!   requests routed to another key are refused
//!
//! # Data Flow
//! ```text
//! websocket:  client ⇄ relay() ⇄ worker /socket
//! polling:    GET  ?sid → PollChannel::poll ← pump ← worker /socket
//!             POST ?sid → PollChannel::send → pump → worker /socket
//! ```

use std::collections::{HashMap, VecDeque};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::{self, WebSocket, WebSocketUpgrade};
use axum::extract::{FromRequestParts, Request, State};
use axum::http::{header, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, Notify};
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use url::form_urlencoded;

use crate::gate::server::{Gateway, Route};
use crate::net::connection::ConnectionGuard;
use crate::observability::metrics;
use crate::session::SessionKey;

/// URI the worker's socket endpoint is reached at over its UNIX socket.
const WORKER_SOCKET_URI: &str = "ws://worker/socket";

const DEFAULT_CALLBACK: &str = "callback";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    WebSocket,
    XhrPolling,
    JsonpPolling,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::WebSocket => "websocket",
            Transport::XhrPolling => "xhr-polling",
            Transport::JsonpPolling => "jsonp-polling",
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unsupported transport: {0}")]
pub struct UnknownTransport(String);

impl FromStr for Transport {
    type Err = UnknownTransport;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "websocket" => Ok(Transport::WebSocket),
            "xhr-polling" => Ok(Transport::XhrPolling),
            "jsonp-polling" => Ok(Transport::JsonpPolling),
            other => Err(UnknownTransport(other.to_string())),
        }
    }
}

fn error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({"message": message.into()}))).into_response()
}

/// Entry point for `/socket.io/`.
pub async fn handle(State(gateway): State<Gateway>, request: Request) -> Response {
    let query: HashMap<String, String> = request
        .uri()
        .query()
        .map(|q| form_urlencoded::parse(q.as_bytes()).into_owned().collect())
        .unwrap_or_default();

    let transport = match query.get("transport").map(|t| t.parse::<Transport>()) {
        Some(Ok(transport)) => transport,
        Some(Err(e)) => return error(StatusCode::BAD_REQUEST, e.to_string()),
        None => return error(StatusCode::BAD_REQUEST, "transport is required"),
    };
    metrics::record_transport(transport.as_str());

    match transport {
        Transport::WebSocket => websocket(gateway, request).await,
        polling => {
            let callback = query.get("callback").map(String::as_str);
            match query.get("sid") {
                None => open_channel(gateway, polling, request).await,
                Some(sid) => exchange(gateway, polling, sid, callback, request).await,
            }
        }
    }
}

async fn connect_worker(gateway: &Gateway, route: &Route) -> Result<WebSocketStream<UnixStream>, Response> {
    let worker = gateway
        .worker_for(route)
        .await
        .map_err(|e| super::server::worker_unavailable(&e))?;
    let stream = UnixStream::connect(worker.socket_path()).await.map_err(|e| {
        tracing::error!(pid = worker.pid(), error = %e, "Could not reach worker socket");
        error(StatusCode::BAD_GATEWAY, "Worker unreachable")
    })?;
    let (upstream, _) = tokio_tungstenite::client_async(WORKER_SOCKET_URI, stream)
        .await
        .map_err(|e| {
            tracing::error!(pid = worker.pid(), error = %e, "Worker refused socket upgrade");
            error(StatusCode::BAD_GATEWAY, "Worker socket unavailable")
        })?;
    Ok(upstream)
}

async fn websocket(gateway: Gateway, request: Request) -> Response {
    let (mut parts, _body) = request.into_parts();
    let upgrade = match WebSocketUpgrade::from_request_parts(&mut parts, &gateway).await {
        Ok(upgrade) => upgrade,
        Err(rejection) => return rejection.into_response(),
    };
    let route = gateway.route(&parts.headers);
    let upstream = match connect_worker(&gateway, &route).await {
        Ok(upstream) => upstream,
        Err(response) => return response,
    };
    let guard = gateway.connections().track(Transport::WebSocket.as_str());
    let session = route.key.clone();

    let mut response = upgrade.on_upgrade(move |client| async move {
        tracing::debug!(session = %session, "WebSocket relay opened");
        relay(client, upstream).await;
        tracing::debug!(session = %session, "WebSocket relay closed");
        drop(guard);
    });
    gateway.finish_route(&route, &mut response);
    response
}

fn to_worker(message: ws::Message) -> Option<Message> {
    Some(match message {
        ws::Message::Text(text) => Message::Text(text.as_str().to_owned().into()),
        ws::Message::Binary(data) => Message::Binary(data),
        ws::Message::Ping(data) => Message::Ping(data),
        ws::Message::Pong(data) => Message::Pong(data),
        ws::Message::Close(_) => return None,
    })
}

fn to_client(message: Message) -> Option<ws::Message> {
    Some(match message {
        Message::Text(text) => ws::Message::Text(text.as_str().to_owned().into()),
        Message::Binary(data) => ws::Message::Binary(data),
        Message::Ping(data) => ws::Message::Ping(data),
        Message::Pong(data) => ws::Message::Pong(data),
        Message::Close(_) | Message::Frame(_) => return None,
    })
}

/// Copy frames both ways until either side closes.
async fn relay(client: WebSocket, upstream: WebSocketStream<UnixStream>) {
    let (mut client_tx, mut client_rx) = client.split();
    let (mut worker_tx, mut worker_rx) = upstream.split();

    loop {
        tokio::select! {
            inbound = client_rx.next() => {
                let Some(message) = inbound.and_then(Result::ok).and_then(to_worker) else {
                    break;
                };
                if worker_tx.send(message).await.is_err() {
                    break;
                }
            }
            outbound = worker_rx.next() => {
                let Some(message) = outbound.and_then(Result::ok).and_then(to_client) else {
                    break;
                };
                if client_tx.send(message).await.is_err() {
                    break;
                }
            }
        }
    }
    let _ = worker_tx.send(Message::Close(None)).await;
    let _ = client_tx.send(ws::Message::Close(None)).await;
}

/// A polling client's channel to its worker.
pub struct PollChannel {
    sid: String,
    key: SessionKey,
    outbound: mpsc::UnboundedSender<String>,
    inbox: Mutex<VecDeque<String>>,
    notify: Notify,
    closed: AtomicBool,
    last_seen: Mutex<Instant>,
    pump: Mutex<Option<AbortHandle>>,
    _guard: ConnectionGuard,
}

impl PollChannel {
    fn open(key: SessionKey, upstream: WebSocketStream<UnixStream>, guard: ConnectionGuard) -> Arc<Self> {
        let (outbound, rx) = mpsc::unbounded_channel();
        let channel = Arc::new(Self {
            sid: uuid::Uuid::new_v4().simple().to_string(),
            key,
            outbound,
            inbox: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            last_seen: Mutex::new(Instant::now()),
            pump: Mutex::new(None),
            _guard: guard,
        });
        let task = tokio::spawn(Arc::clone(&channel).pump(upstream, rx));
        if let Ok(mut pump) = channel.pump.lock() {
            *pump = Some(task.abort_handle());
        }
        channel
    }

    async fn pump(self: Arc<Self>, upstream: WebSocketStream<UnixStream>, mut rx: mpsc::UnboundedReceiver<String>) {
        let (mut worker_tx, mut worker_rx) = upstream.split();
        loop {
            tokio::select! {
                frame = worker_rx.next() => match frame {
                    Some(Ok(Message::Text(text))) => self.deliver(text.as_str().to_owned()),
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                },
                frame = rx.recv() => {
                    let Some(frame) = frame else { break };
                    if worker_tx.send(Message::Text(frame.into())).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = worker_tx.send(Message::Close(None)).await;
        self.mark_closed();
    }

    fn deliver(&self, frame: String) {
        if let Ok(mut inbox) = self.inbox.lock() {
            inbox.push_back(frame);
        }
        self.notify.notify_waiters();
    }

    fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn sid(&self) -> &str {
        &self.sid
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn seen(&self) {
        if let Ok(mut last) = self.last_seen.lock() {
            *last = Instant::now();
        }
    }

    fn idle_for(&self) -> Duration {
        self.last_seen
            .lock()
            .map(|last| last.elapsed())
            .unwrap_or_default()
    }

    fn drain(&self) -> Vec<String> {
        self.inbox
            .lock()
            .map(|mut inbox| inbox.drain(..).collect())
            .unwrap_or_default()
    }

    /// Queue `frame` for the worker. Fails once the channel is closed.
    pub fn send(&self, frame: String) -> bool {
        self.seen();
        !self.is_closed() && self.outbound.send(frame).is_ok()
    }

    /// Wait up to `hold` for frames from the worker.
    ///
    /// Returns `None` when the channel is closed and nothing is left.
    pub async fn poll(&self, hold: Duration) -> Option<Vec<String>> {
        self.seen();
        let deadline = Instant::now() + hold;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let frames = self.drain();
            if !frames.is_empty() {
                return Some(frames);
            }
            if self.is_closed() {
                return None;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                self.seen();
                return Some(Vec::new());
            }
        }
    }

    pub fn close(&self) {
        if let Ok(mut pump) = self.pump.lock() {
            if let Some(task) = pump.take() {
                task.abort();
            }
        }
        self.mark_closed();
    }
}

/// Open polling channels by sid.
#[derive(Clone, Default)]
pub struct PollRegistry {
    channels: Arc<DashMap<String, Arc<PollChannel>>>,
}

impl PollRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, channel: Arc<PollChannel>) {
        self.channels.insert(channel.sid.clone(), channel);
    }

    pub fn get(&self, sid: &str) -> Option<Arc<PollChannel>> {
        self.channels.get(sid).map(|c| Arc::clone(c.value()))
    }

    pub fn remove(&self, sid: &str) -> Option<Arc<PollChannel>> {
        let (_, channel) = self.channels.remove(sid)?;
        channel.close();
        Some(channel)
    }

    /// Close channels that are closed or unused for longer than `idle`.
    pub fn vacuum(&self, idle: Duration) -> usize {
        let stale: Vec<String> = self
            .channels
            .iter()
            .filter(|c| c.is_closed() || c.idle_for() > idle)
            .map(|c| c.value().sid().to_string())
            .collect();
        for sid in &stale {
            self.remove(sid);
        }
        stale.len()
    }

    pub fn close_all(&self) {
        for channel in self.channels.iter() {
            channel.close();
        }
        self.channels.clear();
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

async fn open_channel(gateway: Gateway, transport: Transport, request: Request) -> Response {
    if request.method() != Method::GET {
        return error(StatusCode::BAD_REQUEST, "sid is required");
    }
    let route = gateway.route(request.headers());
    let upstream = match connect_worker(&gateway, &route).await {
        Ok(upstream) => upstream,
        Err(response) => return response,
    };
    let channel = PollChannel::open(route.key.clone(), upstream, gateway.connections().track(transport.as_str()));
    gateway.polls().insert(Arc::clone(&channel));
    tracing::debug!(sid = %channel.sid(), transport = transport.as_str(), session = %route.key, "Polling channel opened");

    let mut response = Json(json!({
        "sid": channel.sid(),
        "transport": transport.as_str(),
        "poll_timeout": gateway.app().config.transport.poll_timeout_secs,
    }))
    .into_response();
    gateway.finish_route(&route, &mut response);
    response
}

async fn exchange(
    gateway: Gateway,
    transport: Transport,
    sid: &str,
    callback: Option<&str>,
    request: Request,
) -> Response {
    let Some(channel) = gateway.polls().get(sid) else {
        return error(StatusCode::NOT_FOUND, "Unknown sid");
    };
    let route = gateway.route(request.headers());
    if &route.key != channel.key() {
        return error(StatusCode::FORBIDDEN, "Channel belongs to another session");
    }

    let method = request.method().clone();
    match method {
        Method::GET => {
            let hold = Duration::from_secs(gateway.app().config.transport.poll_timeout_secs);
            match channel.poll(hold).await {
                Some(frames) => render(transport, callback, frames),
                None => {
                    gateway.polls().remove(sid);
                    error(StatusCode::GONE, "Channel closed")
                }
            }
        }
        Method::POST => {
            let limit = gateway.app().config.gateway.max_body_size;
            let body = match axum::body::to_bytes(request.into_body(), limit).await {
                Ok(body) => body,
                Err(_) => return error(StatusCode::PAYLOAD_TOO_LARGE, "Frame too large"),
            };
            let Some(frame) = decode_frame(transport, &body) else {
                return error(StatusCode::BAD_REQUEST, "Malformed frame");
            };
            if channel.send(frame) {
                StatusCode::NO_CONTENT.into_response()
            } else {
                gateway.polls().remove(sid);
                error(StatusCode::GONE, "Channel closed")
            }
        }
        _ => error(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed"),
    }
}

/// Extract the frame text from a POST body.
fn decode_frame(transport: Transport, body: &[u8]) -> Option<String> {
    match transport {
        Transport::JsonpPolling => form_urlencoded::parse(body)
            .find(|(key, _)| key == "d")
            .map(|(_, value)| value.into_owned()),
        _ => String::from_utf8(body.to_vec()).ok(),
    }
    .filter(|frame| !frame.is_empty())
}

fn valid_callback(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '$' | '.'))
}

fn render(transport: Transport, callback: Option<&str>, frames: Vec<String>) -> Response {
    let payload = Value::Array(
        frames
            .into_iter()
            .map(|frame| serde_json::from_str(&frame).unwrap_or(Value::String(frame)))
            .collect(),
    );
    match transport {
        Transport::JsonpPolling => {
            let callback = callback.unwrap_or(DEFAULT_CALLBACK);
            if !valid_callback(callback) {
                return error(StatusCode::BAD_REQUEST, "Invalid callback");
            }
            (
                [(header::CONTENT_TYPE, "application/javascript")],
                format!("{callback}({payload});"),
            )
                .into_response()
        }
        _ => Json(payload).into_response(),
    }
}
