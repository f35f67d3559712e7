//! Long-polling transport (component C4): the HTTP surface at
//! `<base>/transport/lp` implementing the transport base's (C3) contract
//! over plain HTTP request/response pairs, for browser-style clients that
//! cannot hold a raw socket open.

#[macro_use]
extern crate tracing;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Bytes as AxumBytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use bytes::Bytes;
use tokio::sync::{Mutex, Notify};

use json_framer::JsonFramer;
use peer_transport::{PeerId, TransportBase, TransportConfig, TransportObserver};

/// Protocol version advertised in the handshake response (SPEC_FULL.md §6).
pub const HANDSHAKE_VERSION: u32 = 1;

struct LpBookkeeping {
    closed_ids: Mutex<HashSet<PeerId>>,
    closed_notify: Mutex<HashMap<PeerId, Arc<Notify>>>,
}

impl LpBookkeeping {
    fn new() -> Self {
        Self {
            closed_ids: Mutex::new(HashSet::new()),
            closed_notify: Mutex::new(HashMap::new()),
        }
    }
}

/// Forwards transport events to the real owner while tracking the
/// "has this id ever existed and since closed" bit the long-polling HTTP
/// layer needs to distinguish 404 (`unknown_peer`) from 410 (closed).
struct LpObserver<O: TransportObserver> {
    bookkeeping: Arc<LpBookkeeping>,
    owner: Arc<O>,
}

#[async_trait]
impl<O: TransportObserver> TransportObserver for LpObserver<O> {
    async fn on_new_peer(&self, peer: PeerId) {
        self.bookkeeping
            .closed_notify
            .lock()
            .await
            .insert(peer.clone(), Arc::new(Notify::new()));
        self.owner.on_new_peer(peer).await;
    }

    async fn on_receive(&self, peer: PeerId, bytes: Bytes) {
        self.owner.on_receive(peer, bytes).await;
    }

    async fn on_peer_closed(&self, peer: PeerId, gracefully: bool) {
        self.bookkeeping.closed_ids.lock().await.insert(peer.clone());
        if let Some(notify) = self.bookkeeping.closed_notify.lock().await.remove(&peer) {
            notify.notify_waiters();
        }
        self.owner.on_peer_closed(peer, gracefully).await;
    }
}

/// The long-polling transport. Build with [`LongPollingTransport::new`],
/// then mount [`LongPollingTransport::router`] under `<base>/transport/lp`.
pub struct LongPollingTransport {
    base: Arc<TransportBase>,
    bookkeeping: Arc<LpBookkeeping>,
    park_timeout: Duration,
}

impl LongPollingTransport {
    pub fn new<O>(config: TransportConfig, park_timeout: Duration, owner: Arc<O>) -> Arc<Self>
    where
        O: TransportObserver + 'static,
    {
        let bookkeeping = Arc::new(LpBookkeeping::new());
        let observer = Arc::new(LpObserver {
            bookkeeping: Arc::clone(&bookkeeping),
            owner,
        });
        let base = TransportBase::new(config, observer);

        Arc::new(Self {
            base,
            bookkeeping,
            park_timeout,
        })
    }

    pub fn peer_registry(&self) -> &Arc<TransportBase> {
        &self.base
    }

    /// Sends application bytes to `peer`; queued until its next carrier arrival.
    pub async fn send(&self, peer: &PeerId, bytes: Bytes) -> Result<(), peer_transport::TransportError> {
        self.base.send(peer, bytes).await
    }

    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route("/handshake", get(handshake))
            .route("/receive/{peer_id}", get(receive))
            .route("/send/{peer_id}", post(send))
            .route("/close/{peer_id}", post(close))
            .with_state(self)
    }

    async fn peer_status(&self, peer_id: &str) -> PeerLookup {
        let Ok(id) = PeerId::try_from(peer_id) else {
            return PeerLookup::Malformed;
        };
        if self.bookkeeping.closed_ids.lock().await.contains(&id) {
            return PeerLookup::Closed(id);
        }
        match self.base.lookup(&id).await {
            Some(_) => PeerLookup::Live(id),
            None => PeerLookup::Unknown,
        }
    }
}

enum PeerLookup {
    Live(PeerId),
    Closed(PeerId),
    Unknown,
    Malformed,
}

fn unknown_peer_body() -> Response {
    (
        StatusCode::NOT_FOUND,
        axum::Json(serde_json::json!({ "err": "unknown_peer" })),
    )
        .into_response()
}

async fn handshake(State(transport): State<Arc<LongPollingTransport>>) -> Response {
    let id = transport.base.new_peer().await;
    let body = format!("{id}\n{HANDSHAKE_VERSION}\n");
    (StatusCode::OK, body).into_response()
}

async fn receive(State(transport): State<Arc<LongPollingTransport>>, Path(peer_id): Path<String>) -> Response {
    let status = transport.peer_status(&peer_id).await;
    let id = match status {
        PeerLookup::Malformed => return StatusCode::BAD_REQUEST.into_response(),
        PeerLookup::Unknown => return unknown_peer_body(),
        PeerLookup::Closed(_) => return StatusCode::GONE.into_response(),
        PeerLookup::Live(id) => id,
    };

    transport.base.touch(&id, true).await;

    let closed_notify = transport.bookkeeping.closed_notify.lock().await.get(&id).cloned();

    let backlog = transport.base.drain_backlog(&id).await;
    if !backlog.is_empty() {
        return packets_response(&backlog);
    }

    let wait_fut = transport.base.wait_for_backlog(&id);
    tokio::pin!(wait_fut);

    let closed_fut = async {
        match closed_notify {
            Some(notify) => notify.notified().await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(closed_fut);

    tokio::select! {
        result = &mut wait_fut => {
            if result.is_err() {
                return unknown_peer_body();
            }
            let backlog = transport.base.drain_backlog(&id).await;
            packets_response(&backlog)
        }
        _ = &mut closed_fut => {
            StatusCode::GONE.into_response()
        }
        _ = tokio::time::sleep(transport.park_timeout) => {
            packets_response(&[])
        }
    }
}

fn packets_response(packets: &[Bytes]) -> Response {
    let mut body = Vec::with_capacity(2 + packets.iter().map(|p| p.len() + 1).sum::<usize>());
    body.push(b'[');
    for (i, packet) in packets.iter().enumerate() {
        if i > 0 {
            body.push(b',');
        }
        body.extend_from_slice(packet);
    }
    body.push(b']');

    (
        StatusCode::OK,
        [("content-type", "application/json")],
        body,
    )
        .into_response()
}

async fn send(
    State(transport): State<Arc<LongPollingTransport>>,
    Path(peer_id): Path<String>,
    body: AxumBytes,
) -> Response {
    let status = transport.peer_status(&peer_id).await;
    let id = match status {
        PeerLookup::Malformed => return StatusCode::BAD_REQUEST.into_response(),
        PeerLookup::Unknown => return unknown_peer_body(),
        PeerLookup::Closed(_) => return StatusCode::GONE.into_response(),
        PeerLookup::Live(id) => id,
    };

    // JsonFramer's handler closure needs `Send + 'static`, so collect through
    // a shared buffer rather than a borrowed `Vec`.
    let collected = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
    let collected_clone = std::sync::Arc::clone(&collected);
    let mut framer = JsonFramer::new();
    framer.set_packet_handler(move |bytes: &[u8]| {
        collected_clone.lock().unwrap_or_else(|e| e.into_inner()).push(bytes.to_vec());
    });

    if framer.feed(&body).is_err() {
        warn!(peer = %id, "Malformed JSON on send channel; closing peer");
        transport.base.close(&id, false).await;
        return StatusCode::BAD_REQUEST.into_response();
    }

    let packets = std::mem::take(&mut *collected.lock().unwrap_or_else(|e| e.into_inner()));
    for packet in packets {
        transport.base.receive(&id, Bytes::from(packet)).await;
    }

    StatusCode::OK.into_response()
}

async fn close(State(transport): State<Arc<LongPollingTransport>>, Path(peer_id): Path<String>) -> Response {
    match transport.peer_status(&peer_id).await {
        PeerLookup::Malformed => StatusCode::BAD_REQUEST.into_response(),
        PeerLookup::Unknown => unknown_peer_body(),
        PeerLookup::Closed(_) => StatusCode::GONE.into_response(),
        PeerLookup::Live(id) => {
            transport.base.close(&id, true).await;
            StatusCode::OK.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt as _;
    use tower::ServiceExt as _;

    struct NullObserver;

    #[async_trait]
    impl TransportObserver for NullObserver {
        async fn on_new_peer(&self, _peer: PeerId) {}
        async fn on_receive(&self, _peer: PeerId, _bytes: Bytes) {}
        async fn on_peer_closed(&self, _peer: PeerId, _gracefully: bool) {}
    }

    fn test_transport(park_timeout: Duration) -> Arc<LongPollingTransport> {
        LongPollingTransport::new(TransportConfig::default(), park_timeout, Arc::new(NullObserver))
    }

    async fn body_bytes(response: Response) -> Vec<u8> {
        response.into_body().collect().await.unwrap().to_bytes().to_vec()
    }

    #[tokio::test]
    async fn handshake_returns_valid_peer_id_and_version() {
        let transport = test_transport(Duration::from_millis(200));
        let router = Arc::clone(&transport).router();

        let response = router
            .oneshot(
                axum::http::Request::builder()
                    .uri("/handshake")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = String::from_utf8(body_bytes(response).await).unwrap();
        let mut lines = body.lines();
        let peer_id = lines.next().unwrap();
        let version = lines.next().unwrap();

        assert!(peer_id.len() >= 8);
        assert!(peer_id.bytes().all(|b| b.is_ascii_alphanumeric()));
        assert_eq!(version, "1");
    }

    #[tokio::test]
    async fn send_then_receive_echoes_queued_packet() {
        let transport = test_transport(Duration::from_millis(200));
        let id = transport.peer_registry().new_peer().await;

        transport.send(&id, Bytes::from_static(b"[7]")).await.unwrap();

        let router = Arc::clone(&transport).router();
        let response = router
            .oneshot(
                axum::http::Request::builder()
                    .uri(format!("/receive/{id}"))
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_bytes(response).await;
        assert_eq!(body, b"[[7]]");
    }

    #[tokio::test]
    async fn send_channel_feeds_framer_and_delivers_packets() {
        let transport = test_transport(Duration::from_millis(200));
        let id = transport.peer_registry().new_peer().await;
        let router = Arc::clone(&transport).router();

        let response = router
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri(format!("/send/{id}"))
                    .body(axum::body::Body::from("[7]"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn park_timeout_returns_empty_array() {
        let transport = test_transport(Duration::from_millis(20));
        let id = transport.peer_registry().new_peer().await;
        let router = Arc::clone(&transport).router();

        let started = tokio::time::Instant::now();
        let response = router
            .oneshot(
                axum::http::Request::builder()
                    .uri(format!("/receive/{id}"))
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(20));

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_bytes(response).await, b"[]");
    }

    #[tokio::test]
    async fn unknown_peer_on_receive_yields_404() {
        let transport = test_transport(Duration::from_millis(200));
        let router = Arc::clone(&transport).router();

        let response = router
            .oneshot(
                axum::http::Request::builder()
                    .uri("/receive/Zzzzzzzz")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = body_bytes(response).await;
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json, serde_json::json!({ "err": "unknown_peer" }));
    }

    #[tokio::test]
    async fn closed_peer_on_receive_yields_410() {
        let transport = test_transport(Duration::from_millis(200));
        let id = transport.peer_registry().new_peer().await;
        transport.peer_registry().close(&id, true).await;

        let router = Arc::clone(&transport).router();
        let response = router
            .oneshot(
                axum::http::Request::builder()
                    .uri(format!("/receive/{id}"))
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::GONE);
    }
}
