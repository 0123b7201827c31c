//! HTTP listener and the local-dispatch transport.
//!
//! The async surface is deliberately thin: every request becomes an
//! intake [`Message`] and is answered over a oneshot; all real work
//! happens on the sync pools behind the queues.

use std::io;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, Method, StatusCode, Uri};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;

use evq_cluster::{DataBlock, HttpTransport, NodeTransport};
use evq_common::{global_metrics, EvqError, NodeId, Result as EvqResult};

use crate::intake::{route_message, Intake};
use crate::message::Message;

/// Decode a query string into ordered `(key, value)` pairs.
pub fn parse_query(query: Option<&str>) -> Vec<(String, String)> {
    let Some(query) = query else {
        return Vec::new();
    };
    url::form_urlencoded::parse(query.as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}

fn content_type_for(body: &[u8]) -> &'static str {
    if evq_result::is_internode_blob(body) {
        "application/octet-stream"
    } else if matches!(body.first(), Some(b'{') | Some(b'[')) {
        "application/json"
    } else {
        "text/plain"
    }
}

fn build_response(status: u16, body: Vec<u8>) -> Response {
    Response::builder()
        .status(StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR))
        .header(header::CONTENT_TYPE, content_type_for(&body))
        .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")
        .body(axum::body::Body::from(body))
        .expect("static response parts")
}

async fn ping() -> Response {
    build_response(200, br#"{"pong":true}"#.to_vec())
}

async fn metrics() -> String {
    global_metrics().render_prometheus()
}

async fn intake_handler(
    State(intake): State<Arc<Intake>>,
    method: Method,
    uri: Uri,
    body: Bytes,
) -> Response {
    let (tx, rx) = tokio::sync::oneshot::channel::<(u16, Vec<u8>)>();
    let message = Message::new(
        method.as_str(),
        uri.path(),
        parse_query(uri.query()),
        body.to_vec(),
        Box::new(move |status, body| {
            let _ = tx.send((status, body));
        }),
    );
    route_message(&intake, message);
    match rx.await {
        Ok((status, body)) => build_response(status, body),
        Err(_) => build_response(500, br#"{"error":"reply channel closed"}"#.to_vec()),
    }
}

/// Build the node's router.
pub fn app(intake: Arc<Intake>) -> Router {
    Router::new()
        .route("/ping", get(ping))
        .route("/metrics", get(metrics))
        .fallback(intake_handler)
        .with_state(intake)
}

/// Bind and serve until shutdown.
pub async fn serve(bind: &str, intake: Arc<Intake>) -> io::Result<()> {
    let listener = TcpListener::bind(bind).await?;
    tracing::info!(addr = %listener.local_addr()?, "http listener started");
    serve_listener(listener, intake).await
}

/// Serve on an existing listener (tests bind port 0).
pub async fn serve_listener(listener: TcpListener, intake: Arc<Intake>) -> io::Result<()> {
    axum::serve(listener, app(intake)).await.map_err(io::Error::other)
}

/// Outbound transport: self-dispatch loops through the local intake
/// queues (identical routing rules, no socket), remote dispatch goes
/// over HTTP. Fork POSTs therefore land on the `other` lane on every
/// node, local or not.
pub struct LocalTransport {
    self_node: NodeId,
    intake: Arc<Intake>,
    http: HttpTransport,
}

impl LocalTransport {
    /// Build the node's transport.
    pub fn new(self_node: NodeId, intake: Arc<Intake>, http: HttpTransport) -> Self {
        Self {
            self_node,
            intake,
            http,
        }
    }
}

impl NodeTransport for LocalTransport {
    fn send(
        &self,
        node: NodeId,
        method: &str,
        path: &str,
        params: &[(String, String)],
        payload: &[u8],
    ) -> EvqResult<DataBlock> {
        if node != self.self_node {
            return self.http.send(node, method, path, params, payload);
        }
        let (tx, rx) = mpsc::sync_channel::<(u16, Vec<u8>)>(1);
        let message = Message::new(
            method,
            path,
            params.to_vec(),
            payload.to_vec(),
            Box::new(move |status, body| {
                let _ = tx.send((status, body));
            }),
        );
        route_message(&self.intake, message);
        rx.recv_timeout(Duration::from_secs(300))
            .map(|(status, data)| DataBlock { data, status })
            .map_err(|_| EvqError::internode("local dispatch timed out"))
    }
}
