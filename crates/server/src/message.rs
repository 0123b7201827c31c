//! Intake message: one HTTP request plus its one-shot replier.
//!
//! The listener converts every request into a `Message` and hands it to
//! the intake queues; handlers and shuttle callbacks reply through it
//! from whatever thread finishes the work. The replier fires at most
//! once; later replies are dropped.

use std::sync::Arc;

use parking_lot::Mutex;

use evq_common::{global_metrics, EvqError};

/// Reply sink invoked with `(status, body)`.
pub type Replier = Box<dyn FnOnce(u16, Vec<u8>) + Send>;

/// Shared request handle.
pub type MessagePtr = Arc<Message>;

/// One queued request.
pub struct Message {
    method: String,
    path: String,
    params: Vec<(String, String)>,
    body: Vec<u8>,
    replier: Mutex<Option<Replier>>,
}

impl Message {
    /// Build a message; `params` keeps query-string order.
    pub fn new(
        method: impl Into<String>,
        path: impl Into<String>,
        params: Vec<(String, String)>,
        body: Vec<u8>,
        replier: Replier,
    ) -> MessagePtr {
        Arc::new(Self {
            method: method.into(),
            path: path.into(),
            params,
            body,
            replier: Mutex::new(Some(replier)),
        })
    }

    /// HTTP method, uppercase.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Request path without the query string.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// All query parameters in order.
    pub fn params(&self) -> &[(String, String)] {
        &self.params
    }

    /// POST body bytes.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// POST body as UTF-8 (lossy).
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// First value of a query parameter.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// True when the parameter is present.
    pub fn is_param(&self, name: &str) -> bool {
        self.param(name).is_some()
    }

    /// Boolean parameter (`true`/`1`), default false.
    pub fn param_bool(&self, name: &str) -> bool {
        matches!(self.param(name), Some("true") | Some("1"))
    }

    /// Integer parameter with default.
    pub fn param_i64(&self, name: &str, default: i64) -> i64 {
        self.param(name)
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(default)
    }

    /// Float parameter with default.
    pub fn param_f64(&self, name: &str, default: f64) -> f64 {
        self.param(name)
            .and_then(|v| v.parse::<f64>().ok())
            .unwrap_or(default)
    }

    /// String parameter with default.
    pub fn param_str(&self, name: &str, default: &str) -> String {
        self.param(name).unwrap_or(default).to_string()
    }

    /// Reply once with raw bytes; later calls are no-ops.
    pub fn reply(&self, status: u16, body: Vec<u8>) {
        if let Some(replier) = self.replier.lock().take() {
            replier(status, body);
        }
    }

    /// Reply once with a JSON value.
    pub fn reply_json(&self, status: u16, body: &serde_json::Value) {
        self.reply(status, body.to_string().into_bytes());
    }

    /// Reply 400 with the canonical error body and count the error.
    pub fn reply_error(&self, error: EvqError) {
        global_metrics().inc_query_error(&error.class.to_string(), &error.code.to_string());
        self.reply(400, error.to_json_bytes());
    }

    /// True once a reply has gone out.
    pub fn replied(&self) -> bool {
        self.replier.lock().is_none()
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("method", &self.method)
            .field("path", &self.path)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn reply_fires_once() {
        let (tx, rx) = mpsc::channel();
        let msg = Message::new(
            "GET",
            "/ping",
            vec![],
            Vec::new(),
            Box::new(move |status, body| {
                let _ = tx.send((status, body));
            }),
        );
        msg.reply(200, b"one".to_vec());
        msg.reply(500, b"two".to_vec());
        assert_eq!(rx.recv().unwrap().0, 200);
        assert!(rx.try_recv().is_err());
        assert!(msg.replied());
    }

    #[test]
    fn param_accessors() {
        let msg = Message::new(
            "POST",
            "/v1/query/t/event",
            vec![
                ("fork".into(), "true".into()),
                ("trim".into(), "25".into()),
                ("order".into(), "asc".into()),
            ],
            Vec::new(),
            Box::new(|_, _| {}),
        );
        assert!(msg.param_bool("fork"));
        assert_eq!(msg.param_i64("trim", -1), 25);
        assert_eq!(msg.param_str("order", "desc"), "asc");
        assert_eq!(msg.param_i64("missing", -1), -1);
    }
}
