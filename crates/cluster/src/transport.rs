//! HTTP transport for internode dispatch.

use std::collections::HashMap;
use std::time::Duration;

use evq_common::{EvqError, NodeEndpoint, NodeId, Result};

use crate::mapper::{DataBlock, NodeTransport};

/// Blocking HTTP client keyed by the cluster endpoint table.
///
/// Runs only on intake worker threads, never inside the async listener.
pub struct HttpTransport {
    client: reqwest::blocking::Client,
    endpoints: HashMap<NodeId, String>,
}

impl HttpTransport {
    /// Build from the configured endpoint list.
    pub fn new(endpoints: &[NodeEndpoint]) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(|e| EvqError::internode(format!("http client init failed: {e}")))?;
        Ok(Self {
            client,
            endpoints: endpoints
                .iter()
                .map(|n| (n.id, n.addr.trim_end_matches('/').to_string()))
                .collect(),
        })
    }
}

impl NodeTransport for HttpTransport {
    fn send(
        &self,
        node: NodeId,
        method: &str,
        path: &str,
        params: &[(String, String)],
        payload: &[u8],
    ) -> Result<DataBlock> {
        let base = self
            .endpoints
            .get(&node)
            .ok_or_else(|| EvqError::internode(format!("no endpoint for node {node}")))?;
        let url = format!("{base}{path}");
        let request = match method {
            "GET" => self.client.get(&url),
            "POST" => self.client.post(&url),
            "PUT" => self.client.put(&url),
            "DELETE" => self.client.delete(&url),
            other => {
                return Err(EvqError::internode(format!(
                    "unsupported dispatch method {other}"
                )))
            }
        };
        let response = request
            .query(params)
            .body(payload.to_vec())
            .send()
            .map_err(|e| EvqError::internode(format!("dispatch to node {node} failed: {e}")))?;
        let status = response.status().as_u16();
        let data = response
            .bytes()
            .map_err(|e| EvqError::internode(format!("read reply from node {node} failed: {e}")))?
            .to_vec();
        Ok(DataBlock { data, status })
    }
}
