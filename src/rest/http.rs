//! reqwest-backed REST exchange
//!
//! Each submitted request runs as a task on the given tokio runtime; the response (or the
//! transport failure) is pushed onto the dispatch queue.

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Client;
use tokio::runtime::Handle;
use tracing::debug;

use crate::dispatch::{DispatchEvent, EventSender};
use crate::rest::{RestExchange, RestMethod, RestRequest, RestResponse, RestTransportError};

#[derive(Clone)]
pub struct ReqwestExchange {
    client: Client,
    runtime: Handle,
}

impl ReqwestExchange {
    pub fn new(runtime: Handle, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(4)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .context("Failed to build REST client")?;
        Ok(Self { client, runtime })
    }

    /// Use the runtime the caller is running on.
    pub fn current(timeout: Duration) -> Result<Self> {
        let runtime = Handle::try_current().context("No tokio runtime for REST exchange")?;
        Self::new(runtime, timeout)
    }

    async fn execute(client: Client, request: RestRequest) -> Result<RestResponse, RestTransportError> {
        let mut builder = match request.method {
            RestMethod::Get => client.get(&request.url),
            RestMethod::Post => client.post(&request.url),
        };
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let resp = builder
            .send()
            .await
            .map_err(|e| RestTransportError::Request(e.to_string()))?;

        let status = resp.status().as_u16();
        let headers = resp
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
            .collect();
        let body = resp
            .text()
            .await
            .map_err(|e| RestTransportError::Body(e.to_string()))?;

        Ok(RestResponse {
            status,
            headers,
            body,
        })
    }
}

impl RestExchange for ReqwestExchange {
    fn submit(&self, request: RestRequest, reply: EventSender) {
        let client = self.client.clone();
        debug!(
            request_id = request.id,
            method = %request.method,
            url = %request.url,
            "rest_submit"
        );
        self.runtime.spawn(async move {
            let request_id = request.id;
            let result = Self::execute(client, request).await;
            reply.send(DispatchEvent::Rest { request_id, result });
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::dispatch::EventQueue;
    use crate::rest::RestPurpose;

    #[tokio::test]
    async fn test_unreachable_host_reports_transport_error() {
        let queue = Arc::new(EventQueue::new());
        let exchange = ReqwestExchange::current(Duration::from_millis(500)).unwrap();
        exchange.submit(
            RestRequest::get(7, RestPurpose::ServiceDiscovery, "http://127.0.0.1:9/"),
            EventSender::new(Arc::clone(&queue)),
        );

        let mut events = Vec::new();
        for _ in 0..100 {
            events = queue.drain(1);
            if !events.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        match events.first() {
            Some(DispatchEvent::Rest { request_id, result }) => {
                assert_eq!(*request_id, 7);
                assert!(result.is_err());
            }
            other => panic!("expected a rest completion, got {:?}", other),
        }
    }
}
