//! Service Discovery Client
//!
//! One-shot endpoint lookups. Responses map into `ServiceEndpoint` records; any failure is a
//! `ServiceDiscoveryFailure` for that request only. Nothing is retried here.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{ErrorKind, WatchlistError};
use crate::rest::{
    RestPurpose, RestRequest, RestRequestId, RestResponse, RestTransportError,
    ServiceDiscoveryEvent,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryTransport {
    Tcp,
    Websocket,
}

impl DiscoveryTransport {
    pub fn as_query(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Websocket => "websocket",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataFormat {
    Rwf,
    TrJson2,
}

impl DataFormat {
    pub fn as_query(&self) -> &'static str {
        match self {
            Self::Rwf => "rwf",
            Self::TrJson2 => "tr_json2",
        }
    }
}

/// One advertised streaming endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEndpoint {
    pub endpoint: String,
    pub port: u16,
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub transport: String,
    #[serde(default, rename = "dataFormat")]
    pub data_format: Vec<String>,
    #[serde(default)]
    pub location: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct DiscoveryResponse {
    #[serde(default)]
    services: Vec<ServiceEndpoint>,
}

/// Parse a discovery response body.
pub fn parse_endpoints(body: &str) -> Result<Vec<ServiceEndpoint>, String> {
    serde_json::from_str::<DiscoveryResponse>(body)
        .map(|r| r.services)
        .map_err(|e| format!("invalid discovery response: {}", e))
}

#[derive(Debug)]
pub struct ServiceDiscoveryClient {
    url: String,
    in_flight: HashSet<RestRequestId>,
}

impl ServiceDiscoveryClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            in_flight: HashSet::new(),
        }
    }

    #[inline]
    pub fn owns(&self, request_id: RestRequestId) -> bool {
        self.in_flight.contains(&request_id)
    }

    pub fn pending(&self) -> usize {
        self.in_flight.len()
    }

    /// Build a lookup. `access_token` goes in the Authorization header when present.
    pub fn lookup(
        &mut self,
        request_id: RestRequestId,
        transport: Option<DiscoveryTransport>,
        data_format: Option<DataFormat>,
        access_token: Option<&str>,
    ) -> RestRequest {
        let mut req = RestRequest::get(request_id, RestPurpose::ServiceDiscovery, self.url.clone())
            .header("Accept", "application/json");
        if let Some(t) = transport {
            req.query.push(("transport".to_string(), t.as_query().to_string()));
        }
        if let Some(f) = data_format {
            req.query.push(("dataformat".to_string(), f.as_query().to_string()));
        }
        if let Some(token) = access_token {
            req = req.header("Authorization", format!("Bearer {}", token));
        }
        debug!(request_id, url = %self.url, "service_discovery_started");
        self.in_flight.insert(request_id);
        req
    }

    pub fn on_response(
        &mut self,
        request_id: RestRequestId,
        result: Result<RestResponse, RestTransportError>,
    ) -> Option<ServiceDiscoveryEvent> {
        if !self.in_flight.remove(&request_id) {
            return None;
        }
        let parsed = match result {
            Ok(resp) if resp.is_success() => parse_endpoints(&resp.body),
            Ok(resp) => Err(format!("discovery returned {}: {}", resp.status, resp.body)),
            Err(e) => Err(e.to_string()),
        };
        let result = parsed.map_err(|reason| {
            warn!(request_id, reason = %reason, "service_discovery_failed");
            WatchlistError::new(ErrorKind::ServiceDiscoveryFailure, reason)
        });
        Some(ServiceDiscoveryEvent { request_id, result })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BODY: &str = r#"{
        "services": [
            {"endpoint": "amer-3.pricing.example.com", "port": 14002, "provider": "aws",
             "transport": "tcp", "dataFormat": ["rwf"], "location": ["us-east-1a", "us-east-1b"]},
            {"endpoint": "amer-1.pricing.example.com", "port": 443, "provider": "aws",
             "transport": "websocket", "dataFormat": ["tr_json2"], "location": ["us-east-1a"]}
        ]
    }"#;

    #[test]
    fn test_lookup_query_params() {
        let mut c = ServiceDiscoveryClient::new("https://api.example/streaming/pricing/v1/");
        let req = c.lookup(
            4,
            Some(DiscoveryTransport::Tcp),
            Some(DataFormat::Rwf),
            Some("tok"),
        );
        assert_eq!(
            req.query,
            vec![
                ("transport".to_string(), "tcp".to_string()),
                ("dataformat".to_string(), "rwf".to_string())
            ]
        );
        assert!(req
            .headers
            .contains(&("Authorization".to_string(), "Bearer tok".to_string())));
        assert!(c.owns(4));
    }

    #[test]
    fn test_response_maps_endpoints() {
        let mut c = ServiceDiscoveryClient::new("https://api.example/");
        c.lookup(1, None, None, None);
        let event = c.on_response(1, Ok(RestResponse::new(200, BODY))).unwrap();
        let endpoints = event.result.unwrap();
        assert_eq!(endpoints.len(), 2);
        assert_eq!(endpoints[0].port, 14002);
        assert_eq!(endpoints[0].location.len(), 2);
        assert_eq!(endpoints[1].data_format, vec!["tr_json2".to_string()]);
        assert_eq!(c.pending(), 0);
    }

    #[test]
    fn test_failure_is_terminal_for_request() {
        let mut c = ServiceDiscoveryClient::new("https://api.example/");
        c.lookup(1, None, None, None);
        c.lookup(2, None, None, None);

        let e1 = c
            .on_response(1, Err(RestTransportError::Request("dns".into())))
            .unwrap();
        assert_eq!(
            e1.result.unwrap_err().kind(),
            ErrorKind::ServiceDiscoveryFailure
        );
        let e2 = c.on_response(2, Ok(RestResponse::new(200, "not json"))).unwrap();
        assert!(e2.result.is_err());

        // Same id again is not ours anymore
        assert!(c.on_response(1, Ok(RestResponse::new(200, BODY))).is_none());
    }
}
