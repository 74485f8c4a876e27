//! Token Renewal Scheduler
//!
//! Keeps the current access token and one absolute renewal deadline:
//! - by default `expires_at - renewal_margin`
//! - with `reissue_ratio` set, `issued_at + ratio * lifetime`
//!
//! When the deadline passes, `poll` produces a token request. Failures retry with doubling
//! delay up to the attempt limit, after which an `AuthTokenFailure` is surfaced. The channel is
//! never touched from here; a failed renewal leaves the current connection running.
//!
//! With credentials configured and no token installed, the first renewal fires on the first poll.

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::clock::{millis, secs, Nanos};
use crate::config::TokenConfig;
use crate::error::{ErrorKind, WatchlistError};
use crate::rest::{
    AuthTokenEvent, RestPurpose, RestRequest, RestRequestId, RestResponse, RestTransportError,
};
use crate::session::BackoffCalculator;

/// Client credentials for the token endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenCredentials {
    pub token_url: String,
    pub client_id: String,
    pub client_secret: Option<String>,
    pub scope: String,
}

impl TokenCredentials {
    /// Credentials are usable only when both the URL and the client id are present.
    pub fn from_config(config: &TokenConfig) -> Option<Self> {
        Some(Self {
            token_url: config.token_url.clone()?,
            client_id: config.client_id.clone()?,
            client_secret: config.client_secret.clone(),
            scope: config.scope.clone(),
        })
    }
}

/// Current access token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenRecord {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub token_type: String,
    pub issued_at: Nanos,
    pub expires_at: Nanos,
}

impl TokenRecord {
    pub fn new(access_token: impl Into<String>, issued_at: Nanos, expires_at: Nanos) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: None,
            token_type: "Bearer".to_string(),
            issued_at,
            expires_at,
        }
    }

    #[inline]
    pub fn lifetime(&self) -> Nanos {
        (self.expires_at - self.issued_at).max(0)
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    token_type: Option<String>,
    /// Seconds; some endpoints send it as a string
    expires_in: serde_json::Value,
}

impl TokenResponse {
    fn expires_in_secs(&self) -> Option<u64> {
        match &self.expires_in {
            serde_json::Value::Number(n) => n.as_u64(),
            serde_json::Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

/// Parse a token endpoint body issued at `now`.
pub fn parse_token_response(body: &str, now: Nanos) -> Result<TokenRecord, String> {
    let parsed: TokenResponse =
        serde_json::from_str(body).map_err(|e| format!("invalid token response: {}", e))?;
    let expires_in = parsed
        .expires_in_secs()
        .ok_or_else(|| "token response has no usable expires_in".to_string())?;
    Ok(TokenRecord {
        expires_at: now.saturating_add(secs(expires_in)),
        issued_at: now,
        token_type: parsed.token_type.unwrap_or_else(|| "Bearer".to_string()),
        refresh_token: parsed.refresh_token,
        access_token: parsed.access_token,
    })
}

#[derive(Debug)]
pub struct TokenRenewalScheduler {
    credentials: Option<TokenCredentials>,
    token: Option<TokenRecord>,
    margin: Nanos,
    reissue_ratio: Option<f64>,
    attempt_limit: u32,
    attempts: u32,
    backoff: BackoffCalculator,
    next_renewal: Option<Nanos>,
    in_flight: Option<RestRequestId>,
}

impl TokenRenewalScheduler {
    pub fn new(config: &TokenConfig) -> Self {
        let credentials = TokenCredentials::from_config(config);
        let next_renewal = credentials.as_ref().map(|_| Nanos::MIN);
        Self {
            credentials,
            token: None,
            margin: millis(config.renewal_margin_ms),
            reissue_ratio: config.reissue_ratio.filter(|r| *r > 0.0 && *r < 1.0),
            attempt_limit: config.attempt_limit.max(1),
            attempts: 0,
            backoff: BackoffCalculator::deterministic(config.retry_interval_ms, config.retry_max_ms),
            next_renewal,
            in_flight: None,
        }
    }

    pub fn token(&self) -> Option<&TokenRecord> {
        self.token.as_ref()
    }

    pub fn next_renewal(&self) -> Option<Nanos> {
        self.next_renewal
    }

    pub fn has_credentials(&self) -> bool {
        self.credentials.is_some()
    }

    #[inline]
    pub fn owns(&self, request_id: RestRequestId) -> bool {
        self.in_flight == Some(request_id)
    }

    /// Replace the token and re-arm relative to its expiry.
    pub fn install(&mut self, token: TokenRecord, now: Nanos) {
        let at = self.renewal_deadline(&token).max(now);
        debug!(
            expires_at = token.expires_at,
            renew_at = at,
            "token_installed"
        );
        self.token = Some(token);
        self.next_renewal = Some(at);
        self.attempts = 0;
        self.backoff.reset();
    }

    fn renewal_deadline(&self, token: &TokenRecord) -> Nanos {
        match self.reissue_ratio {
            Some(ratio) => token
                .issued_at
                .saturating_add((token.lifetime() as f64 * ratio) as Nanos),
            None => token.expires_at - self.margin,
        }
    }

    /// Produce a renewal request if one is due.
    pub fn poll(&mut self, now: Nanos, request_id: RestRequestId) -> Option<RestRequest> {
        if self.in_flight.is_some() {
            return None;
        }
        let due = self.next_renewal.filter(|at| now >= *at)?;
        self.next_renewal = None;

        let Some(credentials) = &self.credentials else {
            warn!(due, "token_renewal_due_without_credentials");
            return None;
        };

        let mut form = url::form_urlencoded::Serializer::new(String::new());
        match self.token.as_ref().and_then(|t| t.refresh_token.as_deref()) {
            Some(refresh) => {
                form.append_pair("grant_type", "refresh_token");
                form.append_pair("refresh_token", refresh);
            }
            None => {
                form.append_pair("grant_type", "client_credentials");
                form.append_pair("scope", &credentials.scope);
            }
        }
        form.append_pair("client_id", &credentials.client_id);
        if let Some(secret) = &credentials.client_secret {
            form.append_pair("client_secret", secret);
        }

        info!(
            request_id,
            attempt = self.attempts + 1,
            "token_renewal_started"
        );
        self.in_flight = Some(request_id);
        Some(
            RestRequest::post(
                request_id,
                RestPurpose::TokenRenewal,
                credentials.token_url.clone(),
                form.finish(),
            )
            .header("Content-Type", "application/x-www-form-urlencoded")
            .header("Accept", "application/json"),
        )
    }

    /// Consume the outcome of the in-flight renewal.
    pub fn on_response(
        &mut self,
        request_id: RestRequestId,
        result: Result<RestResponse, RestTransportError>,
        now: Nanos,
    ) -> Option<AuthTokenEvent> {
        if !self.owns(request_id) {
            return None;
        }
        self.in_flight = None;

        let outcome = match result {
            Ok(resp) if resp.is_success() => parse_token_response(&resp.body, now),
            Ok(resp) => Err(format!("token endpoint returned {}: {}", resp.status, resp.body)),
            Err(e) => Err(e.to_string()),
        };

        match outcome {
            Ok(token) => {
                let event = AuthTokenEvent::Renewed {
                    token_type: token.token_type.clone(),
                    expires_at: token.expires_at,
                };
                info!(expires_at = token.expires_at, "token_renewed");
                self.install(token, now);
                Some(event)
            }
            Err(reason) => Some(self.renewal_failed(reason, now)),
        }
    }

    fn renewal_failed(&mut self, reason: String, now: Nanos) -> AuthTokenEvent {
        self.attempts += 1;
        if self.attempts >= self.attempt_limit {
            warn!(attempts = self.attempts, reason = %reason, "token_renewal_failed");
            self.attempts = 0;
            self.backoff.reset();
            return AuthTokenEvent::Failed(WatchlistError::new(
                ErrorKind::AuthTokenFailure,
                format!("token renewal gave up: {}", reason),
            ));
        }
        let delay = self.backoff.next_backoff();
        let retry_at = now.saturating_add(millis(delay.as_millis() as u64));
        self.next_renewal = Some(retry_at);
        debug!(
            attempt = self.attempts,
            delay_ms = delay.as_millis() as u64,
            reason = %reason,
            "token_renewal_retry"
        );
        AuthTokenEvent::Retrying {
            attempt: self.attempts,
            retry_at,
            reason,
        }
    }
}
