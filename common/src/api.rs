use std::time::Duration;

use log::{debug, warn};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;

use crate::{
    config::ApiConfig,
    http::{form_encode, ParseError, Request, Response},
    platform::{Endpoint, Transport, TransportError},
    types::RemoteSample,
};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("connect failed: {0}")]
    ConnectFailure(String),
    #[error("no response within {0:?}")]
    ResponseTimeout(Duration),
    #[error("unexpected http status {0}")]
    UnexpectedStatus(u16),
    #[error("malformed response: {0}")]
    MalformedResponse(String),
    #[error("credential rejected with http status {0}")]
    CredentialExpired(u16),
}

impl ApiError {
    /// A rejected credential fails the same way on every attempt.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::CredentialExpired(_))
    }
}

impl From<TransportError> for ApiError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Timeout(after) => Self::ResponseTimeout(after),
            other => Self::ConnectFailure(other.to_string()),
        }
    }
}

impl From<ParseError> for ApiError {
    fn from(err: ParseError) -> Self {
        Self::MalformedResponse(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    /// Some servers do not rotate the refresh token; empty means keep the current one.
    #[serde(default)]
    pub refresh_token: String,
}

/// Client for the telemetry REST API and its token endpoint.
///
/// Every logical call is attempted at most `max_attempts` times and stops
/// at the first success. Nothing above this layer retries.
pub struct ApiClient<T> {
    transport: T,
    config: ApiConfig,
}

impl<T: Transport> ApiClient<T> {
    pub fn new(transport: T, mut config: ApiConfig) -> Self {
        config.sanitize();
        Self { transport, config }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Reads the latest stored value of a sensor.
    pub fn query(
        &mut self,
        access_token: &str,
        device_id: &str,
        sensor_id: &str,
    ) -> Result<RemoteSample, ApiError> {
        let endpoint = self.api_endpoint();
        let request = Request::get(
            &endpoint.host,
            format!(
                "/{}/telemetry/{device_id}/sensors/{sensor_id}/summaries?endDateLatest=true&type=latest",
                self.config.version
            ),
        )
        .bearer(access_token);
        let timeout = Duration::from_millis(self.config.query_timeout_ms);

        self.with_retry("query", |client| {
            let response = client.send(&endpoint, &request, timeout)?;
            parse_sample(&response)
        })
    }

    /// Writes a value to a channel. The response body is ignored.
    pub fn update(
        &mut self,
        access_token: &str,
        device_id: &str,
        channel: u8,
        value: f64,
        kind: &str,
        unit: &str,
    ) -> Result<(), ApiError> {
        let endpoint = self.api_endpoint();
        let body = json!({
            "channel": channel,
            "value": value,
            "Type": kind,
            "Unit": unit,
        });
        let request = Request::post(
            &endpoint.host,
            format!("/{}/things/{device_id}/cmd", self.config.version),
            "application/json",
            body.to_string().into_bytes(),
        )
        .bearer(access_token);
        let timeout = Duration::from_millis(self.config.update_timeout_ms);

        self.with_retry("update", |client| {
            client.send(&endpoint, &request, timeout).map(|_| ())
        })
    }

    /// Trades a refresh token for a new access token (and usually a new refresh token).
    pub fn exchange_refresh_token(
        &mut self,
        access_token: Option<&str>,
        refresh_token: &str,
    ) -> Result<TokenGrant, ApiError> {
        let endpoint = Endpoint::new(
            self.config.auth_host.clone(),
            self.config.auth_port,
            self.config.use_tls,
        );
        let body = format!(
            "grant_type=refresh_token&refresh_token={}",
            form_encode(refresh_token)
        );
        let mut request = Request::post(
            &endpoint.host,
            "/oauth/token",
            "application/x-www-form-urlencoded",
            body.into_bytes(),
        );
        if let Some(token) = access_token.filter(|token| !token.is_empty()) {
            request = request.bearer(token);
        }
        let timeout = Duration::from_millis(self.config.update_timeout_ms);

        self.with_retry("token exchange", |client| {
            let response = client.send(&endpoint, &request, timeout)?;
            let grant: TokenGrant = serde_json::from_slice(response.json_payload()?)
                .map_err(|err| ApiError::MalformedResponse(format!("token grant: {err}")))?;
            if grant.access_token.is_empty() {
                return Err(ApiError::MalformedResponse(
                    "token grant without access_token".to_string(),
                ));
            }
            Ok(grant)
        })
    }

    fn api_endpoint(&self) -> Endpoint {
        Endpoint::new(self.config.host.clone(), self.config.port, self.config.use_tls)
    }

    fn send(
        &mut self,
        endpoint: &Endpoint,
        request: &Request,
        timeout: Duration,
    ) -> Result<Response, ApiError> {
        let raw = self
            .transport
            .exchange(endpoint, &request.to_bytes(), timeout)?;
        let response = Response::parse(&raw)?;
        match response.status {
            200 => Ok(response),
            401 | 403 => Err(ApiError::CredentialExpired(response.status)),
            status => Err(ApiError::UnexpectedStatus(status)),
        }
    }

    fn with_retry<R>(
        &mut self,
        operation: &str,
        mut attempt: impl FnMut(&mut Self) -> Result<R, ApiError>,
    ) -> Result<R, ApiError> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt_no = 1;
        loop {
            match attempt(self) {
                Ok(value) => {
                    if attempt_no > 1 {
                        debug!("{operation} succeeded on attempt {attempt_no}");
                    }
                    return Ok(value);
                }
                Err(err) if err.is_retryable() && attempt_no < max_attempts => {
                    warn!("{operation} attempt {attempt_no}/{max_attempts} failed: {err}");
                    attempt_no += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

fn parse_sample(response: &Response) -> Result<RemoteSample, ApiError> {
    let payload: serde_json::Value = serde_json::from_slice(response.json_payload()?)
        .map_err(|err| ApiError::MalformedResponse(format!("sample json: {err}")))?;
    let sample = match payload {
        serde_json::Value::Array(items) => items
            .into_iter()
            .next()
            .ok_or_else(|| ApiError::MalformedResponse("empty sample list".to_string()))?,
        other => other,
    };
    serde_json::from_value(sample)
        .map_err(|err| ApiError::MalformedResponse(format!("sample fields: {err}")))
}
