//! HTTP control bridge for erasers that are driven by a small web server instead of the
//! broker. No liveness check is possible here, a call is fire-and-hope.

use std::time::Duration;

use reqwest::header::{HeaderValue, CONTENT_TYPE};
use reqwest::{Client, Method, Request, StatusCode, Url};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{CommandResult, Verb};
use crate::error::{CommandError, CommandFailure};

const CONTROL_ROUTE: &str = "control";
const RUN_MOTOR_ROUTE: &str = "runMotor";

#[derive(Serialize)]
struct ControlRequest<'a> {
    action: &'a str,
}

#[derive(Deserialize)]
struct ControlResponse {
    status: Option<String>,
    message: Option<String>,
    error: Option<String>,
}

#[derive(Clone, Debug)]
pub struct HttpBridge {
    http: Client,
}

impl HttpBridge {
    pub fn new(timeout: Duration) -> Result<Self, CommandError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(CommandFailure::Http)?;
        Ok(Self { http })
    }

    /// `POST <endpoint>/control` with `{"action": "<verb>"}`
    pub async fn send_http_command(
        &self,
        endpoint: &str,
        verb: Verb,
    ) -> Result<CommandResult, CommandError> {
        let req = self.build_control_request(endpoint, verb)?;
        info!("Sending {} to {}", verb, req.url());
        self.execute(req).await
    }

    /// `GET <endpoint>/runMotor`, the older fixed-route bridge
    pub async fn run_motor(&self, endpoint: &str) -> Result<CommandResult, CommandError> {
        let req = self.build_run_motor_request(endpoint)?;
        info!("Triggering motor via {}", req.url());
        self.execute(req).await
    }

    pub fn build_control_request(
        &self,
        endpoint: &str,
        verb: Verb,
    ) -> Result<Request, CommandError> {
        let url = join_route(endpoint, CONTROL_ROUTE)?;
        let body = serde_json::to_vec(&ControlRequest {
            action: verb.as_str(),
        })
        .map_err(|e| CommandError::InvalidEndpoint {
            endpoint: endpoint.to_string(),
            reason: e.to_string(),
        })?;
        self.http
            .request(Method::POST, url)
            .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
            .body(body)
            .build()
            .map_err(|e| CommandFailure::Http(e).into())
    }

    pub fn build_run_motor_request(&self, endpoint: &str) -> Result<Request, CommandError> {
        let url = join_route(endpoint, RUN_MOTOR_ROUTE)?;
        self.http
            .request(Method::GET, url)
            .build()
            .map_err(|e| CommandFailure::Http(e).into())
    }

    async fn execute(&self, req: Request) -> Result<CommandResult, CommandError> {
        let resp = self.http.execute(req).await.map_err(CommandFailure::Http)?;
        let status = resp.status();
        let body = resp.text().await.map_err(CommandFailure::Http)?;
        let parsed = parse_control_response(status, &body);
        if let Err(e) = &parsed {
            warn!("HTTP bridge call failed: {}", e);
        }
        parsed
    }
}

fn join_route(endpoint: &str, route: &str) -> Result<Url, CommandError> {
    let invalid = |reason: String| CommandError::InvalidEndpoint {
        endpoint: endpoint.to_string(),
        reason,
    };
    let mut base = Url::parse(endpoint.trim()).map_err(|e| invalid(e.to_string()))?;
    if !matches!(base.scheme(), "http" | "https") {
        return Err(invalid(format!("unsupported scheme '{}'", base.scheme())));
    }
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path().trim_end_matches('/'));
        base.set_path(&path);
    }
    base.join(route).map_err(|e| invalid(e.to_string()))
}

/// Maps a bridge answer to a result. Non-2xx is always a failure.
pub fn parse_control_response(
    status: StatusCode,
    body: &str,
) -> Result<CommandResult, CommandError> {
    let parsed: Option<ControlResponse> = serde_json::from_str(body).ok();

    if !status.is_success() {
        let message = parsed
            .and_then(|r| r.message.or(r.error))
            .unwrap_or_else(|| body.trim().to_string());
        return Err(CommandFailure::HttpStatus {
            status: status.as_u16(),
            message,
        }
        .into());
    }

    Ok(match parsed {
        Some(r) => CommandResult {
            success: Some(r.status.as_deref() == Some("success")),
            message: r.message.or(r.error).unwrap_or_default(),
        },
        None => CommandResult {
            success: Some(true),
            message: body.trim().to_string(),
        },
    })
}
