//! Topic naming and routing.
//!
//! Every device owns a small family of topics, `eraser_<id>/<channel>`. [`route`] turns a
//! raw broker message into a typed [`RelayEvent`]; anything that does not match the pattern
//! is dropped without error.

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use tracing::{debug, trace};

use super::message::RawMessage;
use crate::device::DeviceId;
use crate::error::MalformedResponse;
use crate::gateway::CommandResult;

pub const TOPIC_PREFIX: &str = "eraser_";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Channel {
    Status,
    Session,
    Command,
    Response,
    Logs,
}

impl Channel {
    /// Channels the devices publish on
    pub const TELEMETRY: [Channel; 4] = [
        Channel::Status,
        Channel::Session,
        Channel::Response,
        Channel::Logs,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Status => "status",
            Channel::Session => "session",
            Channel::Command => "command",
            Channel::Response => "response",
            Channel::Logs => "logs",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "status" => Ok(Channel::Status),
            "session" => Ok(Channel::Session),
            "command" => Ok(Channel::Command),
            "response" => Ok(Channel::Response),
            "logs" => Ok(Channel::Logs),
            _ => Err(()),
        }
    }
}

pub fn topic_for(device: &DeviceId, channel: Channel) -> String {
    format!("{TOPIC_PREFIX}{device}/{channel}")
}

/// Splits `eraser_<id>/<channel>` into its parts
pub fn parse_topic(topic: &str) -> Option<(DeviceId, Channel)> {
    let rest = topic.strip_prefix(TOPIC_PREFIX)?;
    let (id, channel) = rest.split_once('/')?;
    if id.is_empty() {
        return None;
    }
    let channel = channel.parse().ok()?;
    Some((DeviceId::new(id), channel))
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StatusReport {
    Online,
    Offline,
    Unrecognised(String),
}

impl StatusReport {
    pub fn parse(payload: &str) -> Self {
        match normalize(payload).as_str() {
            "online" => StatusReport::Online,
            "offline" => StatusReport::Offline,
            other => StatusReport::Unrecognised(other.to_string()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionReport {
    Active,
    Inactive,
    Unrecognised(String),
}

impl SessionReport {
    pub fn parse(payload: &str) -> Self {
        match normalize(payload).as_str() {
            "active" => SessionReport::Active,
            "not active" | "inactive" => SessionReport::Inactive,
            other => SessionReport::Unrecognised(other.to_string()),
        }
    }
}

fn normalize(payload: &str) -> String {
    payload.trim().to_lowercase()
}

#[derive(Deserialize)]
struct ResponsePayload {
    success: Option<bool>,
    message: Option<String>,
}

/// Decodes a `response` payload, expected to be `{"success": bool, "message": string}`
pub fn decode_response(payload: &str) -> Result<CommandResult, MalformedResponse> {
    match serde_json::from_str::<ResponsePayload>(payload.trim()) {
        Ok(ResponsePayload {
            success: None,
            message: None,
        }) => Err(MalformedResponse {
            raw: payload.to_string(),
            reason: "neither success nor message present".to_string(),
        }),
        Ok(body) => Ok(CommandResult {
            success: body.success,
            message: body.message.unwrap_or_default(),
        }),
        Err(e) => Err(MalformedResponse {
            raw: payload.to_string(),
            reason: e.to_string(),
        }),
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ChannelEvent {
    Status(StatusReport),
    Session(SessionReport),
    /// Our own command, echoed back by the broker
    CommandEcho(String),
    Response(CommandResult),
    Log(String),
}

#[derive(Clone, Debug, PartialEq)]
pub struct RelayEvent {
    pub device: DeviceId,
    pub kind: ChannelEvent,
}

/// Classifies a broker message. Returns `None` for topics outside the eraser namespace.
pub fn route(message: &RawMessage) -> Option<RelayEvent> {
    let Some((device, channel)) = parse_topic(message.topic()) else {
        trace!("Ignoring message on unknown topic {}", message.topic());
        return None;
    };
    let payload = message.payload();

    let kind = match channel {
        Channel::Status => ChannelEvent::Status(StatusReport::parse(payload)),
        Channel::Session => ChannelEvent::Session(SessionReport::parse(payload)),
        Channel::Command => ChannelEvent::CommandEcho(payload.trim().to_string()),
        Channel::Response => match decode_response(payload) {
            Ok(result) => ChannelEvent::Response(result),
            Err(malformed) => {
                debug!("Device {}: {}, keeping raw text", device, malformed);
                ChannelEvent::Response(malformed.into_fallback())
            }
        },
        Channel::Logs => ChannelEvent::Log(payload.to_string()),
    };
    Some(RelayEvent { device, kind })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn routed(topic: &str, payload: &str) -> Option<RelayEvent> {
        route(&RawMessage::new(topic, payload))
    }

    #[test]
    fn parses_known_topics() {
        assert_eq!(
            parse_topic("eraser_12/status"),
            Some((DeviceId::from("12"), Channel::Status))
        );
        assert_eq!(
            parse_topic("eraser_abc/logs"),
            Some((DeviceId::from("abc"), Channel::Logs))
        );
    }

    #[test]
    fn ignores_foreign_topics() {
        assert_eq!(parse_topic("test"), None);
        assert_eq!(parse_topic("eraser_/status"), None);
        assert_eq!(parse_topic("eraser_1/temperature"), None);
        assert_eq!(parse_topic("eraser_1/status/extra"), None);
        assert_eq!(parse_topic("board_1/status"), None);
        assert!(routed("sensors/kitchen", "21.5").is_none());
    }

    #[test]
    fn status_is_case_insensitive() {
        let event = routed("eraser_5/status", " Online ").unwrap();
        assert_eq!(event.device, DeviceId::from("5"));
        assert_eq!(event.kind, ChannelEvent::Status(StatusReport::Online));

        assert_eq!(StatusReport::parse("OFFLINE"), StatusReport::Offline);
        assert_eq!(
            StatusReport::parse("Booting"),
            StatusReport::Unrecognised("booting".to_string())
        );
    }

    #[test]
    fn session_values() {
        assert_eq!(SessionReport::parse("active"), SessionReport::Active);
        assert_eq!(SessionReport::parse("Not Active"), SessionReport::Inactive);
        assert_eq!(
            SessionReport::parse("paused"),
            SessionReport::Unrecognised("paused".to_string())
        );
    }

    #[test]
    fn json_response_is_decoded() {
        let event = routed(
            "eraser_3/response",
            r#"{"success": true, "message": "ok"}"#,
        )
        .unwrap();
        assert_eq!(
            event.kind,
            ChannelEvent::Response(CommandResult {
                success: Some(true),
                message: "ok".to_string()
            })
        );
    }

    #[test]
    fn json_without_known_fields_is_kept_raw() {
        let payload = r#"{"result":"captured"}"#;
        assert!(decode_response(payload).is_err());
        assert_eq!(
            decode_response(r#"{"success": false}"#).unwrap(),
            CommandResult {
                success: Some(false),
                message: String::new()
            }
        );

        let event = routed("eraser_3/response", payload).unwrap();
        assert_eq!(
            event.kind,
            ChannelEvent::Response(CommandResult {
                success: None,
                message: payload.to_string()
            })
        );
    }

    #[test]
    fn plain_text_response_falls_back_to_raw_message() {
        let err = decode_response("done").unwrap_err();
        assert_eq!(err.raw, "done");

        let event = routed("eraser_3/response", "done").unwrap();
        assert_eq!(
            event.kind,
            ChannelEvent::Response(CommandResult {
                success: None,
                message: "done".to_string()
            })
        );
    }

    #[test]
    fn command_echo_and_logs_are_passed_through() {
        assert_eq!(
            routed("eraser_8/command", "capture").unwrap().kind,
            ChannelEvent::CommandEcho("capture".to_string())
        );
        assert_eq!(
            routed("eraser_8/logs", "motor A: 200 steps").unwrap().kind,
            ChannelEvent::Log("motor A: 200 steps".to_string())
        );
    }
}
