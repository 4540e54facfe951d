//! NATS text protocol framing
//!
//! Client operations are encoded as complete frames. Server operations are
//! parsed one control line at a time; a `MSG` line announces a payload of
//! known size that the caller reads separately.

use crate::{NatsError, Result};
use serde::{Deserialize, Serialize};

pub const CRLF: &str = "\r\n";

/// Body of the `CONNECT` operation
#[derive(Clone, Debug, Default, Serialize)]
pub struct ConnectInfo {
    pub verbose: bool,
    pub pedantic: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pass: Option<String>,
    pub name: String,
    pub lang: String,
    pub version: String,
    pub protocol: u8,
}

/// Payload limit assumed when the server does not announce one
pub const DEFAULT_MAX_PAYLOAD: usize = 1024 * 1024;

/// Body of the server's `INFO` operation; only the fields the client uses
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ServerInfo {
    #[serde(default)]
    pub server_id: String,
    #[serde(default)]
    pub max_payload: Option<usize>,
}

impl ServerInfo {
    pub fn max_payload(&self) -> usize {
        self.max_payload
            .filter(|max| *max > 0)
            .unwrap_or(DEFAULT_MAX_PAYLOAD)
    }
}

pub fn parse_info(body: &str) -> Result<ServerInfo> {
    serde_json::from_str(body).map_err(|e| NatsError::Protocol(format!("invalid INFO: {}", e)))
}

/// A server control line
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ServerOp {
    Info(String),
    Msg {
        subject: String,
        sid: u64,
        reply_to: Option<String>,
        size: usize,
    },
    Ping,
    Pong,
    Ok,
    Err(String),
}

pub fn encode_connect(info: &ConnectInfo) -> Result<Vec<u8>> {
    let body = serde_json::to_string(info).map_err(|e| NatsError::Protocol(e.to_string()))?;
    Ok(format!("CONNECT {}{}", body, CRLF).into_bytes())
}

pub fn encode_pub(subject: &str, reply_to: Option<&str>, payload: &[u8]) -> Result<Vec<u8>> {
    validate_subject(subject)?;
    let mut frame = match reply_to {
        Some(reply_to) => {
            validate_subject(reply_to)?;
            format!("PUB {} {} {}{}", subject, reply_to, payload.len(), CRLF)
        }
        None => format!("PUB {} {}{}", subject, payload.len(), CRLF),
    }
    .into_bytes();
    frame.extend_from_slice(payload);
    frame.extend_from_slice(CRLF.as_bytes());
    Ok(frame)
}

pub fn encode_sub(subject: &str, sid: u64) -> Result<Vec<u8>> {
    validate_subject(subject)?;
    Ok(format!("SUB {} {}{}", subject, sid, CRLF).into_bytes())
}

pub fn encode_unsub(sid: u64) -> Vec<u8> {
    format!("UNSUB {}{}", sid, CRLF).into_bytes()
}

pub fn encode_ping() -> Vec<u8> {
    format!("PING{}", CRLF).into_bytes()
}

pub fn encode_pong() -> Vec<u8> {
    format!("PONG{}", CRLF).into_bytes()
}

fn validate_subject(subject: &str) -> Result<()> {
    if subject.is_empty() || subject.chars().any(char::is_whitespace) {
        return Err(NatsError::InvalidSubject(subject.to_string()));
    }
    Ok(())
}

/// Parse one control line, without its trailing CRLF
pub fn parse_server_op(line: &str) -> Result<ServerOp> {
    let line = line.trim_end_matches(['\r', '\n']);
    let (op, rest) = match line.split_once(' ') {
        Some((op, rest)) => (op, rest.trim()),
        None => (line, ""),
    };

    match op.to_ascii_uppercase().as_str() {
        "INFO" => Ok(ServerOp::Info(rest.to_string())),
        "PING" => Ok(ServerOp::Ping),
        "PONG" => Ok(ServerOp::Pong),
        "+OK" => Ok(ServerOp::Ok),
        "-ERR" => Ok(ServerOp::Err(rest.trim_matches('\'').to_string())),
        "MSG" => parse_msg_args(rest),
        _ => Err(NatsError::Protocol(format!("unknown operation: {}", line))),
    }
}

fn parse_msg_args(args: &str) -> Result<ServerOp> {
    let parts: Vec<&str> = args.split_whitespace().collect();
    let (subject, sid, reply_to, size) = match parts.as_slice() {
        [subject, sid, size] => (subject, sid, None, size),
        [subject, sid, reply_to, size] => (subject, sid, Some(reply_to.to_string()), size),
        _ => return Err(NatsError::Protocol(format!("malformed MSG: {}", args))),
    };

    let sid = sid
        .parse()
        .map_err(|_| NatsError::Protocol(format!("invalid sid in MSG: {}", args)))?;
    let size = size
        .parse()
        .map_err(|_| NatsError::Protocol(format!("invalid size in MSG: {}", args)))?;

    Ok(ServerOp::Msg {
        subject: subject.to_string(),
        sid,
        reply_to,
        size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_pub() {
        let frame = encode_pub("router.register", None, b"{}").expect("frame");
        assert_eq!(frame, b"PUB router.register 2\r\n{}\r\n");

        let frame = encode_pub("router.greet", Some("_INBOX.abc"), b"").expect("frame");
        assert_eq!(frame, b"PUB router.greet _INBOX.abc 0\r\n\r\n");
    }

    #[test]
    fn test_encode_rejects_bad_subjects() {
        assert!(encode_pub("", None, b"").is_err());
        assert!(encode_sub("router start", 1).is_err());
    }

    #[test]
    fn test_encode_sub_and_unsub() {
        assert_eq!(encode_sub("router.start", 7).expect("frame"), b"SUB router.start 7\r\n");
        assert_eq!(encode_unsub(7), b"UNSUB 7\r\n");
    }

    #[test]
    fn test_encode_connect_omits_missing_credentials() {
        let info = ConnectInfo {
            name: "route-emitter".to_string(),
            lang: "rust".to_string(),
            version: "0.1.0".to_string(),
            protocol: 1,
            ..Default::default()
        };
        let frame = String::from_utf8(encode_connect(&info).expect("frame")).expect("utf8");
        assert!(frame.starts_with("CONNECT {"));
        assert!(frame.ends_with("}\r\n"));
        assert!(!frame.contains("\"user\""));
    }

    #[test]
    fn test_parse_control_lines() {
        assert_eq!(parse_server_op("PING\r\n").expect("op"), ServerOp::Ping);
        assert_eq!(parse_server_op("pong").expect("op"), ServerOp::Pong);
        assert_eq!(parse_server_op("+OK").expect("op"), ServerOp::Ok);
        assert_eq!(
            parse_server_op("-ERR 'Authorization Violation'").expect("op"),
            ServerOp::Err("Authorization Violation".to_string())
        );
        assert_eq!(
            parse_server_op("INFO {\"server_id\":\"x\"}").expect("op"),
            ServerOp::Info("{\"server_id\":\"x\"}".to_string())
        );
    }

    #[test]
    fn test_parse_msg() {
        assert_eq!(
            parse_server_op("MSG router.start 3 42").expect("op"),
            ServerOp::Msg {
                subject: "router.start".to_string(),
                sid: 3,
                reply_to: None,
                size: 42,
            }
        );
        assert_eq!(
            parse_server_op("MSG _INBOX.abc 4 reply.here 0").expect("op"),
            ServerOp::Msg {
                subject: "_INBOX.abc".to_string(),
                sid: 4,
                reply_to: Some("reply.here".to_string()),
                size: 0,
            }
        );
        assert!(parse_server_op("MSG router.start x 1").is_err());
        assert!(parse_server_op("MSG router.start").is_err());
        assert!(parse_server_op("HELLO").is_err());
    }

    #[test]
    fn test_parse_info_max_payload() {
        let info = parse_info(r#"{"server_id":"x","max_payload":4096,"proto":1}"#).expect("info");
        assert_eq!(info.server_id, "x");
        assert_eq!(info.max_payload(), 4096);

        let info = parse_info("{}").expect("info");
        assert_eq!(info.max_payload(), DEFAULT_MAX_PAYLOAD);

        assert!(parse_info("not json").is_err());
    }
}
