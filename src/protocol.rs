//! # Control Protocol Codec
//!
//! Line-oriented codec for the control channel shared by client and server.
//! Every request is a single line holding a command word and an optional
//! payload; every response is a single line starting with `OK` or `ERROR`.
//! Elements containing whitespace are brace-quoted, so structured payloads
//! (option maps, session snapshots) survive the trip as ordinary list items:
//!
//! ```text
//! C→S  PORTS
//! S→C  OK {tcp 40125}
//! C→S  SOCONFIG {-buffering none -buffersize 65536}
//! S→C  OK
//! C→S  IOSIZE {-readsize 16384 -writesize 4096}
//! S→C  OK
//! C→S  FINISH {127.0.0.1 51000}
//! S→C  OK {Received 409600 Start 1722950400000000 End 1722950405000000 Socket {...}}
//! ```
//!
//! Decoding fails closed: an unknown command word or malformed payload is a
//! [`ProtocolError`], which the server answers with an `ERROR` line without
//! dropping the connection.

use crate::config::{IoSize, SocketOptions};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Errors produced while encoding or decoding control messages
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("empty command line")]
    EmptyCommand,

    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("malformed {command} payload: {detail}")]
    MalformedPayload { command: &'static str, detail: String },

    #[error("unbalanced braces in list: {0}")]
    UnbalancedBraces(String),

    #[error("unexpected response line: {0}")]
    UnexpectedResponse(String),
}

/// A request sent from client to server over the control channel
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Query the listening port per provider; first message on a new connection
    Ports,
    /// Replace the socket options applied to subsequently accepted data connections
    SoConfig(SocketOptions),
    /// Set the per-read chunk size and write size for subsequent data connections
    IoSize(IoSize),
    /// Retrieve the final statistics for the data session with this peer key
    Finish { addr: String, port: u16 },
}

impl Command {
    /// Encode the command as one wire line (without the trailing newline)
    pub fn encode(&self) -> String {
        match self {
            Command::Ports => "PORTS".to_string(),
            Command::SoConfig(options) => {
                encode_list(&["SOCONFIG".to_string(), options.to_wire()])
            }
            Command::IoSize(io) => encode_list(&["IOSIZE".to_string(), io.to_wire()]),
            Command::Finish { addr, port } => encode_list(&[
                "FINISH".to_string(),
                encode_list(&[addr.clone(), port.to_string()]),
            ]),
        }
    }

    /// Decode one wire line into a command, failing closed on unknown tags
    pub fn decode(line: &str) -> Result<Self, ProtocolError> {
        let items = parse_list(line)?;
        let (word, rest) = items.split_first().ok_or(ProtocolError::EmptyCommand)?;

        match word.as_str() {
            "PORTS" => {
                if !rest.is_empty() {
                    return Err(ProtocolError::MalformedPayload {
                        command: "PORTS",
                        detail: "unexpected payload".to_string(),
                    });
                }
                Ok(Command::Ports)
            }
            "SOCONFIG" => {
                let payload = expect_single(rest, "SOCONFIG")?;
                let options = SocketOptions::from_wire(payload).map_err(|detail| {
                    ProtocolError::MalformedPayload { command: "SOCONFIG", detail }
                })?;
                Ok(Command::SoConfig(options))
            }
            "IOSIZE" => {
                let payload = expect_single(rest, "IOSIZE")?;
                let io = IoSize::from_wire(payload)
                    .map_err(|detail| ProtocolError::MalformedPayload { command: "IOSIZE", detail })?;
                Ok(Command::IoSize(io))
            }
            "FINISH" => {
                let payload = expect_single(rest, "FINISH")?;
                let parts = parse_list(payload)?;
                if parts.len() != 2 {
                    return Err(ProtocolError::MalformedPayload {
                        command: "FINISH",
                        detail: format!("expected {{addr port}}, got {:?}", payload),
                    });
                }
                let port = parts[1].parse::<u16>().map_err(|_| ProtocolError::MalformedPayload {
                    command: "FINISH",
                    detail: format!("invalid port: {}", parts[1]),
                })?;
                Ok(Command::Finish { addr: parts[0].clone(), port })
            }
            other => Err(ProtocolError::UnknownCommand(other.to_string())),
        }
    }
}

fn expect_single<'a>(rest: &'a [String], command: &'static str) -> Result<&'a str, ProtocolError> {
    match rest {
        [payload] => Ok(payload),
        _ => Err(ProtocolError::MalformedPayload {
            command,
            detail: format!("expected exactly one payload element, got {}", rest.len()),
        }),
    }
}

/// A single-line response sent from server to client
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// Success, with zero or more payload elements
    Ok(Vec<String>),
    /// Failure description; the connection stays open
    Error(String),
}

impl Response {
    pub fn ok() -> Self {
        Response::Ok(Vec::new())
    }

    pub fn ok_with(payload: String) -> Self {
        Response::Ok(vec![payload])
    }

    pub fn error(message: impl Into<String>) -> Self {
        Response::Error(message.into())
    }

    /// Encode the response as one wire line (without the trailing newline)
    pub fn encode(&self) -> String {
        match self {
            Response::Ok(payload) => {
                let mut items = Vec::with_capacity(payload.len() + 1);
                items.push("OK".to_string());
                items.extend(payload.iter().cloned());
                encode_list(&items)
            }
            Response::Error(message) => {
                encode_list(&["ERROR".to_string(), sanitize_line(message)])
            }
        }
    }

    /// Decode one wire line into a response
    pub fn decode(line: &str) -> Result<Self, ProtocolError> {
        let items = parse_list(line)?;
        let (word, rest) = items
            .split_first()
            .ok_or_else(|| ProtocolError::UnexpectedResponse(line.to_string()))?;

        match word.as_str() {
            "OK" => Ok(Response::Ok(rest.to_vec())),
            "ERROR" => Ok(Response::Error(rest.join(" "))),
            _ => Err(ProtocolError::UnexpectedResponse(line.to_string())),
        }
    }
}

/// Final statistics for one data session, as carried in a `FINISH` response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    /// Total bytes received before end-of-stream
    pub received: u64,
    /// Accept timestamp, microseconds since the Unix epoch
    pub start_us: i64,
    /// End-of-stream (or error) timestamp, microseconds since the Unix epoch
    pub end_us: i64,
    /// Socket options that were applied to the data connection
    pub options: SocketOptions,
    /// Read error captured on the session, if any
    pub error: Option<String>,
}

impl SessionSnapshot {
    /// Encode as the `FINISH` response payload element
    pub fn to_wire(&self) -> String {
        let mut items = vec![
            "Received".to_string(),
            self.received.to_string(),
            "Start".to_string(),
            self.start_us.to_string(),
            "End".to_string(),
            self.end_us.to_string(),
            "Socket".to_string(),
            self.options.to_wire(),
        ];
        if let Some(ref error) = self.error {
            items.push("Error".to_string());
            items.push(sanitize_line(error));
        }
        encode_list(&items)
    }

    /// Decode the `FINISH` response payload element
    pub fn from_wire(payload: &str) -> Result<Self, String> {
        let map = parse_map(payload).map_err(|e| e.to_string())?;
        let field = |key: &str| {
            map.get(key)
                .ok_or_else(|| format!("missing {} field in session snapshot", key))
        };
        let int = |key: &str| -> Result<i64, String> {
            field(key)?
                .parse::<i64>()
                .map_err(|_| format!("invalid {} field: {}", key, map[key]))
        };

        Ok(SessionSnapshot {
            received: int("Received")? as u64,
            start_us: int("Start")?,
            end_us: int("End")?,
            options: SocketOptions::from_wire(field("Socket")?)?,
            error: map.get("Error").cloned(),
        })
    }
}

impl fmt::Display for SessionSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} bytes received", self.received)?;
        if let Some(ref error) = self.error {
            write!(f, " (error: {})", error)?;
        }
        Ok(())
    }
}

/// Encode a provider→port table as a wire map element
pub fn encode_ports(ports: &BTreeMap<String, u16>) -> String {
    let mut items = Vec::with_capacity(ports.len() * 2);
    for (name, port) in ports {
        items.push(name.clone());
        items.push(port.to_string());
    }
    encode_list(&items)
}

/// Decode a provider→port table from a wire map element
pub fn decode_ports(payload: &str) -> Result<BTreeMap<String, u16>, ProtocolError> {
    let map = parse_map(payload)?;
    let mut ports = BTreeMap::new();
    for (name, value) in map {
        let port = value.parse::<u16>().map_err(|_| ProtocolError::MalformedPayload {
            command: "PORTS",
            detail: format!("invalid port for provider {}: {}", name, value),
        })?;
        ports.insert(name, port);
    }
    Ok(ports)
}

/// Strip newlines so a free-form message stays a single wire line
pub fn sanitize_line(message: &str) -> String {
    message.replace(['\r', '\n'], " ").trim().to_string()
}

/// Join list items into one line, brace-quoting items that need it
pub fn encode_list(items: &[String]) -> String {
    let mut line = String::new();
    for item in items {
        if !line.is_empty() {
            line.push(' ');
        }
        line.push_str(&quote(item));
    }
    line
}

fn quote(item: &str) -> String {
    let needs_quoting = item.is_empty()
        || item
            .chars()
            .any(|c| c.is_whitespace() || c == '{' || c == '}' || c == '\\');
    if !needs_quoting {
        return item.to_string();
    }

    if braces_balanced(item) {
        format!("{{{}}}", item)
    } else {
        // Stray brace inside the item: fall back to backslash escaping
        let mut escaped = String::with_capacity(item.len() + 8);
        for c in item.chars() {
            match c {
                '{' | '}' | '\\' | ' ' | '\t' => {
                    escaped.push('\\');
                    escaped.push(c);
                }
                other => escaped.push(other),
            }
        }
        escaped
    }
}

fn braces_balanced(item: &str) -> bool {
    let mut depth: i32 = 0;
    for c in item.chars() {
        match c {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth < 0 {
                    return false;
                }
            }
            _ => {}
        }
    }
    depth == 0
}

/// Split one line into list items, honoring brace quoting and backslash escapes
pub fn parse_list(line: &str) -> Result<Vec<String>, ProtocolError> {
    let mut items = Vec::new();
    let mut chars = line.chars().peekable();

    loop {
        while matches!(chars.peek(), Some(c) if c.is_whitespace()) {
            chars.next();
        }
        let Some(&first) = chars.peek() else {
            break;
        };

        if first == '{' {
            chars.next();
            let mut depth = 1;
            let mut item = String::new();
            loop {
                match chars.next() {
                    Some('{') => {
                        depth += 1;
                        item.push('{');
                    }
                    Some('}') => {
                        depth -= 1;
                        if depth == 0 {
                            break;
                        }
                        item.push('}');
                    }
                    Some(c) => item.push(c),
                    None => return Err(ProtocolError::UnbalancedBraces(line.to_string())),
                }
            }
            items.push(item);
        } else {
            let mut item = String::new();
            while let Some(&c) = chars.peek() {
                if c.is_whitespace() {
                    break;
                }
                chars.next();
                if c == '\\' {
                    match chars.next() {
                        Some(escaped) => item.push(escaped),
                        None => return Err(ProtocolError::UnbalancedBraces(line.to_string())),
                    }
                } else if c == '}' {
                    return Err(ProtocolError::UnbalancedBraces(line.to_string()));
                } else {
                    item.push(c);
                }
            }
            items.push(item);
        }
    }

    Ok(items)
}

/// Parse a wire map element (alternating keys and values) into an ordered map
pub fn parse_map(payload: &str) -> Result<BTreeMap<String, String>, ProtocolError> {
    let items = parse_list(payload)?;
    if items.len() % 2 != 0 {
        return Err(ProtocolError::MalformedPayload {
            command: "map",
            detail: format!("odd number of elements: {}", items.len()),
        });
    }
    let mut map = BTreeMap::new();
    for pair in items.chunks(2) {
        map.insert(pair[0].clone(), pair[1].clone());
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_round_trip() {
        let items = vec![
            "plain".to_string(),
            "with space".to_string(),
            "".to_string(),
            "{nested map}".to_string(),
        ];
        let line = encode_list(&items);
        assert_eq!(parse_list(&line).unwrap(), items);
    }

    #[test]
    fn test_list_stray_brace_escaped() {
        let items = vec!["odd}brace".to_string()];
        let line = encode_list(&items);
        assert_eq!(parse_list(&line).unwrap(), items);
    }

    #[test]
    fn test_parse_list_unbalanced() {
        assert!(parse_list("FINISH {127.0.0.1 51000").is_err());
        assert!(parse_list("stray } brace").is_err());
    }

    #[test]
    fn test_command_round_trip() {
        let mut options = SocketOptions::new();
        options.set("-buffering", "none");
        options.set("-buffersize", "65536");

        let commands = vec![
            Command::Ports,
            Command::SoConfig(options),
            Command::IoSize(IoSize { read_size: 16384, write_size: 4096 }),
            Command::Finish { addr: "127.0.0.1".to_string(), port: 51000 },
        ];
        for command in commands {
            let line = command.encode();
            assert_eq!(Command::decode(&line).unwrap(), command, "line: {}", line);
        }
    }

    #[test]
    fn test_unknown_command_fails_closed() {
        match Command::decode("HELLO world") {
            Err(ProtocolError::UnknownCommand(word)) => assert_eq!(word, "HELLO"),
            other => panic!("expected UnknownCommand, got {:?}", other),
        }
    }

    #[test]
    fn test_empty_command() {
        assert!(matches!(Command::decode(""), Err(ProtocolError::EmptyCommand)));
        assert!(matches!(Command::decode("   "), Err(ProtocolError::EmptyCommand)));
    }

    #[test]
    fn test_malformed_finish_payload() {
        assert!(Command::decode("FINISH {127.0.0.1}").is_err());
        assert!(Command::decode("FINISH {127.0.0.1 notaport}").is_err());
        assert!(Command::decode("FINISH").is_err());
    }

    #[test]
    fn test_response_round_trip() {
        let ok = Response::ok_with("tcp 40125".to_string());
        assert_eq!(Response::decode(&ok.encode()).unwrap(), ok);

        let bare = Response::ok();
        assert_eq!(Response::decode(&bare.encode()).unwrap(), bare);

        let error = Response::error("Unknown client: 10.0.0.1/51000");
        let line = error.encode();
        assert_eq!(line, "ERROR {Unknown client: 10.0.0.1/51000}");
        assert_eq!(Response::decode(&line).unwrap(), error);
    }

    #[test]
    fn test_error_response_sanitized() {
        let error = Response::error("broken\npipe");
        assert!(!error.encode().contains('\n'));
    }

    #[test]
    fn test_ports_round_trip() {
        let mut ports = BTreeMap::new();
        ports.insert("tcp".to_string(), 40125u16);
        ports.insert("iocp".to_string(), 0u16);
        let payload = encode_ports(&ports);
        assert_eq!(decode_ports(&payload).unwrap(), ports);
    }

    #[test]
    fn test_session_snapshot_round_trip() {
        let mut options = SocketOptions::new();
        options.set("-translation", "binary");

        let snapshot = SessionSnapshot {
            received: 409600,
            start_us: 1_722_950_400_000_000,
            end_us: 1_722_950_405_000_000,
            options,
            error: None,
        };
        let decoded = SessionSnapshot::from_wire(&snapshot.to_wire()).unwrap();
        assert_eq!(decoded, snapshot);
    }

    #[test]
    fn test_session_snapshot_with_error() {
        let snapshot = SessionSnapshot {
            received: 1024,
            start_us: 1,
            end_us: 2,
            options: SocketOptions::new(),
            error: Some("connection reset by peer".to_string()),
        };
        let decoded = SessionSnapshot::from_wire(&snapshot.to_wire()).unwrap();
        assert_eq!(decoded.error.as_deref(), Some("connection reset by peer"));
    }
}
