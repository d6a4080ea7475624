//! # Test Configuration
//!
//! Configuration types for one benchmark iteration: the socket option map
//! shared verbatim with the server, the read/write sizes, the payload shape,
//! and the transfer limit (buffer count or wall-clock window). A
//! [`TestConfig`] is built once by merging command-line defaults with either
//! explicit arguments or a batch-script line, and is immutable once a run
//! starts.

use crate::protocol::{encode_list, parse_map};
use anyhow::{anyhow, bail, Result};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Largest permitted write size per buffer (bytes)
pub const MAX_WRITE_SIZE: u32 = 1_000_000_000;

/// Largest permitted server-side read chunk (bytes)
pub const MAX_READ_SIZE: u32 = 2_147_483_647;

/// Socket option map applied identically on both ends of a data connection
///
/// Options are stored verbatim under their dashed names (`-buffering`,
/// `-buffersize`, `-encoding`, `-translation`, `-eofchar`, plus any
/// backend-specific tuning keys) so the map survives the wire round trip
/// unchanged. Once sent for a configuration, the same options apply to every
/// data connection opened under it until replaced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocketOptions(BTreeMap<String, String>);

impl SocketOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Whether the options request a binary-safe transfer
    pub fn wants_binary(&self) -> bool {
        self.get("-translation").map_or(false, |t| t.contains("binary"))
            || self.get("-encoding") == Some("binary")
    }

    /// Reject option combinations that cannot be applied coherently
    ///
    /// `-translation binary` implies a byte-exact channel; pairing it with a
    /// character encoding other than `binary` is contradictory and is refused
    /// before any connection is attempted.
    pub fn validate(&self) -> Result<()> {
        if let Some(translation) = self.get("-translation") {
            if translation.contains("binary") {
                if let Some(encoding) = self.get("-encoding") {
                    if encoding != "binary" {
                        bail!(
                            "-translation binary is incompatible with -encoding {}",
                            encoding
                        );
                    }
                }
            }
        }
        if let Some(size) = self.get("-buffersize") {
            size.parse::<u32>()
                .map_err(|_| anyhow!("invalid -buffersize: {}", size))?;
        }
        Ok(())
    }

    /// Encode as a wire map element (`-name value ...`)
    pub fn to_wire(&self) -> String {
        let mut items = Vec::with_capacity(self.0.len() * 2);
        for (name, value) in &self.0 {
            items.push(name.clone());
            items.push(value.clone());
        }
        encode_list(&items)
    }

    /// Decode from a wire map element
    pub fn from_wire(payload: &str) -> std::result::Result<Self, String> {
        let map = parse_map(payload).map_err(|e| e.to_string())?;
        Ok(Self(map))
    }
}

/// Read/write chunk sizes for one configuration
///
/// `write_size` drives the client payload buffer; `read_size` drives the
/// server's per-read chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoSize {
    pub read_size: u32,
    pub write_size: u32,
}

impl Default for IoSize {
    fn default() -> Self {
        Self {
            read_size: crate::defaults::READ_SIZE,
            write_size: crate::defaults::WRITE_SIZE,
        }
    }
}

impl IoSize {
    pub fn validate(&self) -> Result<()> {
        if self.write_size == 0 || self.write_size > MAX_WRITE_SIZE {
            bail!(
                "write size must be between 1 and {}, got {}",
                MAX_WRITE_SIZE,
                self.write_size
            );
        }
        if self.read_size == 0 || self.read_size > MAX_READ_SIZE {
            bail!(
                "read size must be between 1 and {}, got {}",
                MAX_READ_SIZE,
                self.read_size
            );
        }
        Ok(())
    }

    pub fn to_wire(&self) -> String {
        encode_list(&[
            "-readsize".to_string(),
            self.read_size.to_string(),
            "-writesize".to_string(),
            self.write_size.to_string(),
        ])
    }

    pub fn from_wire(payload: &str) -> std::result::Result<Self, String> {
        let map = parse_map(payload).map_err(|e| e.to_string())?;
        let size = |key: &str| -> std::result::Result<u32, String> {
            let value = map
                .get(key)
                .ok_or_else(|| format!("missing {} field", key))?;
            value
                .parse::<u32>()
                .map_err(|_| format!("invalid {} value: {}", key, value))
        };
        let io = Self { read_size: size("-readsize")?, write_size: size("-writesize")? };
        io.validate().map_err(|e| e.to_string())?;
        Ok(io)
    }
}

/// Shape of the transferred payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
pub enum PayloadKind {
    /// Repeating printable text with line breaks
    #[clap(name = "text")]
    Text,
    /// Repeating full byte-value cycle
    #[clap(name = "binary")]
    Binary,
}

impl fmt::Display for PayloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PayloadKind::Text => write!(f, "text"),
            PayloadKind::Binary => write!(f, "binary"),
        }
    }
}

/// How the write loop is driven
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferMode {
    /// Straight write loop; no yielding between buffers
    Blocking,
    /// Writable-readiness events gate each buffer write
    EventDriven,
}

impl fmt::Display for TransferMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferMode::Blocking => write!(f, "blocking"),
            TransferMode::EventDriven => write!(f, "event-driven"),
        }
    }
}

/// Stop condition for the transfer loop; exactly one applies per run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferLimit {
    /// Write exactly this many buffers
    Count(u64),
    /// Write until this much wall-clock time has elapsed (soft deadline)
    Elapsed(Duration),
}

impl fmt::Display for TransferLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferLimit::Count(count) => write!(f, "{} buffers", count),
            TransferLimit::Elapsed(duration) => write!(f, "{:?}", duration),
        }
    }
}

/// Full parameter set for one benchmark iteration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestConfig {
    /// Provider used for the client side of the data connection
    pub provider: String,

    /// Provider expected on the server side; defaults to `provider`
    pub remote_provider: Option<String>,

    /// Socket options shared verbatim with the server
    pub options: SocketOptions,

    /// Read/write chunk sizes
    pub io: IoSize,

    /// Explicit payload shape; `None` means infer from the socket options
    pub payload: Option<PayloadKind>,

    /// Buffer count or wall-clock window
    pub limit: TransferLimit,

    /// Blocking or event-driven write loop
    pub mode: TransferMode,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            provider: crate::defaults::PROVIDER.to_string(),
            remote_provider: None,
            options: SocketOptions::new(),
            io: IoSize::default(),
            payload: None,
            limit: TransferLimit::Elapsed(crate::defaults::DURATION),
            mode: TransferMode::Blocking,
        }
    }
}

impl TestConfig {
    /// Check all parameters before any I/O is attempted
    pub fn validate(&self) -> Result<()> {
        self.io.validate()?;
        self.options.validate()?;
        Ok(())
    }

    /// Provider name expected on the server end
    pub fn remote_provider_name(&self) -> &str {
        self.remote_provider.as_deref().unwrap_or(&self.provider)
    }

    /// Payload shape: explicit choice, else binary when the socket options
    /// request binary-safe transfer, else text
    pub fn resolved_payload(&self) -> PayloadKind {
        self.payload.unwrap_or({
            if self.options.wants_binary() {
                PayloadKind::Binary
            } else {
                PayloadKind::Text
            }
        })
    }

    /// Merge a tokenized option line over this configuration; the line wins
    ///
    /// Recognized driver keys are consumed; any other `-name value` pair is
    /// stored verbatim in the socket options. Returns the repeat count for
    /// the merged configuration (default 1).
    pub fn apply_overrides(&mut self, tokens: &[String]) -> Result<u32> {
        let mut repeat: u32 = 1;
        let mut line_count = false;
        let mut line_elapsed = false;

        let mut iter = tokens.iter();
        while let Some(name) = iter.next() {
            if !name.starts_with('-') {
                bail!("expected an option starting with '-', got {:?}", name);
            }
            let value = iter
                .next()
                .ok_or_else(|| anyhow!("option {} is missing a value", name))?;

            match name.as_str() {
                "-provider" => self.provider = value.clone(),
                "-remoteprovider" => self.remote_provider = Some(value.clone()),
                "-writesize" => {
                    self.io.write_size = value
                        .parse()
                        .map_err(|_| anyhow!("invalid -writesize: {}", value))?;
                }
                "-readsize" => {
                    self.io.read_size = value
                        .parse()
                        .map_err(|_| anyhow!("invalid -readsize: {}", value))?;
                }
                "-writecount" => {
                    let count: u64 = value
                        .parse()
                        .map_err(|_| anyhow!("invalid -writecount: {}", value))?;
                    self.limit = TransferLimit::Count(count);
                    line_count = true;
                }
                "-seconds" => {
                    let seconds: f64 = value
                        .parse()
                        .map_err(|_| anyhow!("invalid -seconds: {}", value))?;
                    if seconds <= 0.0 {
                        bail!("-seconds must be positive, got {}", value);
                    }
                    self.limit = TransferLimit::Elapsed(Duration::from_secs_f64(seconds));
                    line_elapsed = true;
                }
                "-payload" => {
                    self.payload = Some(match value.as_str() {
                        "text" => PayloadKind::Text,
                        "binary" => PayloadKind::Binary,
                        other => bail!("invalid -payload: {} (expected text or binary)", other),
                    });
                }
                "-nonblocking" => {
                    self.mode = if value == "0" {
                        TransferMode::Blocking
                    } else {
                        TransferMode::EventDriven
                    };
                }
                "-repeat" => {
                    repeat = value
                        .parse()
                        .map_err(|_| anyhow!("invalid -repeat: {}", value))?;
                    if repeat == 0 {
                        bail!("-repeat must be at least 1");
                    }
                }
                _ => self.options.set(name.clone(), value.clone()),
            }
        }

        if line_count && line_elapsed {
            bail!("-writecount and -seconds are mutually exclusive");
        }
        Ok(repeat)
    }
}
