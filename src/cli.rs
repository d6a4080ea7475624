//! Command-line interface parsing and conversion into test configurations.

use crate::config::{IoSize, PayloadKind, SocketOptions, TestConfig, TransferLimit, TransferMode};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

/// Network throughput benchmark harness
#[derive(Parser, Debug)]
#[clap(version, about, long_about = None)]
pub struct Args {
    #[clap(subcommand)]
    pub command: CliCommand,
}

#[derive(Subcommand, Debug)]
pub enum CliCommand {
    /// Run the benchmark server
    Serve(ServeArgs),
    /// Run a single benchmark against a server
    Run(ClientArgs),
    /// Replay a script of benchmark configurations over one connection
    Batch(BatchArgs),
}

#[derive(clap::Args, Debug)]
pub struct ServeArgs {
    /// Address to listen on
    #[clap(long, default_value = crate::defaults::HOST)]
    pub host: String,

    /// Control channel port (0 picks an ephemeral port)
    #[clap(short, long, default_value_t = crate::defaults::CONTROL_PORT)]
    pub port: u16,
}

#[derive(clap::Args, Debug, Clone)]
pub struct ClientArgs {
    /// Server host
    #[clap(long, default_value = crate::defaults::HOST)]
    pub host: String,

    /// Server control channel port
    #[clap(short, long, default_value_t = crate::defaults::CONTROL_PORT)]
    pub port: u16,

    /// Local socket provider for the data connection
    #[clap(long, default_value = crate::defaults::PROVIDER)]
    pub provider: String,

    /// Server-side provider (defaults to the local provider)
    #[clap(long)]
    pub remote_provider: Option<String>,

    /// Bytes per write buffer
    #[clap(long, default_value_t = crate::defaults::WRITE_SIZE)]
    pub write_size: u32,

    /// Server-side read chunk size in bytes
    #[clap(long, default_value_t = crate::defaults::READ_SIZE)]
    pub read_size: u32,

    /// Number of buffers to write (mutually exclusive with --seconds)
    #[clap(short = 'n', long, conflicts_with = "seconds")]
    pub count: Option<u64>,

    /// Wall-clock window to write for, e.g. "5s" or "500ms"
    #[clap(short, long, value_parser = parse_duration)]
    pub seconds: Option<Duration>,

    /// Payload shape (inferred from the socket options when omitted)
    #[clap(long, value_enum)]
    pub payload: Option<PayloadKind>,

    /// Drive writes from writable-readiness events instead of blocking
    #[clap(long, default_value_t = false)]
    pub nonblocking: bool,

    /// Buffering mode recorded in the socket options (none, line, full)
    #[clap(long)]
    pub buffering: Option<String>,

    /// Socket buffer size applied on both ends
    #[clap(long)]
    pub buffer_size: Option<u32>,

    /// Text encoding recorded in the socket options
    #[clap(long)]
    pub encoding: Option<String>,

    /// Line/translation mode recorded in the socket options
    #[clap(long)]
    pub translation: Option<String>,

    /// Additional socket option as name=value (repeatable)
    #[clap(long = "sockopt", value_parser = parse_sockopt)]
    pub sockopts: Vec<(String, String)>,

    /// Write all results to this JSON file
    #[clap(short, long)]
    pub output_file: Option<PathBuf>,

    /// Print the full detail block instead of a one-line summary
    #[clap(long, default_value_t = false)]
    pub detail: bool,
}

#[derive(clap::Args, Debug)]
pub struct BatchArgs {
    #[clap(flatten)]
    pub client: ClientArgs,

    /// Script file: one option line per run, `#` starts a comment
    #[clap(value_name = "SCRIPT")]
    pub script: PathBuf,
}

impl ClientArgs {
    /// Build the test configuration these arguments describe
    pub fn to_test_config(&self) -> TestConfig {
        let mut options = SocketOptions::new();
        if let Some(ref buffering) = self.buffering {
            options.set("-buffering", buffering);
        }
        if let Some(size) = self.buffer_size {
            options.set("-buffersize", size.to_string());
        }
        if let Some(ref encoding) = self.encoding {
            options.set("-encoding", encoding);
        }
        if let Some(ref translation) = self.translation {
            options.set("-translation", translation);
        }
        for (name, value) in &self.sockopts {
            options.set(format!("-{}", name.trim_start_matches('-')), value);
        }

        let limit = if let Some(count) = self.count {
            TransferLimit::Count(count)
        } else if let Some(window) = self.seconds {
            TransferLimit::Elapsed(window)
        } else {
            TransferLimit::Elapsed(crate::defaults::DURATION)
        };

        TestConfig {
            provider: self.provider.clone(),
            remote_provider: self.remote_provider.clone(),
            options,
            io: IoSize { read_size: self.read_size, write_size: self.write_size },
            payload: self.payload,
            limit,
            mode: if self.nonblocking {
                TransferMode::EventDriven
            } else {
                TransferMode::Blocking
            },
        }
    }
}

/// Parse duration from string (e.g. "10s", "5m", "500ms")
fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();

    if s.is_empty() {
        return Err("Duration cannot be empty".to_string());
    }

    let (num_str, unit) = if let Some(stripped) = s.strip_suffix("ms") {
        (stripped, "ms")
    } else if let Some(stripped) = s.strip_suffix('s') {
        (stripped, "s")
    } else if let Some(stripped) = s.strip_suffix('m') {
        (stripped, "m")
    } else if let Some(stripped) = s.strip_suffix('h') {
        (stripped, "h")
    } else {
        (s, "s") // Default to seconds
    };

    let num: f64 = num_str
        .parse()
        .map_err(|_| format!("Invalid number in duration: {}", num_str))?;

    let duration = match unit {
        "ms" => Duration::from_millis(num as u64),
        "s" => Duration::from_secs_f64(num),
        "m" => Duration::from_secs_f64(num * 60.0),
        "h" => Duration::from_secs_f64(num * 3600.0),
        _ => return Err(format!("Invalid duration unit: {}", unit)),
    };

    Ok(duration)
}

/// Parse a `name=value` socket option argument
fn parse_sockopt(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((name, value)) if !name.is_empty() => Ok((name.to_string(), value.to_string())),
        _ => Err(format!("expected name=value, got {:?}", s)),
    }
}
