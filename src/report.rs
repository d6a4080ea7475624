//! # Result Records and Reporting
//!
//! A [`ResultRecord`] is the externally visible outcome of one run: the
//! client half measured locally and the server half retrieved over the
//! control channel. Records are immutable once built; partial outcomes
//! (client succeeded, server reported an error) are represented rather
//! than discarded.
//!
//! Rendering comes in two shapes, a one-line summary and a detail block,
//! plus an optional JSON results file collecting every outcome of a run.

use crate::config::{IoSize, PayloadKind, SocketOptions, TestConfig, TransferLimit, TransferMode};
use crate::protocol::SessionSnapshot;
use crate::transfer::TransferStats;
use anyhow::Result;
use chrono::{DateTime, Utc};
use colored::Colorize;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tracing::info;

/// Client-side half of a result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientHalf {
    pub bytes_sent: u64,
    pub buffers_sent: u64,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub elapsed_us: u64,
    pub options: SocketOptions,
}

/// Server-side half of a result, from the `FINISH` snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerHalf {
    pub status: String,
    pub bytes_received: u64,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub options: SocketOptions,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Outcome of one benchmark run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultRecord {
    pub provider: String,
    pub remote_provider: String,
    pub payload: PayloadKind,
    pub mode: TransferMode,
    pub limit: TransferLimit,
    pub io: IoSize,
    pub client: ClientHalf,
    pub server: ServerHalf,
}

impl ResultRecord {
    pub fn new(
        config: &TestConfig,
        payload: PayloadKind,
        stats: TransferStats,
        snapshot: SessionSnapshot,
    ) -> Self {
        let status = if snapshot.error.is_none() { "ok" } else { "error" };
        Self {
            provider: config.provider.clone(),
            remote_provider: config.remote_provider_name().to_string(),
            payload,
            mode: config.mode,
            limit: config.limit,
            io: config.io,
            client: ClientHalf {
                bytes_sent: stats.bytes_sent,
                buffers_sent: stats.buffers_sent,
                start: stats.start,
                end: stats.end,
                elapsed_us: stats.elapsed.as_micros() as u64,
                options: config.options.clone(),
            },
            server: ServerHalf {
                status: status.to_string(),
                bytes_received: snapshot.received,
                start: timestamp(snapshot.start_us),
                end: timestamp(snapshot.end_us),
                options: snapshot.options,
                error: snapshot.error,
            },
        }
    }

    /// Whether the server half completed without an error
    pub fn server_ok(&self) -> bool {
        self.server.error.is_none()
    }

    /// Client-side throughput in megabytes per second
    pub fn throughput_mbps(&self) -> f64 {
        if self.client.elapsed_us == 0 {
            return 0.0;
        }
        (self.client.bytes_sent as f64) / (self.client.elapsed_us as f64 / 1e6) / 1_000_000.0
    }
}

fn timestamp(micros: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(micros).unwrap_or_default()
}

/// One-line rendering of a completed run
pub fn summary_line(record: &ResultRecord) -> String {
    let provider = if record.provider == record.remote_provider {
        record.provider.clone()
    } else {
        format!("{}->{}", record.provider, record.remote_provider)
    };
    let status = if record.server_ok() {
        record.server.status.green()
    } else {
        record.server.status.red()
    };
    let mut line = format!(
        "{}: sent {} bytes in {:.3}s ({:.2} MB/s), server {} with {} bytes",
        provider.bold(),
        record.client.bytes_sent,
        record.client.elapsed_us as f64 / 1e6,
        record.throughput_mbps(),
        status,
        record.server.bytes_received,
    );
    if record.server_ok() && record.server.bytes_received != record.client.bytes_sent {
        let _ = write!(line, " {}", "(byte counts differ)".yellow());
    }
    line
}

/// Multi-line rendering with both halves spelled out
pub fn detail_block(record: &ResultRecord) -> String {
    let mut block = String::new();
    let rule = "-----------------------------------------------------------------";
    let _ = writeln!(block, "{}", rule);
    let _ = writeln!(block, "Provider:          {}", record.provider);
    if record.remote_provider != record.provider {
        let _ = writeln!(block, "Remote provider:   {}", record.remote_provider);
    }
    let _ = writeln!(
        block,
        "Payload:           {} ({}-byte buffers)",
        record.payload, record.io.write_size
    );
    let _ = writeln!(block, "Mode:              {}", record.mode);
    let _ = writeln!(block, "Limit:             {}", record.limit);
    if !record.client.options.is_empty() {
        let _ = writeln!(block, "Socket options:    {}", record.client.options.to_wire());
    }
    let _ = writeln!(
        block,
        "Client:            {} bytes in {} buffers, {:.3}s ({:.2} MB/s)",
        record.client.bytes_sent,
        record.client.buffers_sent,
        record.client.elapsed_us as f64 / 1e6,
        record.throughput_mbps(),
    );
    let _ = writeln!(block, "  Started:         {}", record.client.start.to_rfc3339());
    let _ = writeln!(block, "  Finished:        {}", record.client.end.to_rfc3339());
    let _ = writeln!(
        block,
        "Server:            {}, {} bytes received",
        record.server.status, record.server.bytes_received
    );
    let _ = writeln!(block, "  Started:         {}", record.server.start.to_rfc3339());
    let _ = writeln!(block, "  Finished:        {}", record.server.end.to_rfc3339());
    if let Some(ref error) = record.server.error {
        let _ = writeln!(block, "  Error:           {}", error.red());
    }
    let _ = write!(block, "{}", rule);
    block
}

/// One-line rendering of a failed run
pub fn failure_line(label: &str, error: &str) -> String {
    format!("{}: {}", label.bold(), error.red())
}

/// Banner printed before a run starts
pub fn config_banner(config: &TestConfig) -> String {
    let mut banner = String::new();
    let rule = "-----------------------------------------------------------------";
    let _ = writeln!(banner, "{}", rule);
    let _ = writeln!(banner, "Starting benchmark for: {}", config.provider);
    let _ = writeln!(banner, "  Write size:      {} bytes", config.io.write_size);
    let _ = writeln!(banner, "  Read size:       {} bytes", config.io.read_size);
    let _ = writeln!(banner, "  Limit:           {}", config.limit);
    let _ = writeln!(banner, "  Mode:            {}", config.mode);
    let _ = writeln!(banner, "  Payload:         {}", config.resolved_payload());
    if !config.options.is_empty() {
        let _ = writeln!(banner, "  Socket options:  {}", config.options.to_wire());
    }
    let _ = write!(banner, "{}", rule);
    banner
}

/// One entry in the results file: a completed record or an attributed error
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOutcome {
    pub label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record: Option<ResultRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Serialize)]
struct FinalResults<'a> {
    version: &'a str,
    timestamp: DateTime<Utc>,
    total_runs: usize,
    results: &'a [RunOutcome],
}

/// Collects run outcomes and writes them as one JSON document
pub struct ResultsManager {
    output_file: PathBuf,
    outcomes: Vec<RunOutcome>,
}

impl ResultsManager {
    pub fn new(output_file: &Path) -> Self {
        Self { output_file: output_file.to_path_buf(), outcomes: Vec::new() }
    }

    pub fn add_record(&mut self, label: impl Into<String>, record: ResultRecord) {
        self.outcomes.push(RunOutcome { label: label.into(), record: Some(record), error: None });
    }

    pub fn add_failure(&mut self, label: impl Into<String>, error: impl Into<String>) {
        self.outcomes.push(RunOutcome { label: label.into(), record: None, error: Some(error.into()) });
    }

    /// Write all collected outcomes to the output file
    pub fn finalize(&self) -> Result<()> {
        let final_results = FinalResults {
            version: crate::VERSION,
            timestamp: Utc::now(),
            total_runs: self.outcomes.len(),
            results: &self.outcomes,
        };
        let json = serde_json::to_string_pretty(&final_results)?;
        std::fs::write(&self.output_file, json)?;
        info!("results written to {:?}", self.output_file);
        Ok(())
    }
}
