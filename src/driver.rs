//! # Benchmark Driver
//!
//! Executes exactly one [`TestConfig`] end to end and produces a
//! [`ResultRecord`]:
//!
//! 1. Validate the I/O sizes and option combinations.
//! 2. Resolve the payload shape.
//! 3. Push `SOCONFIG` and `IOSIZE` over the control connection.
//! 4. Resolve the remote provider's listening port from the port table.
//! 5. Open the data connection with the local provider and apply options.
//! 6. Run the transfer loop (blocking or event-driven).
//! 7. Half-close the write direction, read back the server's byte count,
//!    then fully close.
//! 8. Send `FINISH` for the connection's local address and merge the
//!    server's statistics into the record.
//!
//! Configuration problems fail before any I/O; control-channel and
//! transport errors abort the run with a descriptive message and are not
//! retried.

use crate::config::TestConfig;
use crate::control::ControlConnection;
use crate::payload::PayloadCache;
use crate::provider::{DataStream, ProviderRegistry};
use crate::report::ResultRecord;
use crate::transfer::strategy_for;
use anyhow::{anyhow, Context, Result};
use tracing::{debug, info, warn};

/// Drives single benchmark runs over a shared control connection
pub struct BenchmarkDriver<'a> {
    control: &'a mut ControlConnection,
    providers: &'a ProviderRegistry,
    payloads: &'a mut PayloadCache,
}

impl<'a> BenchmarkDriver<'a> {
    pub fn new(
        control: &'a mut ControlConnection,
        providers: &'a ProviderRegistry,
        payloads: &'a mut PayloadCache,
    ) -> Self {
        Self { control, providers, payloads }
    }

    /// Execute one configuration and collect statistics from both ends
    pub async fn run(&mut self, config: &TestConfig) -> Result<ResultRecord> {
        config.validate()?;
        let payload_kind = config.resolved_payload();

        self.control
            .configure(&config.options)
            .await
            .context("SOCONFIG rejected")?;
        self.control
            .set_io_size(config.io)
            .await
            .context("IOSIZE rejected")?;

        let remote = config.remote_provider_name();
        let data_port = self
            .control
            .port_for(remote)
            .ok_or_else(|| anyhow!("provider not supported by server: {}", remote))?;

        let provider = self
            .providers
            .get(&config.provider)
            .ok_or_else(|| anyhow!("no such local provider: {}", config.provider))?;

        let stream = provider.connect(self.control.host(), data_port).await?;
        stream.configure(&config.options)?;
        // Captured now: the key the server tracks this session under
        let local = stream.local_addr()?;
        debug!("data connection open, local endpoint {}", local);

        let payload = self.payloads.buffer(payload_kind, config.io.write_size as usize);
        let strategy = strategy_for(config.mode);
        let (mut stream, stats) = strategy.run(stream, payload, config.limit).await?;
        info!(
            "transfer complete: {} bytes in {:.3}s",
            stats.bytes_sent,
            stats.elapsed.as_secs_f64()
        );

        // Signal end-of-stream, then pick up the count the server echoes
        // back on the data socket before tearing it down.
        stream.shutdown_write().await?;
        let echoed = read_count_line(stream.as_mut()).await?;
        if echoed != stats.bytes_sent {
            warn!(
                "server echoed {} bytes on the data socket, client sent {}",
                echoed, stats.bytes_sent
            );
        }
        drop(stream);

        let snapshot = self
            .control
            .finish(&local.ip().to_string(), local.port())
            .await?;
        Ok(ResultRecord::new(config, payload_kind, stats, snapshot))
    }
}

/// Read the single byte-count line the server writes after end-of-stream
async fn read_count_line(stream: &mut dyn DataStream) -> Result<u64> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = stream.read(&mut byte).await?;
        if n == 0 || byte[0] == b'\n' {
            break;
        }
        line.push(byte[0]);
    }
    let text = String::from_utf8(line).context("byte-count line is not UTF-8")?;
    text.trim()
        .parse::<u64>()
        .map_err(|_| anyhow!("invalid byte-count line from server: {:?}", text))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{IoSize, TransferLimit};
    use crate::provider::ProviderRegistry;
    use crate::server::{Server, ServerConfig};
    use std::sync::Arc;

    async fn start_server() -> u16 {
        let config = ServerConfig { host: "127.0.0.1".to_string(), control_port: 0 };
        let server = Server::bind(&config, Arc::new(ProviderRegistry::with_defaults()))
            .await
            .unwrap();
        let port = server.control_port();
        tokio::spawn(server.run());
        port
    }

    #[tokio::test]
    async fn test_invalid_io_size_fails_before_io() {
        let port = start_server().await;
        let mut control = ControlConnection::open("127.0.0.1", port).await.unwrap();
        let providers = ProviderRegistry::with_defaults();
        let mut payloads = PayloadCache::new();
        let mut driver = BenchmarkDriver::new(&mut control, &providers, &mut payloads);

        let mut config = TestConfig::default();
        config.io = IoSize { read_size: 16384, write_size: 0 };
        assert!(driver.run(&config).await.is_err());
    }

    #[tokio::test]
    async fn test_unsupported_remote_provider() {
        let port = start_server().await;
        let mut control = ControlConnection::open("127.0.0.1", port).await.unwrap();
        let providers = ProviderRegistry::with_defaults();
        let mut payloads = PayloadCache::new();
        let mut driver = BenchmarkDriver::new(&mut control, &providers, &mut payloads);

        let mut config = TestConfig::default();
        config.remote_provider = Some("iocp".to_string());
        let error = driver.run(&config).await.err().unwrap();
        assert!(error.to_string().contains("provider not supported"));
    }

    #[tokio::test]
    async fn test_count_mode_end_to_end() {
        let port = start_server().await;
        let mut control = ControlConnection::open("127.0.0.1", port).await.unwrap();
        let providers = ProviderRegistry::with_defaults();
        let mut payloads = PayloadCache::new();
        let mut driver = BenchmarkDriver::new(&mut control, &providers, &mut payloads);

        let mut config = TestConfig::default();
        config.io = IoSize { read_size: 16384, write_size: 4096 };
        config.limit = TransferLimit::Count(100);

        let record = driver.run(&config).await.unwrap();
        assert_eq!(record.client.bytes_sent, 409600);
        assert_eq!(record.server.bytes_received, 409600);
        assert!(record.server_ok());
        assert_eq!(record.server.status, "ok");
    }
}
