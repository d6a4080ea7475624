//! # Client Control Connection
//!
//! The single long-lived connection between a client process and a server.
//! Opened once per invocation (or once per batch run), it learns the
//! server's listening ports per provider on open and then carries strictly
//! ordered request/response pairs: a new command is never sent before the
//! previous response line has been read, which the `&mut self` receivers
//! enforce structurally.

use crate::config::{IoSize, SocketOptions};
use crate::protocol::{decode_ports, Command, Response, SessionSnapshot};
use anyhow::{anyhow, bail, Context, Result};
use std::collections::BTreeMap;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::debug;

pub struct ControlConnection {
    host: String,
    reader: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
    ports: BTreeMap<String, u16>,
}

impl ControlConnection {
    /// Connect to a server's control port and learn its port table
    ///
    /// Port discovery is by convention the first exchange on a new control
    /// connection.
    pub async fn open(host: &str, port: u16) -> Result<Self> {
        let stream = TcpStream::connect((host, port))
            .await
            .with_context(|| format!("failed to reach control channel at {}:{}", host, port))?;
        let (read_half, write_half) = stream.into_split();

        let mut connection = Self {
            host: host.to_string(),
            reader: BufReader::new(read_half).lines(),
            writer: write_half,
            ports: BTreeMap::new(),
        };

        let payload = connection.expect_ok(&Command::Ports).await?;
        let table = payload
            .first()
            .ok_or_else(|| anyhow!("PORTS response carried no port table"))?;
        connection.ports = decode_ports(table)?;
        debug!("server port table: {:?}", connection.ports);
        Ok(connection)
    }

    /// Host the server (and its data listeners) lives on
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Listening ports by provider, as reported by the server
    pub fn ports(&self) -> &BTreeMap<String, u16> {
        &self.ports
    }

    /// Usable data port for a provider; `None` when absent or reported as 0
    pub fn port_for(&self, provider: &str) -> Option<u16> {
        self.ports.get(provider).copied().filter(|&port| port != 0)
    }

    /// Push the socket options the server will apply to the next data
    /// connections
    pub async fn configure(&mut self, options: &SocketOptions) -> Result<()> {
        self.expect_ok(&Command::SoConfig(options.clone())).await?;
        Ok(())
    }

    /// Set the server's read chunk size for the next data connections
    pub async fn set_io_size(&mut self, io: IoSize) -> Result<()> {
        self.expect_ok(&Command::IoSize(io)).await?;
        Ok(())
    }

    /// Retrieve final statistics for the data session with this peer key
    pub async fn finish(&mut self, addr: &str, port: u16) -> Result<SessionSnapshot> {
        let payload = self
            .expect_ok(&Command::Finish { addr: addr.to_string(), port })
            .await?;
        let snapshot = payload
            .first()
            .ok_or_else(|| anyhow!("FINISH response carried no statistics"))?;
        SessionSnapshot::from_wire(snapshot)
            .map_err(|detail| anyhow!("invalid FINISH response: {}", detail))
    }

    async fn expect_ok(&mut self, command: &Command) -> Result<Vec<String>> {
        match self.round_trip(command).await? {
            Response::Ok(payload) => Ok(payload),
            Response::Error(message) => bail!("server: {}", message),
        }
    }

    async fn round_trip(&mut self, command: &Command) -> Result<Response> {
        let mut line = command.encode();
        debug!("control -> {}", line);
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await?;

        let reply = self
            .reader
            .next_line()
            .await?
            .ok_or_else(|| anyhow!("control connection closed by server"))?;
        debug!("control <- {}", reply);
        Ok(Response::decode(&reply)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
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
    async fn test_open_learns_port_table() {
        let port = start_server().await;
        let control = ControlConnection::open("127.0.0.1", port).await.unwrap();
        assert!(control.port_for("tcp").is_some());
        assert!(control.port_for("iocp").is_none());
    }

    #[tokio::test]
    async fn test_configuration_round_trips() {
        let port = start_server().await;
        let mut control = ControlConnection::open("127.0.0.1", port).await.unwrap();

        let mut options = SocketOptions::new();
        options.set("-buffering", "none");
        control.configure(&options).await.unwrap();
        control
            .set_io_size(IoSize { read_size: 8192, write_size: 4096 })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_finish_unknown_peer_is_an_error() {
        let port = start_server().await;
        let mut control = ControlConnection::open("127.0.0.1", port).await.unwrap();

        let error = control.finish("10.0.0.1", 51000).await.err().unwrap();
        assert!(error.to_string().contains("Unknown client: 10.0.0.1/51000"));
    }
}
