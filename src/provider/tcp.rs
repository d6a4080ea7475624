//! TCP provider built on tokio streams with socket2 tuning.

use super::{DataListener, DataStream, SocketProvider};
use crate::config::SocketOptions;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

/// TCP socket backend
pub struct TcpProvider;

impl Default for TcpProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpProvider {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SocketProvider for TcpProvider {
    fn name(&self) -> &str {
        "tcp"
    }

    async fn connect(&self, host: &str, port: u16) -> Result<Box<dyn DataStream>> {
        let addr = format!("{}:{}", host, port);
        debug!("TCP provider connecting to {}", addr);
        let stream = TcpStream::connect(&addr)
            .await
            .with_context(|| format!("failed to connect to {}", addr))?;
        stream.set_nodelay(true)?;
        Ok(Box::new(TcpDataStream { stream }))
    }

    async fn listen(&self, host: &str, port: u16) -> Result<Box<dyn DataListener>> {
        let addr = format!("{}:{}", host, port);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind {}", addr))?;
        let local_port = listener.local_addr()?.port();
        debug!("TCP provider listening on {}:{}", host, local_port);
        Ok(Box::new(TcpDataListener { listener, local_port }))
    }
}

struct TcpDataListener {
    listener: TcpListener,
    local_port: u16,
}

#[async_trait]
impl DataListener for TcpDataListener {
    fn local_port(&self) -> u16 {
        self.local_port
    }

    async fn accept(&mut self) -> Result<Box<dyn DataStream>> {
        let (stream, peer) = self.listener.accept().await?;
        debug!("TCP provider accepted connection from {}", peer);
        stream.set_nodelay(true)?;
        Ok(Box::new(TcpDataStream { stream }))
    }
}

struct TcpDataStream {
    stream: TcpStream,
}

#[async_trait]
impl DataStream for TcpDataStream {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.stream.local_addr()
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }

    fn configure(&self, options: &SocketOptions) -> Result<()> {
        let socket = socket2::SockRef::from(&self.stream);
        if let Some(size) = options.get("-buffersize") {
            let size: usize = size
                .parse()
                .with_context(|| format!("invalid -buffersize: {}", size))?;
            socket.set_send_buffer_size(size)?;
            socket.set_recv_buffer_size(size)?;
        }
        if let Some(nodelay) = options.get("-nodelay") {
            socket.set_nodelay(nodelay != "0")?;
        }
        Ok(())
    }

    async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.stream.write_all(buf).await
    }

    async fn flush(&mut self) -> io::Result<()> {
        self.stream.flush().await
    }

    async fn writable(&self) -> io::Result<()> {
        self.stream.writable().await
    }

    fn try_write(&self, buf: &[u8]) -> io::Result<usize> {
        self.stream.try_write(buf)
    }

    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf).await
    }

    async fn shutdown_write(&mut self) -> io::Result<()> {
        self.stream.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tcp_connect_and_transfer() {
        let provider = TcpProvider::new();
        let mut listener = provider.listen("127.0.0.1", 0).await.unwrap();
        let port = listener.local_port();
        assert_ne!(port, 0);

        let accept_task = tokio::spawn(async move {
            let mut stream = listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            let n = stream.read(&mut buf).await.unwrap();
            (n, buf)
        });

        let mut client = provider.connect("127.0.0.1", port).await.unwrap();
        client.write_all(b"hello").await.unwrap();
        client.flush().await.unwrap();

        let (n, buf) = accept_task.await.unwrap();
        assert_eq!(&buf[..n], b"hello");
    }

    #[tokio::test]
    async fn test_tcp_configure_buffer_size() {
        let provider = TcpProvider::new();
        let mut listener = provider.listen("127.0.0.1", 0).await.unwrap();
        let port = listener.local_port();

        let accept_task = tokio::spawn(async move { listener.accept().await.unwrap() });
        let client = provider.connect("127.0.0.1", port).await.unwrap();
        let _server_side = accept_task.await.unwrap();

        let mut options = SocketOptions::new();
        options.set("-buffersize", "65536");
        options.set("-nodelay", "1");
        client.configure(&options).unwrap();

        let mut bad = SocketOptions::new();
        bad.set("-buffersize", "lots");
        assert!(client.configure(&bad).is_err());
    }

    #[tokio::test]
    async fn test_tcp_half_close_signals_eof() {
        let provider = TcpProvider::new();
        let mut listener = provider.listen("127.0.0.1", 0).await.unwrap();
        let port = listener.local_port();

        let accept_task = tokio::spawn(async move {
            let mut stream = listener.accept().await.unwrap();
            let mut total = 0usize;
            let mut buf = [0u8; 1024];
            loop {
                let n = stream.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                total += n;
            }
            // Write direction still works after the peer's half-close
            stream.write_all(b"done\n").await.unwrap();
            total
        });

        let mut client = provider.connect("127.0.0.1", port).await.unwrap();
        client.write_all(&[7u8; 2048]).await.unwrap();
        client.shutdown_write().await.unwrap();

        let mut reply = Vec::new();
        let mut buf = [0u8; 64];
        loop {
            let n = client.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            reply.extend_from_slice(&buf[..n]);
        }
        assert_eq!(reply, b"done\n");
        assert_eq!(accept_task.await.unwrap(), 2048);
    }
}
