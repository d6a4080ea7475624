//! # Socket Provider Abstraction
//!
//! A provider is a named, interchangeable socket backend supplying the
//! primitive operations the benchmark needs: connect, listen, configure,
//! and close (close is the drop of the returned handles). The registry maps
//! provider names to instances; the `tcp` provider ships in-crate and
//! additional backends can be registered by embedders.
//!
//! Blocking versus event-driven writing is a property of the transfer
//! strategy driving a [`DataStream`], not of the provider: every stream
//! exposes both awaited writes and readiness-gated non-blocking writes.

use crate::config::SocketOptions;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

pub mod tcp;

pub use tcp::TcpProvider;

/// One established data connection
#[async_trait]
pub trait DataStream: Send {
    fn local_addr(&self) -> io::Result<SocketAddr>;

    fn peer_addr(&self) -> io::Result<SocketAddr>;

    /// Apply socket-level tuning from the option map; unknown keys are
    /// ignored here since they govern payload semantics, not the socket
    fn configure(&self, options: &SocketOptions) -> Result<()>;

    /// Write the whole buffer, waiting for transport capacity as needed
    async fn write_all(&mut self, buf: &[u8]) -> io::Result<()>;

    async fn flush(&mut self) -> io::Result<()>;

    /// Suspend until the transport signals room for another write
    async fn writable(&self) -> io::Result<()>;

    /// Attempt one non-blocking write; `WouldBlock` means no room yet
    fn try_write(&self, buf: &[u8]) -> io::Result<usize>;

    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Close the write direction, leaving the read direction open
    async fn shutdown_write(&mut self) -> io::Result<()>;
}

/// A bound listener handing out accepted [`DataStream`]s
#[async_trait]
pub trait DataListener: Send {
    fn local_port(&self) -> u16;

    async fn accept(&mut self) -> Result<Box<dyn DataStream>>;
}

/// Named socket backend
#[async_trait]
pub trait SocketProvider: Send + Sync {
    /// Identifier used in the port table and configuration
    fn name(&self) -> &str;

    async fn connect(&self, host: &str, port: u16) -> Result<Box<dyn DataStream>>;

    async fn listen(&self, host: &str, port: u16) -> Result<Box<dyn DataListener>>;
}

/// Registry mapping provider names to backend instances
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: BTreeMap<String, Arc<dyn SocketProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the built-in providers
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(TcpProvider::new()));
        registry
    }

    pub fn register(&mut self, provider: Arc<dyn SocketProvider>) {
        self.providers.insert(provider.name().to_string(), provider);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn SocketProvider>> {
        self.providers.get(name).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.providers.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_defaults() {
        let registry = ProviderRegistry::with_defaults();
        assert!(registry.get("tcp").is_some());
        assert!(registry.get("iocp").is_none());
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["tcp"]);
    }

    #[test]
    fn test_registry_register() {
        let mut registry = ProviderRegistry::new();
        assert!(registry.is_empty());
        registry.register(Arc::new(TcpProvider::new()));
        assert_eq!(registry.len(), 1);
    }
}
