//! # Netbench
//!
//! A client/server harness for measuring bulk-transfer throughput across
//! interchangeable socket backends ("providers"). A persistent control
//! channel coordinates ephemeral data connections and collects matched
//! statistics from both ends of every transfer.
//!
//! ## Architecture Overview
//!
//! The harness is organized into these modules:
//!
//! - `protocol`: line-oriented codec for the control channel
//! - `provider`: socket backend abstraction and the built-in TCP provider
//! - `session`: server-side tracking of in-flight data connections
//! - `server`: control listener plus per-provider data listeners
//! - `control`: the client's long-lived control connection
//! - `transfer`: blocking and event-driven write-loop strategies
//! - `driver`: single-run orchestration producing a result record
//! - `batch`: script replay sharing one control connection
//! - `report`: result records, rendering, and JSON output
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use netbench::{
//!     BenchmarkDriver, ControlConnection, PayloadCache, ProviderRegistry, TestConfig,
//! };
//! use netbench::config::TransferLimit;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let providers = ProviderRegistry::with_defaults();
//!     let mut control = ControlConnection::open("127.0.0.1", 9901).await?;
//!     let mut payloads = PayloadCache::new();
//!
//!     let mut config = TestConfig::default();
//!     config.limit = TransferLimit::Count(100);
//!
//!     let mut driver = BenchmarkDriver::new(&mut control, &providers, &mut payloads);
//!     let record = driver.run(&config).await?;
//!     println!("{}", netbench::report::summary_line(&record));
//!     Ok(())
//! }
//! ```
//!
//! ## Coordination Model
//!
//! The control channel carries strictly ordered request/response pairs; the
//! server answers `PORTS`, applies `SOCONFIG`/`IOSIZE` to subsequently
//! accepted data connections, and resolves `FINISH` queries against its
//! session registry, which reconciles end-of-stream events with statistics
//! queries arriving in either order.

/// Script replay across one shared control connection
pub mod batch;

/// Command-line interface parsing and configuration conversion
pub mod cli;

/// Test configuration: socket options, I/O sizes, limits, payload shape
pub mod config;

/// The client's long-lived control connection
pub mod control;

/// Single-run orchestration
pub mod driver;

/// Cached payload buffer generation
pub mod payload;

/// Control channel wire codec
pub mod protocol;

/// Socket provider abstraction and built-in backends
pub mod provider;

/// Result records, rendering, and JSON output
pub mod report;

/// Benchmark server: control and data listeners
pub mod server;

/// Server-side data session registry
pub mod session;

/// Blocking and event-driven transfer strategies
pub mod transfer;

// Re-export the types most library users need

pub use batch::BatchRunner;
pub use config::{IoSize, PayloadKind, SocketOptions, TestConfig};
pub use control::ControlConnection;
pub use driver::BenchmarkDriver;
pub use payload::PayloadCache;
pub use provider::{ProviderRegistry, SocketProvider};
pub use report::{ResultRecord, ResultsManager};
pub use server::{Server, ServerConfig};

/// The current version of the benchmark harness
///
/// Populated from Cargo.toml and recorded in result output for
/// reproducibility.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod defaults {
    use std::time::Duration;

    /// Default host for both the server listeners and the client
    pub const HOST: &str = "127.0.0.1";

    /// Default control channel port
    pub const CONTROL_PORT: u16 = 9901;

    /// Default provider name for the data connection
    pub const PROVIDER: &str = "tcp";

    /// Default bytes per write buffer
    pub const WRITE_SIZE: u32 = 4096;

    /// Default server-side read chunk size
    ///
    /// Larger than the write size so a loaded server drains several client
    /// buffers per read.
    pub const READ_SIZE: u32 = 16384;

    /// Default transfer window when neither a count nor a duration is given
    pub const DURATION: Duration = Duration::from_secs(5);
}
