//! # Benchmark Server
//!
//! The server side of the harness: one long-lived control listener plus one
//! data listener per registered provider. Control connections negotiate the
//! socket options and I/O sizes applied to subsequently accepted data
//! connections and retrieve per-session statistics; data connections carry
//! the timed payload and are tracked by the session registry until their
//! statistics have been collected.
//!
//! All negotiated state lives on the server instance; nothing persists
//! across independent server instances in the same process.

use crate::config::{IoSize, SocketOptions};
use crate::protocol::{encode_ports, Command, Response};
use crate::provider::{DataListener, DataStream, ProviderRegistry};
use crate::session::{QueryOutcome, SessionKey, SessionRegistry};
use anyhow::Result;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Server listen configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    /// Control channel port; 0 picks an ephemeral port
    pub control_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: crate::defaults::HOST.to_string(),
            control_port: crate::defaults::CONTROL_PORT,
        }
    }
}

/// Socket options and I/O sizes applied to the next accepted data connections
struct Negotiated {
    options: SocketOptions,
    io: IoSize,
}

struct ServerState {
    sessions: SessionRegistry,
    negotiated: Mutex<Negotiated>,
    ports: BTreeMap<String, u16>,
}

/// A bound benchmark server; `run` drives the control accept loop
pub struct Server {
    control: TcpListener,
    control_port: u16,
    state: Arc<ServerState>,
}

impl Server {
    /// Bind the control listener and one data listener per provider
    ///
    /// A provider that fails to listen is reported with port 0 in the port
    /// table rather than failing the whole server.
    pub async fn bind(config: &ServerConfig, providers: Arc<ProviderRegistry>) -> Result<Self> {
        let control =
            TcpListener::bind(format!("{}:{}", config.host, config.control_port)).await?;
        let control_port = control.local_addr()?.port();

        let mut ports = BTreeMap::new();
        let mut listeners = Vec::new();
        for name in providers.names() {
            let provider = providers.get(name).expect("name from registry");
            match provider.listen(&config.host, 0).await {
                Ok(listener) => {
                    info!("provider {} listening on port {}", name, listener.local_port());
                    ports.insert(name.to_string(), listener.local_port());
                    listeners.push((name.to_string(), listener));
                }
                Err(e) => {
                    warn!("provider {} cannot listen, reporting port 0: {}", name, e);
                    ports.insert(name.to_string(), 0);
                }
            }
        }

        let state = Arc::new(ServerState {
            sessions: SessionRegistry::new(),
            negotiated: Mutex::new(Negotiated {
                options: SocketOptions::new(),
                io: IoSize::default(),
            }),
            ports,
        });

        for (name, listener) in listeners {
            tokio::spawn(accept_loop(name, listener, Arc::clone(&state)));
        }

        Ok(Self { control, control_port, state })
    }

    /// Port the control listener ended up on
    pub fn control_port(&self) -> u16 {
        self.control_port
    }

    /// Data listening port per provider (0 = unsupported)
    pub fn data_ports(&self) -> &BTreeMap<String, u16> {
        &self.state.ports
    }

    /// Accept and serve control connections until the listener fails
    pub async fn run(self) -> Result<()> {
        info!("control channel listening on port {}", self.control_port);
        loop {
            let (stream, peer) = self.control.accept().await?;
            debug!("control connection from {}", peer);
            let state = Arc::clone(&self.state);
            tokio::spawn(async move {
                match handle_control(stream, state).await {
                    Ok(()) => debug!("control connection from {} closed", peer),
                    Err(e) => debug!("control connection from {} ended: {}", peer, e),
                }
            });
        }
    }
}

/// Accept data connections for one provider
async fn accept_loop(provider: String, mut listener: Box<dyn DataListener>, state: Arc<ServerState>) {
    loop {
        let stream = match listener.accept().await {
            Ok(stream) => stream,
            Err(e) => {
                error!("provider {} accept failed: {}", provider, e);
                break;
            }
        };

        let peer = match stream.peer_addr() {
            Ok(peer) => peer,
            Err(e) => {
                warn!("dropping data connection without peer address: {}", e);
                continue;
            }
        };
        let key = SessionKey::new(peer.ip().to_string(), peer.port());

        // Snapshot the negotiated configuration at accept time; later
        // SOCONFIG/IOSIZE commands only affect subsequent connections.
        let (options, io) = {
            let negotiated = state.negotiated.lock().await;
            (negotiated.options.clone(), negotiated.io)
        };

        if let Err(e) = stream.configure(&options) {
            warn!("session {}: could not apply socket options: {}", key, e);
        }

        if let Err(e) = state.sessions.register(key.clone(), options).await {
            // Stale unretired session still owns this key; a false match
            // would corrupt its statistics, so refuse the connection.
            warn!("rejecting data connection: {}", e);
            continue;
        }

        tokio::spawn(read_session(stream, key, io.read_size, Arc::clone(&state)));
    }
}

/// Drain one data connection, crediting bytes until end-of-stream
async fn read_session(
    mut stream: Box<dyn DataStream>,
    key: SessionKey,
    read_size: u32,
    state: Arc<ServerState>,
) {
    let mut buf = vec![0u8; read_size as usize];
    let mut received: u64 = 0;

    loop {
        match stream.read(&mut buf).await {
            Ok(0) => {
                // Echo the total back on the data socket so a client reading
                // after its write-half close sees the count immediately,
                // then park the socket until the statistics are collected.
                let line = format!("{}\n", received);
                if let Err(e) = stream.write_all(line.as_bytes()).await {
                    warn!("session {}: could not write byte count: {}", key, e);
                }
                let _ = stream.flush().await;
                debug!("session {} finished with {} bytes", key, received);
                state.sessions.finish(&key, stream).await;
                return;
            }
            Ok(n) => {
                received += n as u64;
                state.sessions.add_bytes(&key, n as u64).await;
            }
            Err(e) => {
                warn!("session {} read error: {}", key, e);
                state.sessions.fail(&key, &e.to_string(), Some(stream)).await;
                return;
            }
        }
    }
}

/// Serve one control connection: one decoded command, one response line,
/// strictly in order
async fn handle_control(stream: TcpStream, state: Arc<ServerState>) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    while let Some(line) = lines.next_line().await? {
        let response = match Command::decode(&line) {
            Ok(command) => dispatch(command, &state).await,
            Err(e) => {
                // Malformed input gets an ERROR line; the connection stays up
                warn!("malformed control message: {}", e);
                Response::error(e.to_string())
            }
        };
        let mut wire = response.encode();
        wire.push('\n');
        write_half.write_all(wire.as_bytes()).await?;
    }
    Ok(())
}

async fn dispatch(command: Command, state: &ServerState) -> Response {
    match command {
        Command::Ports => Response::ok_with(encode_ports(&state.ports)),
        Command::SoConfig(options) => {
            debug!("socket options replaced: {}", options.to_wire());
            state.negotiated.lock().await.options = options;
            Response::ok()
        }
        Command::IoSize(io) => {
            debug!("io sizes set: read {} write {}", io.read_size, io.write_size);
            state.negotiated.lock().await.io = io;
            Response::ok()
        }
        Command::Finish { addr, port } => {
            let key = SessionKey::new(addr, port);
            match state.sessions.query(&key).await {
                Ok(QueryOutcome::Ready(snapshot)) => Response::ok_with(snapshot.to_wire()),
                Ok(QueryOutcome::Pending(reply)) => match reply.await {
                    Ok(snapshot) => Response::ok_with(snapshot.to_wire()),
                    // Waiter dropped without an answer: the session vanished
                    Err(_) => Response::error(format!("Unknown client: {}", key)),
                },
                Err(e) => Response::error(e.to_string()),
            }
        }
    }
}
