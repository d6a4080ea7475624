use anyhow::Result;
use netbench::{ProviderRegistry, Server, ServerConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::time::sleep;

struct RawControl {
    reader: tokio::io::Lines<BufReader<tokio::net::tcp::OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl RawControl {
    async fn connect(port: u16) -> Result<Self> {
        let stream = TcpStream::connect(("127.0.0.1", port)).await?;
        let (read_half, writer) = stream.into_split();
        Ok(Self { reader: BufReader::new(read_half).lines(), writer })
    }

    async fn send(&mut self, line: &str) -> Result<()> {
        self.writer.write_all(format!("{}\n", line).as_bytes()).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<String> {
        Ok(self.reader.next_line().await?.expect("server closed connection"))
    }
}

async fn start_server() -> Result<(u16, u16)> {
    let config = ServerConfig { host: "127.0.0.1".to_string(), control_port: 0 };
    let server = Server::bind(&config, Arc::new(ProviderRegistry::with_defaults())).await?;
    let control_port = server.control_port();
    let data_port = *server.data_ports().get("tcp").unwrap();
    tokio::spawn(server.run());
    Ok((control_port, data_port))
}

/// A FINISH issued while the data stream is still open is answered only
/// once the stream reaches end-of-stream, with the full byte count.
#[tokio::test]
async fn finish_waits_for_end_of_stream() -> Result<()> {
    let (control_port, data_port) = start_server().await?;
    let mut control = RawControl::connect(control_port).await?;

    control.send("PORTS").await?;
    assert!(control.recv().await?.starts_with("OK"));
    control.send("IOSIZE {-readsize 4096 -writesize 1024}").await?;
    assert_eq!(control.recv().await?, "OK");

    let mut data = TcpStream::connect(("127.0.0.1", data_port)).await?;
    let local = data.local_addr()?;
    data.write_all(&[0u8; 1000]).await?;
    data.flush().await?;

    // Let the server's read loop credit the bytes before we query
    sleep(Duration::from_millis(100)).await;

    // The stream is still open, so this query must park until it finishes
    control
        .send(&format!("FINISH {{{} {}}}", local.ip(), local.port()))
        .await?;

    let closer = tokio::spawn(async move {
        sleep(Duration::from_millis(150)).await;
        // Half-close; the server replies with its count on the data socket
        data.shutdown().await.unwrap();
        let mut echoed = String::new();
        let mut byte = [0u8; 1];
        loop {
            let n = data.read(&mut byte).await.unwrap();
            if n == 0 || byte[0] == b'\n' {
                break;
            }
            echoed.push(byte[0] as char);
        }
        echoed
    });

    let reply = control.recv().await?;
    assert!(reply.starts_with("OK"), "got: {}", reply);
    assert!(reply.contains("Received 1000"), "got: {}", reply);

    let echoed = closer.await?;
    assert_eq!(echoed, "1000");
    Ok(())
}

/// A second FINISH for a key that already has a waiter is refused.
#[tokio::test]
async fn second_finish_for_pending_session_is_refused() -> Result<()> {
    let (control_port, data_port) = start_server().await?;

    let mut first = RawControl::connect(control_port).await?;
    first.send("PORTS").await?;
    first.recv().await?;

    let data = TcpStream::connect(("127.0.0.1", data_port)).await?;
    let local = data.local_addr()?;
    sleep(Duration::from_millis(100)).await;

    // First query parks on the in-flight session
    first
        .send(&format!("FINISH {{{} {}}}", local.ip(), local.port()))
        .await?;
    sleep(Duration::from_millis(100)).await;

    // Second query from another control connection must fail, not duplicate
    let mut second = RawControl::connect(control_port).await?;
    second.send("PORTS").await?;
    second.recv().await?;
    second
        .send(&format!("FINISH {{{} {}}}", local.ip(), local.port()))
        .await?;
    let reply = second.recv().await?;
    assert_eq!(
        reply,
        format!("ERROR {{Unknown client: {}/{}}}", local.ip(), local.port())
    );

    drop(data);
    Ok(())
}

/// FINISH for a peer the server never accepted fails immediately.
#[tokio::test]
async fn finish_for_never_accepted_peer() -> Result<()> {
    let (control_port, _) = start_server().await?;
    let mut control = RawControl::connect(control_port).await?;
    control.send("PORTS").await?;
    control.recv().await?;

    control.send("FINISH {10.0.0.1 51000}").await?;
    assert_eq!(control.recv().await?, "ERROR {Unknown client: 10.0.0.1/51000}");
    Ok(())
}

/// Malformed commands get an ERROR line without losing the connection.
#[tokio::test]
async fn malformed_commands_do_not_drop_connection() -> Result<()> {
    let (control_port, _) = start_server().await?;
    let mut control = RawControl::connect(control_port).await?;

    control.send("SOCONFIG {-buffering none} extra").await?;
    assert!(control.recv().await?.starts_with("ERROR"));

    control.send("IOSIZE {-readsize nope -writesize 1}").await?;
    assert!(control.recv().await?.starts_with("ERROR"));

    control.send("PORTS").await?;
    assert!(control.recv().await?.starts_with("OK"));
    Ok(())
}
