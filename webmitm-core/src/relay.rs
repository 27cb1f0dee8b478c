//! Opaque bidirectional byte relay.
//!
//! Used for excluded/non-TLS CONNECT tunnels, post-decrypt non-HTTP
//! traffic, and WebSocket streams after the 101. Two independent
//! half-duplex pumps run concurrently; EOF on one side shuts down the
//! peer's write half, any error cancels both.

use prometheus::IntCounter;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::{Duration, timeout};

use crate::body::BufferPool;
use crate::hooks::HookSet;
use crate::stream::Duplex;

/// Relay bytes between `client` and `server` until either side closes.
///
/// `client_leftover` (bytes the framing layer buffered ahead, e.g. a
/// peeked ClientHello) is flushed to the server first, and
/// `server_leftover` (e.g. a peeked ServerHello) to the client, so no
/// peeked byte is ever lost.
pub async fn relay(
    client: Box<dyn Duplex>,
    client_leftover: Vec<u8>,
    server: Box<dyn Duplex>,
    server_leftover: Vec<u8>,
    buffers: &BufferPool,
    idle_timeout: Duration,
    hooks: Arc<HookSet>,
    counters: Option<(IntCounter, IntCounter)>,
) -> io::Result<()> {
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut server_read, mut server_write) = tokio::io::split(server);

    let sent_counter = counters.as_ref().map(|(tx, _)| tx.clone());
    let received_counter = counters.as_ref().map(|(_, rx)| rx.clone());
    let client_hooks = hooks.clone();

    let client_to_server = async {
        if !client_leftover.is_empty() {
            client_hooks.data_sent(&client_leftover);
            server_write.write_all(&client_leftover).await?;
            if let Some(counter) = &sent_counter {
                counter.inc_by(client_leftover.len() as u64);
            }
        }
        let mut buf = buffers.lease();
        loop {
            let n = timeout(idle_timeout, client_read.read(&mut buf)).await??;
            if n == 0 {
                break;
            }
            client_hooks.data_sent(&buf[..n]);
            server_write.write_all(&buf[..n]).await?;
            if let Some(counter) = &sent_counter {
                counter.inc_by(n as u64);
            }
        }
        server_write.shutdown().await?;
        Ok::<_, io::Error>(())
    };

    let server_to_client = async {
        if !server_leftover.is_empty() {
            hooks.data_received(&server_leftover);
            client_write.write_all(&server_leftover).await?;
            if let Some(counter) = &received_counter {
                counter.inc_by(server_leftover.len() as u64);
            }
        }
        let mut buf = buffers.lease();
        loop {
            let n = timeout(idle_timeout, server_read.read(&mut buf)).await??;
            if n == 0 {
                break;
            }
            hooks.data_received(&buf[..n]);
            client_write.write_all(&buf[..n]).await?;
            if let Some(counter) = &received_counter {
                counter.inc_by(n as u64);
            }
        }
        client_write.shutdown().await?;
        Ok::<_, io::Error>(())
    };

    tokio::try_join!(client_to_server, server_to_client)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::HookSet;

    #[tokio::test]
    async fn relays_both_directions_with_leftovers() {
        let (client_near, mut client_far) = tokio::io::duplex(4096);
        let (server_near, mut server_far) = tokio::io::duplex(4096);

        let pool = BufferPool::new(1024);
        let hooks = Arc::new(HookSet::new());

        let relay_task = tokio::spawn(async move {
            relay(
                Box::new(client_near),
                b"hello-from-client-buffer".to_vec(),
                Box::new(server_near),
                b"hello-from-server-buffer".to_vec(),
                &pool,
                Duration::from_secs(5),
                hooks,
                None,
            )
            .await
        });

        // Leftovers arrive first on each side
        let mut got = [0u8; 24];
        server_far.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"hello-from-client-buffer");
        client_far.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"hello-from-server-buffer");

        // Live traffic flows afterwards
        client_far.write_all(b"ping").await.unwrap();
        let mut ping = [0u8; 4];
        server_far.read_exact(&mut ping).await.unwrap();
        assert_eq!(&ping, b"ping");

        server_far.write_all(b"pong").await.unwrap();
        client_far.read_exact(&mut ping).await.unwrap();
        assert_eq!(&ping, b"pong");

        // Closing both ends lets the relay finish cleanly
        drop(client_far);
        drop(server_far);
        relay_task.await.unwrap().unwrap();
    }
}
