//! Full-duplex byte relay between two streams.
//!
//! Two copy loops run concurrently, one per direction. When either loop
//! ends (EOF or error) it shuts down its write side and cancels the other,
//! so both sockets are closed once the relay returns.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const COPY_BUF_SIZE: usize = 16 * 1024;

/// Bytes moved in each direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Transferred {
    pub client_to_upstream: u64,
    pub upstream_to_client: u64,
}

/// Relays bytes between `client` and `upstream` until either side closes.
pub async fn relay<C, U>(client: C, upstream: U) -> Transferred
where
    C: AsyncRead + AsyncWrite + Send + 'static,
    U: AsyncRead + AsyncWrite + Send + 'static,
{
    relay_limited(client, upstream, None).await
}

/// Like [`relay`], with the upstream-to-client direction capped at
/// `downstream_limit` bytes per second.
pub async fn relay_limited<C, U>(
    client: C,
    upstream: U,
    downstream_limit: Option<u64>,
) -> Transferred
where
    C: AsyncRead + AsyncWrite + Send + 'static,
    U: AsyncRead + AsyncWrite + Send + 'static,
{
    let (client_read, client_write) = tokio::io::split(client);
    let (upstream_read, upstream_write) = tokio::io::split(upstream);
    let done = CancellationToken::new();

    let downstream = tokio::spawn(pipe(
        upstream_read,
        client_write,
        done.clone(),
        downstream_limit,
    ));
    let client_to_upstream = pipe(client_read, upstream_write, done.clone(), None).await;

    // `done` is cancelled by now, so the other direction is already winding down.
    let upstream_to_client = downstream.await.unwrap_or_default();

    debug!(
        "relay closed: {} bytes client->upstream, {} bytes upstream->client",
        client_to_upstream, upstream_to_client
    );

    Transferred {
        client_to_upstream,
        upstream_to_client,
    }
}

async fn pipe<R, W>(mut reader: R, mut writer: W, done: CancellationToken, limit: Option<u64>) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut copied = 0u64;

    tokio::select! {
        res = copy(&mut reader, &mut writer, limit, &mut copied) => {
            if let Err(e) = res {
                debug!("relay copy ended with error: {}", e);
            }
        }
        _ = done.cancelled() => {}
    }

    let _ = writer.shutdown().await;
    done.cancel();
    copied
}

async fn copy<R, W>(
    reader: &mut R,
    writer: &mut W,
    limit: Option<u64>,
    copied: &mut u64,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    let started = Instant::now();

    loop {
        let want = match limit {
            Some(rate) => (rate as usize).clamp(1, COPY_BUF_SIZE),
            None => COPY_BUF_SIZE,
        };

        let n = reader.read(&mut buf[..want]).await?;
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        *copied += n as u64;

        if let Some(rate) = limit {
            throttle(started, *copied, rate).await;
        }
    }
}

/// Sleeps until `copied` bytes fit within `rate` bytes/s since `started`,
/// allowing one second of burst.
async fn throttle(started: Instant, copied: u64, rate: u64) {
    if rate == 0 {
        return;
    }
    let budget = copied.saturating_sub(rate);
    let due = started + Duration::from_secs_f64(budget as f64 / rate as f64);
    if due > Instant::now() {
        tokio::time::sleep_until(due).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn relay_moves_bytes_both_ways() {
        let (client, mut client_peer) = duplex(1024);
        let (upstream, mut upstream_peer) = duplex(1024);

        let task = tokio::spawn(relay(client, upstream));

        client_peer.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        upstream_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        upstream_peer.write_all(b"pong!").await.unwrap();
        let mut buf = [0u8; 5];
        client_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong!");

        drop(upstream_peer);
        let transferred = task.await.unwrap();

        assert_eq!(transferred.client_to_upstream, 4);
        assert_eq!(transferred.upstream_to_client, 5);
    }

    #[tokio::test]
    async fn closing_one_side_closes_the_other() {
        let (client, mut client_peer) = duplex(1024);
        let (upstream, mut upstream_peer) = duplex(1024);

        let task = tokio::spawn(relay(client, upstream));

        client_peer.write_all(b"bye").await.unwrap();
        drop(client_peer);

        let mut received = Vec::new();
        upstream_peer.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"bye");

        task.await.unwrap();
    }

    #[tokio::test]
    async fn relay_returns_when_upstream_closes_first() {
        let (client, mut client_peer) = duplex(1024);
        let (upstream, upstream_peer) = duplex(1024);

        let task = tokio::spawn(relay(client, upstream));
        drop(upstream_peer);

        let transferred = task.await.unwrap();
        assert_eq!(transferred, Transferred::default());

        let mut rest = Vec::new();
        client_peer.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn limited_relay_paces_downstream() {
        let (client, mut client_peer) = duplex(64 * 1024);
        let (upstream, mut upstream_peer) = duplex(64 * 1024);

        let started = Instant::now();
        let task = tokio::spawn(relay_limited(client, upstream, Some(1000)));

        upstream_peer.write_all(&[7u8; 3000]).await.unwrap();
        drop(upstream_peer);

        let mut received = Vec::new();
        client_peer.read_to_end(&mut received).await.unwrap();

        assert_eq!(received.len(), 3000);
        // one second of burst, then 2000 bytes at 1000 B/s
        assert!(started.elapsed() >= Duration::from_secs(2));
        task.await.unwrap();
    }
}
