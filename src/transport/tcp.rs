//! TCP accept loop and outbound dialing.
//!
//! Each accepted client is handled in its own task; the accept loop never
//! waits on a handler.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Pause after a failed accept so a full fd table doesn't spin the loop.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// TCP listener that hands every connection to a handler task.
pub struct TcpTransport {
    listener: TcpListener,
}

impl TcpTransport {
    /// Bind a TCP listener for the transport.
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;

        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Start the accept loop.
    ///
    /// `handler` is called once per connection and its future is spawned.
    pub fn start<H, Fut>(self, handler: H) -> JoinHandle<()>
    where
        H: Fn(TcpStream, SocketAddr) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(run_accept_loop(self.listener, handler))
    }
}

async fn run_accept_loop<H, Fut>(listener: TcpListener, handler: H)
where
    H: Fn(TcpStream, SocketAddr) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    loop {
        match listener.accept().await {
            Ok((client, peer)) => {
                debug!("accepted connection from {}", peer);
                let _ = client.set_nodelay(true);
                tokio::spawn(handler(client, peer));
            }
            Err(e) => {
                warn!("TCP accept error: {}", e);
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

/// Open a TCP connection with Nagle disabled.
pub async fn dial<A: ToSocketAddrs>(addr: A) -> io::Result<TcpStream> {
    let stream = TcpStream::connect(addr).await?;
    let _ = stream.set_nodelay(true);
    Ok(stream)
}
