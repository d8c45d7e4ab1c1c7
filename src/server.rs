use crate::config::ServerSettings;
use crate::error::{MimirError, Result};
use crate::handler::Handler;
use crate::resolver::MAX_UDP_PAYLOAD;
use hickory_proto::op::Message;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::broadcast;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

const CLIENT_IO_TIMEOUT: Duration = Duration::from_secs(5);

/// Dual-transport front-end: UDP and TCP listeners on the same address,
/// each driving the shared handler. Start is non-blocking; a bind failure
/// on one transport leaves the other running.
pub struct DnsServer {
    addr: String,
    handler: Arc<Handler>,
    shutdown: broadcast::Sender<()>,
}

impl DnsServer {
    pub fn new(
        settings: &ServerSettings,
        handler: Arc<Handler>,
        shutdown: broadcast::Sender<()>,
    ) -> Self {
        Self {
            addr: settings.addr(),
            handler,
            shutdown,
        }
    }

    pub fn run(&self) {
        let addr = self.addr.clone();
        let handler = self.handler.clone();
        let shutdown_rx = self.shutdown.subscribe();
        tokio::spawn(async move {
            if let Err(e) = run_udp(addr.clone(), handler, shutdown_rx).await {
                error!("udp listener on {} failed: {}", addr, e);
            }
        });

        let addr = self.addr.clone();
        let handler = self.handler.clone();
        let shutdown_rx = self.shutdown.subscribe();
        tokio::spawn(async move {
            if let Err(e) = run_tcp(addr.clone(), handler, shutdown_rx).await {
                error!("tcp listener on {} failed: {}", addr, e);
            }
        });
    }
}

pub async fn run_udp(
    addr: String,
    handler: Arc<Handler>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<()> {
    let socket = Arc::new(UdpSocket::bind(&addr).await?);
    info!("udp listener started on {}", addr);

    let mut buf = vec![0u8; MAX_UDP_PAYLOAD as usize];
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("udp listener on {} stopping", addr);
                return Ok(());
            }
            result = socket.recv_from(&mut buf) => {
                let (len, peer) = result?;
                let data = buf[..len].to_vec();
                let handler = handler.clone();
                let socket = socket.clone();

                tokio::spawn(async move {
                    let request = match Message::from_vec(&data) {
                        Ok(message) => message,
                        Err(e) => {
                            debug!("dropping malformed datagram from {}: {}", peer, e);
                            return;
                        }
                    };

                    let reply = handler.handle_udp(request).await;
                    match reply.to_vec() {
                        Ok(bytes) => {
                            if let Err(e) = send_udp(&socket, &bytes, peer).await {
                                warn!("failed to send reply to {}: {}", peer, e);
                            }
                        }
                        Err(e) => warn!("failed to serialize reply for {}: {}", peer, e),
                    }
                });
            }
        }
    }
}

async fn send_udp(socket: &UdpSocket, bytes: &[u8], peer: SocketAddr) -> Result<()> {
    timeout(CLIENT_IO_TIMEOUT, socket.send_to(bytes, peer))
        .await
        .map_err(|_| MimirError::Timeout)??;
    Ok(())
}

pub async fn run_tcp(
    addr: String,
    handler: Arc<Handler>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<()> {
    let listener = TcpListener::bind(&addr).await?;
    info!("tcp listener started on {}", addr);

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("tcp listener on {} stopping", addr);
                return Ok(());
            }
            result = listener.accept() => {
                let (stream, peer) = result?;
                let handler = handler.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve_tcp_connection(stream, peer, handler).await {
                        debug!("tcp connection from {} ended: {}", peer, e);
                    }
                });
            }
        }
    }
}

/// One client connection: length-prefixed messages, several queries per
/// connection, 5 second read/write deadlines.
async fn serve_tcp_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    handler: Arc<Handler>,
) -> Result<()> {
    loop {
        let mut len_buf = [0u8; 2];
        match timeout(CLIENT_IO_TIMEOUT, stream.read_exact(&mut len_buf)).await {
            Err(_) => break, // idle past the read deadline
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Ok(Err(e)) => return Err(e.into()),
            Ok(Ok(_)) => {}
        }

        let msg_len = u16::from_be_bytes(len_buf) as usize;
        if msg_len == 0 {
            break;
        }

        let mut msg_buf = vec![0u8; msg_len];
        timeout(CLIENT_IO_TIMEOUT, stream.read_exact(&mut msg_buf))
            .await
            .map_err(|_| MimirError::Timeout)??;

        let request = match Message::from_vec(&msg_buf) {
            Ok(message) => message,
            Err(e) => {
                debug!("dropping malformed message from {}: {}", peer, e);
                break;
            }
        };

        let reply = handler.handle_tcp(request).await;
        let bytes = reply.to_vec()?;

        timeout(CLIENT_IO_TIMEOUT, async {
            stream
                .write_all(&(bytes.len() as u16).to_be_bytes())
                .await?;
            stream.write_all(&bytes).await
        })
        .await
        .map_err(|_| MimirError::Timeout)??;
    }

    Ok(())
}
