//! SOCKS5 front-end
//!
//! Accepts local SOCKS5 clients and dials their CONNECT targets through the
//! router. The requested `host:port` is substituted into the configured path
//! template (`${HOST}`), so a template like `master->tcp://${HOST}` sends
//! everything through the mesh while `tcp://${HOST}` dials locally.
//!
//! Only what local tooling needs is implemented: no-auth handshake, CONNECT,
//! IPv4 and domain address types.

use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use braid_router::Router;

const SOCKS_VERSION: u8 = 0x05;

/// SOCKS5 acceptor bound to one router
pub struct SocksProxy {
    router: Router,
    template: String,
}

impl SocksProxy {
    pub fn new(router: Router, template: impl Into<String>) -> Self {
        Self {
            router,
            template: template.into(),
        }
    }

    /// Bind and start accepting; returns the bound address and the accept
    /// task handle (abort it to stop the proxy).
    pub async fn start(self, addr: &str) -> anyhow::Result<(SocketAddr, JoinHandle<()>)> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        info!(%local, template = %self.template, "socks5 proxy listening");

        let handle = tokio::spawn(async move {
            loop {
                let (stream, peer) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("socks accept failed: {}", e);
                        continue;
                    }
                };
                let router = self.router.clone();
                let template = self.template.clone();
                tokio::spawn(async move {
                    if let Err(e) = proc_conn(router, template, stream, peer).await {
                        debug!(%peer, "socks connection ended: {}", e);
                    }
                });
            }
        });
        Ok((local, handle))
    }
}

/// Drive one SOCKS5 client: handshake, CONNECT, then pump bytes.
async fn proc_conn(
    router: Router,
    template: String,
    mut stream: TcpStream,
    peer: SocketAddr,
) -> anyhow::Result<()> {
    let target = match handshake(&mut stream).await? {
        Some(target) => target,
        None => return Ok(()), // rejected inside handshake
    };

    let dial_path = template.replace("${HOST}", &target);
    debug!(%peer, %target, path = %dial_path, "socks dial");

    let mut session = match router.dial_stream(&dial_path).await {
        Ok(session) => session,
        Err(e) => {
            info!(%peer, %target, "socks dial failed: {}", e);
            // REP 0x04: host unreachable
            let _ = stream
                .write_all(&[SOCKS_VERSION, 0x04, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await;
            return Ok(());
        }
    };

    // REP 0x00: succeeded, bound address zeroed
    stream
        .write_all(&[SOCKS_VERSION, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
        .await?;

    let _ = tokio::io::copy_bidirectional(&mut stream, &mut session).await;
    Ok(())
}

/// Method negotiation and CONNECT request; returns the `host:port` target,
/// or None after replying with a SOCKS error.
async fn handshake(stream: &mut TcpStream) -> anyhow::Result<Option<String>> {
    // Greeting: VER NMETHODS METHODS…
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await?;
    if head[0] != SOCKS_VERSION {
        anyhow::bail!("unsupported socks version {:#04x}", head[0]);
    }
    let mut methods = vec![0u8; head[1] as usize];
    stream.read_exact(&mut methods).await?;
    // No authentication
    stream.write_all(&[SOCKS_VERSION, 0x00]).await?;

    // Request: VER CMD RSV ATYP …
    let mut request = [0u8; 4];
    stream.read_exact(&mut request).await?;
    if request[0] != SOCKS_VERSION {
        anyhow::bail!("unsupported socks version {:#04x}", request[0]);
    }
    if request[1] != 0x01 {
        // REP 0x07: command not supported
        stream
            .write_all(&[SOCKS_VERSION, 0x07, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
            .await?;
        return Ok(None);
    }

    let target = match request[3] {
        // IPv4
        0x01 => {
            let mut addr = [0u8; 6];
            stream.read_exact(&mut addr).await?;
            let port = u16::from_be_bytes([addr[4], addr[5]]);
            format!("{}.{}.{}.{}:{}", addr[0], addr[1], addr[2], addr[3], port)
        }
        // Domain name
        0x03 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut name = vec![0u8; len[0] as usize + 2];
            stream.read_exact(&mut name).await?;
            let port = u16::from_be_bytes([name[len[0] as usize], name[len[0] as usize + 1]]);
            let host = String::from_utf8_lossy(&name[..len[0] as usize]).into_owned();
            format!("{}:{}", host, port)
        }
        atyp => {
            // REP 0x08: address type not supported
            stream
                .write_all(&[SOCKS_VERSION, 0x08, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await?;
            debug!("rejected socks address type {:#04x}", atyp);
            return Ok(None);
        }
    };

    Ok(Some(target))
}
