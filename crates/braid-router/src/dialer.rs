//! Terminal-hop dialing
//!
//! The last hop of a path is a raw URI dialed by the node that receives it.
//! [`TcpRawDialer`] handles `tcp://host:port` plus the in-process `echo`
//! sink; hosts can install their own [`RawDialer`] to add schemes.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

use braid_common::{path, BraidError, Result};

/// Any bidirectional byte stream usable as a session endpoint
pub trait RawStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> RawStream for T {}

/// Boxed stream returned by dialers and accepted by `Router::dial`
pub type BoxedStream = Box<dyn RawStream>;

/// Pluggable terminal-hop dialer
#[async_trait]
pub trait RawDialer: Send + Sync {
    /// Dial a terminal URI on behalf of session `sid`.
    async fn dial(&self, sid: u64, uri: &str) -> Result<BoxedStream>;
}

/// Default dialer: `tcp://host:port` connects, `echo` loops back in-process
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpRawDialer;

#[async_trait]
impl RawDialer for TcpRawDialer {
    async fn dial(&self, sid: u64, uri: &str) -> Result<BoxedStream> {
        if uri == path::ECHO_URI {
            return Ok(echo_stream());
        }
        match path::scheme(uri) {
            Some("tcp") => {
                let target = &uri["tcp://".len()..];
                if target == path::ECHO_URI {
                    return Ok(echo_stream());
                }
                if target.is_empty() {
                    return Err(BraidError::DialFailed(format!("no host in {}", uri)));
                }
                debug!(sid, target, "dialing terminal tcp");
                let stream = TcpStream::connect(target)
                    .await
                    .map_err(|e| BraidError::DialFailed(format!("connect {}: {}", target, e)))?;
                Ok(Box::new(stream))
            }
            Some(other) => Err(BraidError::UnsupportedScheme(other.to_string())),
            None => Err(BraidError::UnsupportedScheme(uri.to_string())),
        }
    }
}

/// In-process echo endpoint: everything written comes straight back.
fn echo_stream() -> BoxedStream {
    let (near, far) = tokio::io::duplex(16 * 1024);
    tokio::spawn(async move {
        let (mut rd, mut wr) = tokio::io::split(far);
        let _ = tokio::io::copy(&mut rd, &mut wr).await;
    });
    Box::new(near)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_echo_roundtrip() {
        let dialer = TcpRawDialer;
        let mut stream = dialer.dial(1, "echo").await.unwrap();
        stream.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn test_tcp_echo_alias() {
        let dialer = TcpRawDialer;
        assert!(dialer.dial(1, "tcp://echo").await.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_scheme_rejected() {
        let dialer = TcpRawDialer;
        assert!(matches!(
            dialer.dial(1, "udp://x:1").await,
            Err(BraidError::UnsupportedScheme(_))
        ));
        assert!(matches!(
            dialer.dial(1, "nonsense").await,
            Err(BraidError::UnsupportedScheme(_))
        ));
    }

    #[tokio::test]
    async fn test_tcp_connect() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let dialer = TcpRawDialer;
        assert!(dialer.dial(1, &format!("tcp://{}", addr)).await.is_ok());
    }

    #[tokio::test]
    async fn test_tcp_connect_refused() {
        let dialer = TcpRawDialer;
        // port 1 on loopback is almost certainly closed
        let result = dialer.dial(1, "tcp://127.0.0.1:1").await;
        assert!(matches!(result, Err(BraidError::DialFailed(_))));
    }
}
