//! Console helpers
//!
//! Operator-facing conveniences on top of a running router:
//!
//! - `ping` dials the in-process echo sink at the far end of a path and
//!   measures round trips;
//! - `proxy_exec` spawns a subprocess whose TCP egress is rewritten through
//!   a loopback SOCKS5 listener bound to the router;
//! - `proxy_ssh` execs an SSH client whose ProxyCommand dials the target
//!   through the mesh, optionally fetching the key from a mesh-reachable
//!   key service first;
//! - `print_state` fetches a node's state endpoint and renders it.

use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::{Duration, Instant, SystemTime};

use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::Request;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info};

use braid_router::{Router, RouterState};

use crate::socks::SocksProxy;

/// Payload size of each ping round
const PING_PAYLOAD: usize = 64;

/// Append the echo hop when the path does not already end in one.
fn echo_path(path: &str) -> String {
    if path.is_empty() {
        return "tcp://echo".to_string();
    }
    if path.contains("tcp://echo") || path == "echo" {
        return path.to_string();
    }
    format!("{}->tcp://echo", path)
}

/// Dial the echo sink over `path` repeatedly and report round-trip times.
///
/// `count` of zero pings until interrupted.
pub async fn ping(router: &Router, path: &str, count: u64, delay: Duration) -> anyhow::Result<()> {
    let uri = echo_path(path);
    let mut seq: u64 = 0;
    while count == 0 || seq < count {
        seq += 1;
        let start = Instant::now();
        let mut session = match router.dial_stream(&uri).await {
            Ok(session) => session,
            Err(e) => {
                println!("ping {} seq={} dial failed: {}", uri, seq, e);
                tokio::time::sleep(delay).await;
                continue;
            }
        };

        let mut payload = [0u8; PING_PAYLOAD];
        payload[..8].copy_from_slice(&seq.to_be_bytes());

        if let Err(e) = session.write_all(&payload).await {
            println!("ping {} seq={} write failed: {}", uri, seq, e);
            tokio::time::sleep(delay).await;
            continue;
        }
        let mut reply = [0u8; PING_PAYLOAD];
        if let Err(e) = session.read_exact(&mut reply).await {
            println!("ping {} seq={} read failed: {}", uri, seq, e);
            tokio::time::sleep(delay).await;
            continue;
        }

        println!(
            "{} bytes from {}: seq={} time={:.2?}",
            PING_PAYLOAD,
            uri,
            seq,
            start.elapsed()
        );
        tokio::time::sleep(delay).await;
    }
    Ok(())
}

/// Run a command with its TCP egress proxied through the router.
///
/// A loopback SOCKS5 listener is bound on an ephemeral port and handed to
/// the subprocess via the usual proxy environment variables; it is torn down
/// when the process exits.
pub async fn proxy_exec(
    router: Router,
    template: &str,
    command: &[String],
) -> anyhow::Result<i32> {
    let (program, args) = command
        .split_first()
        .ok_or_else(|| anyhow::anyhow!("empty command"))?;

    let proxy = SocksProxy::new(router, template);
    let (addr, handle) = proxy.start("127.0.0.1:0").await?;
    let proxy_url = format!("socks5://{}", addr);
    info!(%proxy_url, program = %program, "running command through mesh");

    let status = tokio::process::Command::new(program)
        .args(args)
        .env("ALL_PROXY", &proxy_url)
        .env("HTTP_PROXY", &proxy_url)
        .env("HTTPS_PROXY", &proxy_url)
        .env("all_proxy", &proxy_url)
        .status()
        .await;

    handle.abort();
    Ok(status?.code().unwrap_or(-1))
}

/// Append the default SSH terminal hop when the path has none.
fn ssh_target(uri: &str) -> String {
    if uri.is_empty() {
        return "tcp://127.0.0.1:22".to_string();
    }
    if uri.contains("tcp://") {
        return uri.to_string();
    }
    format!("{}->tcp://127.0.0.1:22", uri)
}

/// Host alias for a path: separators flattened so it is a valid hostname.
fn host_alias(uri: &str) -> String {
    uri.replace("->", "_").replace("://", "_").replace(':', "_")
}

/// Percent-encode a query value.
fn query_escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => {
                out.push('%');
                out.push_str(&format!("{:02X}", byte));
            }
        }
    }
    out
}

/// Fetch the private key for `uri` from a key service reachable over the
/// mesh: HTTP/1 spoken across a dialed session.
async fn fetch_ssh_key(router: &Router, key_path: &str, uri: &str) -> anyhow::Result<Vec<u8>> {
    let session = router.dial_stream(key_path).await?;
    let io = TokioIo::new(session);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await?;
    tokio::spawn(conn);

    let request = Request::builder()
        .uri(format!("/ssh-key?uri={}", query_escape(uri)))
        .header("host", "braid")
        .body(Empty::<Bytes>::new())?;
    let response = sender.send_request(request).await?;
    if !response.status().is_success() {
        anyhow::bail!("key service returned {}", response.status());
    }
    Ok(response.collect().await?.to_bytes().to_vec())
}

/// Write a fetched key to a temp file ssh will accept.
fn write_key_file(key: &[u8]) -> anyhow::Result<PathBuf> {
    let stamp = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let path = std::env::temp_dir().join(format!("braid-ssh-{}-{}", std::process::id(), stamp));

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(&path)?;
    file.write_all(key)?;
    Ok(path)
}

/// Run an SSH client whose transport rides the mesh.
///
/// A loopback SOCKS5 listener is pinned to the target path and the client
/// is exec'd with `ProxyCommand` pointed at it, so the SSH connection
/// itself tunnels through the router. When `key_path` names a key service,
/// the private key is fetched over the mesh first and passed via `-i`.
/// The literal `bshost` in `extra_args` is replaced with the host alias.
pub async fn proxy_ssh(
    router: Router,
    uri: &str,
    key_path: Option<&str>,
    command: &str,
    proxy_command: &str,
    extra_args: &[String],
) -> anyhow::Result<i32> {
    let target = ssh_target(uri);
    let alias = host_alias(&target);

    let proxy = SocksProxy::new(router.clone(), target.clone());
    let (addr, handle) = proxy.start("127.0.0.1:0").await?;
    info!(%addr, target = %target, "ssh transport through mesh");

    let mut args: Vec<String> = vec![
        "-o".into(),
        format!(
            "ProxyCommand={}",
            proxy_command.replace("${PROXY}", &addr.to_string())
        ),
    ];

    let mut key_file = None;
    if let Some(key_path) = key_path {
        match fetch_ssh_key(&router, key_path, &target).await {
            Ok(key) => {
                let path = write_key_file(&key)?;
                args.push("-i".into());
                args.push(path.to_string_lossy().into_owned());
                info!(key_path, "using ssh key fetched over the mesh");
                key_file = Some(path);
            }
            Err(e) => debug!(key_path, "no remote ssh key: {}", e),
        }
    }

    if command == "ssh" {
        args.push(alias.clone());
    }
    args.extend(extra_args.iter().map(|arg| arg.replace("bshost", &alias)));

    let status = tokio::process::Command::new(command)
        .args(&args)
        .status()
        .await;

    handle.abort();
    if let Some(path) = key_file {
        let _ = std::fs::remove_file(path);
    }
    Ok(status?.code().unwrap_or(-1))
}

/// Fetch a node's `GET /state` snapshot.
pub async fn fetch_state(addr: SocketAddr) -> anyhow::Result<RouterState> {
    let stream = TcpStream::connect(addr).await?;
    let io = TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await?;
    tokio::spawn(conn);

    let request = Request::builder()
        .uri("/state")
        .header("host", addr.to_string())
        .body(Empty::<Bytes>::new())?;
    let response = sender.send_request(request).await?;
    if !response.status().is_success() {
        anyhow::bail!("state endpoint returned {}", response.status());
    }
    let body = response.collect().await?.to_bytes();
    Ok(serde_json::from_slice(&body)?)
}

/// Fetch and pretty-print a node's state.
pub async fn print_state(addr: SocketAddr) -> anyhow::Result<()> {
    let state = fetch_state(addr).await?;
    println!("{}", render_state(&state));
    Ok(())
}

fn render_state(state: &RouterState) -> String {
    use std::fmt::Write;

    let mut out = String::new();
    let _ = writeln!(out, "node {}", state.name);
    let _ = writeln!(out, "\n[channels]");
    for bond in &state.bonds {
        let _ = writeln!(out, " ->{}", bond.name);
        for chan in &bond.channels {
            let _ = writeln!(
                out,
                "   {} used={:<4} idle={:>5}ms  {}  {}",
                chan.index,
                chan.used,
                chan.idle_ms,
                chan.connected_at.format("%Y-%m-%d %H:%M:%S"),
                chan.remote,
            );
        }
    }
    let _ = writeln!(out, "\n[table]");
    for session in &state.sessions {
        let _ = writeln!(
            out,
            " {} {}/{} <-> {} {}/{}",
            session.from.label,
            session.from.id,
            session.from.sid,
            session.to.label,
            session.to.id,
            session.to.sid,
        );
    }
    out
}
