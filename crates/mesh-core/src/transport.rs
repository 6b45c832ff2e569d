//! Transport primitives (C1): family-aware TCP connect/listen and the
//! HTTP-decoy stream wrapper.
//!
//! Connect picks a concrete mechanism from the target endpoint and the
//! node's proxy configuration: a direct TCP dial, a dial relayed through a
//! configured HTTP or SOCKS5 proxy, or a dial through the anonymity
//! overlay's own SOCKS5 endpoint. Each mechanism carries its own timeout
//! (§4.1) and a failed attempt is never retried here — the caller decides.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use crate::config::{NodeConfig, ProxyKind};
use crate::endpoint::{Endpoint, TransportKind};
use crate::error::CoreError;

/// Which side of a freshly-opened stream is about to run the HTTP decoy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoyRole {
    Client,
    Server,
}

/// Dial `endpoint`, returning a connected stream. The concrete mechanism is
/// selected by `kind` and the node's configured proxy; failure is returned
/// immediately, uncategorized beyond `CoreError::Unreachable` /
/// `CoreError::Timeout` — there is no internal retry.
pub async fn connect(
    cfg: &NodeConfig,
    kind: TransportKind,
    endpoint: &Endpoint,
) -> Result<TcpStream, CoreError> {
    let budget = match kind {
        TransportKind::LocalNetwork => cfg.connect_timeout_lan,
        TransportKind::AnonymityOverlay => cfg.connect_timeout_overlay,
        TransportKind::IPv4Internet | TransportKind::IPv6Internet => cfg.connect_timeout_internet,
    };

    let fut = dispatch_connect(cfg, kind, endpoint);
    match timeout(budget, fut).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(CoreError::Unreachable(e.to_string())),
        Err(_) => Err(CoreError::Timeout(budget)),
    }
}

async fn dispatch_connect(
    cfg: &NodeConfig,
    kind: TransportKind,
    endpoint: &Endpoint,
) -> io::Result<TcpStream> {
    if kind == TransportKind::AnonymityOverlay || cfg.overlay_only {
        let socks_addr = overlay_socks_addr(cfg.service_port);
        return socks5_connect(socks_addr, endpoint).await;
    }

    if let Some(proxy) = &cfg.proxy {
        return match proxy.kind {
            ProxyKind::Socks5 => socks5_connect(proxy.addr, endpoint).await,
            ProxyKind::Http => http_proxy_connect(proxy.addr, endpoint).await,
        };
    }

    match endpoint.to_socket_addr() {
        Some(addr) => TcpStream::connect(addr).await,
        None => Err(io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            "domain endpoint requires a proxy or the anonymity overlay",
        )),
    }
}

/// The anonymity-overlay adapter (C9) exposes its SOCKS5 endpoint on
/// `(loopback, service_port + 2)`.
pub(crate) fn overlay_socks_addr(service_port: u16) -> SocketAddr {
    SocketAddr::new(std::net::Ipv4Addr::LOCALHOST.into(), service_port.wrapping_add(2))
}

/// Minimal SOCKS5 client: no-auth handshake followed by a CONNECT request.
/// See RFC 1928. Domain endpoints are sent as `ATYP=0x03` so the proxy (or
/// the overlay controller) performs the name resolution.
async fn socks5_connect(proxy_addr: SocketAddr, target: &Endpoint) -> io::Result<TcpStream> {
    let mut stream = TcpStream::connect(proxy_addr).await?;

    // Greeting: version 5, one auth method, "no auth".
    stream.write_all(&[0x05, 0x01, 0x00]).await?;
    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await?;
    if reply != [0x05, 0x00] {
        return Err(io::Error::new(io::ErrorKind::Other, "SOCKS5 auth negotiation rejected"));
    }

    let mut request = vec![0x05, 0x01, 0x00];
    match target {
        Endpoint::V4(ip, port) => {
            request.push(0x01);
            request.extend_from_slice(&ip.octets());
            request.extend_from_slice(&port.to_be_bytes());
        }
        Endpoint::V6(ip, port) => {
            request.push(0x04);
            request.extend_from_slice(&ip.octets());
            request.extend_from_slice(&port.to_be_bytes());
        }
        Endpoint::Domain(host, port) => {
            request.push(0x03);
            request.push(host.len() as u8);
            request.extend_from_slice(host.as_bytes());
            request.extend_from_slice(&port.to_be_bytes());
        }
    }
    stream.write_all(&request).await?;

    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[1] != 0x00 {
        return Err(io::Error::new(io::ErrorKind::Other, format!("SOCKS5 CONNECT failed, code {}", head[1])));
    }
    // Skip the bound address the proxy reports back; length depends on ATYP.
    let skip = match head[3] {
        0x01 => 4,
        0x04 => 16,
        0x03 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            len[0] as usize
        }
        other => return Err(io::Error::new(io::ErrorKind::Other, format!("unknown SOCKS5 ATYP {}", other))),
    };
    let mut discard = vec![0u8; skip + 2];
    stream.read_exact(&mut discard).await?;

    Ok(stream)
}

/// Minimal HTTP CONNECT proxy client, mirroring `edge-gateway`'s
/// hand-rolled CONNECT handling on the server side.
async fn http_proxy_connect(proxy_addr: SocketAddr, target: &Endpoint) -> io::Result<TcpStream> {
    let mut stream = TcpStream::connect(proxy_addr).await?;
    let host = match target {
        Endpoint::V4(ip, port) => format!("{}:{}", ip, port),
        Endpoint::V6(ip, port) => format!("[{}]:{}", ip, port),
        Endpoint::Domain(h, port) => format!("{}:{}", h, port),
    };
    stream
        .write_all(format!("CONNECT {host} HTTP/1.1\r\nHost: {host}\r\n\r\n").as_bytes())
        .await?;

    let mut buf = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    loop {
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "proxy closed before CONNECT response"));
        }
        buf.push(byte[0]);
        if buf.ends_with(b"\r\n\r\n") {
            break;
        }
        if buf.len() > 8192 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "CONNECT response too large"));
        }
    }
    let status_line = buf.split(|&b| b == b'\n').next().unwrap_or(&[]);
    if !status_line.windows(3).any(|w| w == b"200") {
        return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "HTTP proxy refused CONNECT"));
    }
    Ok(stream)
}

/// Bind a listener for `bind_endpoint`. The caller is responsible for
/// running two listeners (one per family) when dual-stack binding is not
/// available on the target OS; this function itself only opens the single
/// socket it is asked for.
pub async fn listen(bind_endpoint: &Endpoint) -> Result<TcpListener, CoreError> {
    let addr = bind_endpoint
        .to_socket_addr()
        .ok_or_else(|| CoreError::Unreachable("cannot listen on a domain endpoint".into()))?;
    TcpListener::bind(addr).await.map_err(CoreError::Io)
}

/// Wrap the first bytes of `stream` in a cosmetic HTTP/1.1 CONNECT
/// request/response so the stream is indistinguishable, to a passive
/// observer, from an ordinary HTTP exchange (spec §4.1).
pub async fn wrap_http_decoy(stream: &mut TcpStream, role: DecoyRole) -> Result<(), CoreError> {
    match role {
        DecoyRole::Client => {
            stream
                .write_all(b"CONNECT peer.mesh HTTP/1.1\r\n\r\n")
                .await
                .map_err(CoreError::Io)?;
            read_until_double_crlf(stream).await
        }
        DecoyRole::Server => {
            read_until_double_crlf(stream).await?;
            stream
                .write_all(b"HTTP/1.1 200 OK\r\n\r\n")
                .await
                .map_err(CoreError::Io)?;
            Ok(())
        }
    }
}

/// Read bytes one at a time until four consecutive CR/LF bytes have been
/// seen — the counter increments on any byte that is `\r` or `\n` and
/// resets on any other byte. End-of-stream before completion fails with
/// `DecoyAborted`.
async fn read_until_double_crlf(stream: &mut TcpStream) -> Result<(), CoreError> {
    let mut count = 0usize;
    let mut byte = [0u8; 1];
    loop {
        let n = stream.read(&mut byte).await.map_err(CoreError::Io)?;
        if n == 0 {
            return Err(CoreError::DecoyAborted);
        }
        if byte[0] == b'\r' || byte[0] == b'\n' {
            count += 1;
            if count == 4 {
                return Ok(());
            }
        } else {
            count = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt as _;
    use tokio::net::{TcpListener, TcpStream};

    #[tokio::test]
    async fn http_decoy_round_trip_then_plain_bytes_pass_through() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            wrap_http_decoy(&mut stream, DecoyRole::Server).await.unwrap();
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"hello");
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        wrap_http_decoy(&mut client, DecoyRole::Client).await.unwrap();
        client.write_all(b"hello").await.unwrap();

        server.await.unwrap();
    }

    #[tokio::test]
    async fn four_consecutive_cr_or_lf_bytes_complete_the_decoy_even_out_of_order() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            wrap_http_decoy(&mut stream, DecoyRole::Server).await.unwrap();
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"hello");
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        // Not the literal "\r\n\r\n" the client itself would send, but four
        // CR/LF bytes in a row per the documented counter algorithm.
        client.write_all(b"CONNECT x HTTP/1.1\r\r\n\n").await.unwrap();
        client.write_all(b"hello").await.unwrap();

        server.await.unwrap();
    }

    #[tokio::test]
    async fn decoy_aborts_on_premature_eof() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let result = wrap_http_decoy(&mut stream, DecoyRole::Server).await;
            assert!(matches!(result, Err(CoreError::DecoyAborted)));
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"CONNECT x HTTP/1.1\r\n").await.unwrap();
        drop(client);

        server.await.unwrap();
    }

    #[tokio::test]
    async fn listen_binds_requested_endpoint() {
        let ep = Endpoint::V4(std::net::Ipv4Addr::LOCALHOST, 0);
        let listener = listen(&ep).await.unwrap();
        assert!(listener.local_addr().unwrap().port() > 0);
    }
}
