//! PROXY protocol support: v2 header generation for upstream dials and
//! v1/v2 header ingestion when running behind another load balancer.
//!
//! Wire format (from the HAProxy PROXY protocol spec):
//! - 12 bytes signature
//! - 1 byte version and command
//! - 1 byte address family and transport protocol
//! - 2 bytes address length
//! - variable: addresses and ports

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::time::timeout;

/// PROXY protocol v2 signature (12 bytes).
const V2_SIGNATURE: [u8; 12] = [
    0x0D, 0x0A, 0x0D, 0x0A, 0x00, 0x0D, 0x0A, 0x51, 0x55, 0x49, 0x54, 0x0A,
];

/// Version 2 with PROXY command (high nibble = version, low nibble = command).
const VERSION_COMMAND_PROXY: u8 = 0x21;

/// Address family: AF_INET (IPv4).
const AF_INET: u8 = 0x10;

/// Address family: AF_INET6 (IPv6).
const AF_INET6: u8 = 0x20;

/// Transport protocol: STREAM (TCP).
const TRANSPORT_STREAM: u8 = 0x01;

/// Encode a PROXY v2 header identifying `src` as the original client and
/// `dst` as the dialed peer.
pub fn encode_v2(src: SocketAddr, dst: SocketAddr) -> Vec<u8> {
    match (src.ip(), dst.ip()) {
        (IpAddr::V4(src_ip), IpAddr::V4(dst_ip)) => {
            encode_v2_v4(src_ip, src.port(), dst_ip, dst.port())
        }
        (IpAddr::V6(src_ip), IpAddr::V6(dst_ip)) => {
            encode_v2_v6(src_ip, src.port(), dst_ip, dst.port())
        }
        // Mixed families: collapse mapped v6 addresses down to v4.
        (IpAddr::V4(src_ip), IpAddr::V6(dst_ip)) => {
            let dst_ip = dst_ip.to_ipv4_mapped().unwrap_or(Ipv4Addr::UNSPECIFIED);
            encode_v2_v4(src_ip, src.port(), dst_ip, dst.port())
        }
        (IpAddr::V6(src_ip), IpAddr::V4(dst_ip)) => {
            let src_ip = src_ip.to_ipv4_mapped().unwrap_or(Ipv4Addr::UNSPECIFIED);
            encode_v2_v4(src_ip, src.port(), dst_ip, dst.port())
        }
    }
}

fn encode_v2_v4(src_ip: Ipv4Addr, src_port: u16, dst_ip: Ipv4Addr, dst_port: u16) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16 + 12);
    buf.extend_from_slice(&V2_SIGNATURE);
    buf.push(VERSION_COMMAND_PROXY);
    buf.push(AF_INET | TRANSPORT_STREAM);
    buf.extend_from_slice(&12u16.to_be_bytes());
    buf.extend_from_slice(&src_ip.octets());
    buf.extend_from_slice(&dst_ip.octets());
    buf.extend_from_slice(&src_port.to_be_bytes());
    buf.extend_from_slice(&dst_port.to_be_bytes());
    buf
}

fn encode_v2_v6(src_ip: Ipv6Addr, src_port: u16, dst_ip: Ipv6Addr, dst_port: u16) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16 + 36);
    buf.extend_from_slice(&V2_SIGNATURE);
    buf.push(VERSION_COMMAND_PROXY);
    buf.push(AF_INET6 | TRANSPORT_STREAM);
    buf.extend_from_slice(&36u16.to_be_bytes());
    buf.extend_from_slice(&src_ip.octets());
    buf.extend_from_slice(&dst_ip.octets());
    buf.extend_from_slice(&src_port.to_be_bytes());
    buf.extend_from_slice(&dst_port.to_be_bytes());
    buf
}

/// Parse a PROXY v2 address block (the bytes after the 16-byte preamble).
fn parse_v2_addresses(family_protocol: u8, data: &[u8]) -> Option<(SocketAddr, SocketAddr)> {
    match family_protocol {
        x if x == (AF_INET | TRANSPORT_STREAM) => {
            if data.len() < 12 {
                return None;
            }
            let src_ip = Ipv4Addr::new(data[0], data[1], data[2], data[3]);
            let dst_ip = Ipv4Addr::new(data[4], data[5], data[6], data[7]);
            let src_port = u16::from_be_bytes([data[8], data[9]]);
            let dst_port = u16::from_be_bytes([data[10], data[11]]);
            Some((
                SocketAddr::new(IpAddr::V4(src_ip), src_port),
                SocketAddr::new(IpAddr::V4(dst_ip), dst_port),
            ))
        }
        x if x == (AF_INET6 | TRANSPORT_STREAM) => {
            if data.len() < 36 {
                return None;
            }
            let src_octets: [u8; 16] = data[..16].try_into().ok()?;
            let dst_octets: [u8; 16] = data[16..32].try_into().ok()?;
            let src_port = u16::from_be_bytes([data[32], data[33]]);
            let dst_port = u16::from_be_bytes([data[34], data[35]]);
            Some((
                SocketAddr::new(IpAddr::V6(src_octets.into()), src_port),
                SocketAddr::new(IpAddr::V6(dst_octets.into()), dst_port),
            ))
        }
        _ => None,
    }
}

/// Parse a full PROXY v2 header from a byte slice.
///
/// Returns the advertised source/destination pair and the number of bytes
/// consumed. Used by tests that assert on what an upstream received.
pub fn parse_v2(data: &[u8]) -> Option<(SocketAddr, SocketAddr, usize)> {
    if data.len() < 16 || data[..12] != V2_SIGNATURE || data[12] != VERSION_COMMAND_PROXY {
        return None;
    }
    let addr_len = u16::from_be_bytes([data[14], data[15]]) as usize;
    if data.len() < 16 + addr_len {
        return None;
    }
    let (src, dst) = parse_v2_addresses(data[13], &data[16..16 + addr_len])?;
    Some((src, dst, 16 + addr_len))
}

/// Parse a textual PROXY v1 line (without the trailing CRLF):
/// `PROXY TCP4 <src-ip> <dst-ip> <src-port> <dst-port>`.
fn parse_v1_line(line: &str) -> Option<(SocketAddr, SocketAddr)> {
    let mut parts = line.split(' ');
    if parts.next()? != "PROXY" {
        return None;
    }
    match parts.next()? {
        "TCP4" | "TCP6" => {}
        // `PROXY UNKNOWN` is valid but carries no addresses.
        _ => return None,
    }
    let src_ip: IpAddr = parts.next()?.parse().ok()?;
    let dst_ip: IpAddr = parts.next()?.parse().ok()?;
    let src_port: u16 = parts.next()?.parse().ok()?;
    let dst_port: u16 = parts.next()?.parse().ok()?;
    Some((
        SocketAddr::new(src_ip, src_port),
        SocketAddr::new(dst_ip, dst_port),
    ))
}

/// Consume an inbound PROXY v1/v2 header from an accepted socket, bounded
/// by `header_timeout`.
///
/// Returns the advertised source address, or `None` when the stream does
/// not begin with a PROXY header (the stream is left untouched in that
/// case; detection uses `peek`).
pub async fn read_inbound_header(
    stream: &mut TcpStream,
    header_timeout: Duration,
) -> io::Result<Option<SocketAddr>> {
    timeout(header_timeout, read_inbound_header_inner(stream))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "proxy protocol header timeout"))?
}

async fn read_inbound_header_inner(stream: &mut TcpStream) -> io::Result<Option<SocketAddr>> {
    // A one-byte peek is enough to discriminate: the v2 signature starts
    // with 0x0D, a v1 line with 'P'. Neither is a valid first byte of a
    // handshake frame, so a bare client is passed through untouched.
    let mut probe = [0u8; 1];
    let n = stream.peek(&mut probe).await?;
    if n == 0 {
        return Ok(None);
    }

    if probe[0] == V2_SIGNATURE[0] {
        let mut preamble = [0u8; 16];
        stream.read_exact(&mut preamble).await?;
        if preamble[..12] != V2_SIGNATURE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "malformed proxy v2 signature",
            ));
        }
        let version_command = preamble[12];
        let family_protocol = preamble[13];
        let addr_len = u16::from_be_bytes([preamble[14], preamble[15]]) as usize;

        let mut addresses = vec![0u8; addr_len];
        stream.read_exact(&mut addresses).await?;

        if version_command != VERSION_COMMAND_PROXY {
            // LOCAL command: keep the socket address as-is.
            return Ok(None);
        }
        let parsed = parse_v2_addresses(family_protocol, &addresses).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "malformed proxy v2 header")
        })?;
        return Ok(Some(parsed.0));
    }

    if probe[0] == b'P' {
        // Read byte-wise up to CRLF; v1 lines are at most 107 bytes.
        let mut line = Vec::with_capacity(64);
        loop {
            let byte = stream.read_u8().await?;
            if byte == b'\n' {
                break;
            }
            line.push(byte);
            if line.len() > 107 {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "oversized proxy v1 header",
                ));
            }
        }
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        let text = std::str::from_utf8(&line)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "malformed proxy v1 header"))?;
        return Ok(parse_v1_line(text).map(|(src, _)| src));
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    #[test]
    fn encode_v2_ipv4_layout() {
        let encoded = encode_v2(
            "192.168.1.1:12345".parse().unwrap(),
            "10.0.0.1:25565".parse().unwrap(),
        );
        assert_eq!(encoded.len(), 28);
        assert_eq!(&encoded[..12], &V2_SIGNATURE);
        assert_eq!(encoded[12], VERSION_COMMAND_PROXY);
        assert_eq!(encoded[13], AF_INET | TRANSPORT_STREAM);
        assert_eq!(u16::from_be_bytes([encoded[14], encoded[15]]), 12);

        let (src, dst) = parse_v2_addresses(encoded[13], &encoded[16..]).unwrap();
        assert_eq!(src, "192.168.1.1:12345".parse().unwrap());
        assert_eq!(dst, "10.0.0.1:25565".parse().unwrap());
    }

    #[test]
    fn encode_v2_ipv6_layout() {
        let encoded = encode_v2(
            "[2001:db8::1]:12345".parse().unwrap(),
            "[2001:db8::2]:25565".parse().unwrap(),
        );
        assert_eq!(encoded.len(), 52);
        assert_eq!(encoded[13], AF_INET6 | TRANSPORT_STREAM);

        let (src, dst) = parse_v2_addresses(encoded[13], &encoded[16..]).unwrap();
        assert_eq!(src, "[2001:db8::1]:12345".parse().unwrap());
        assert_eq!(dst, "[2001:db8::2]:25565".parse().unwrap());
    }

    #[test]
    fn parse_v1_line_formats() {
        let (src, dst) =
            parse_v1_line("PROXY TCP4 203.0.113.7 10.0.0.1 4242 25565").unwrap();
        assert_eq!(src, "203.0.113.7:4242".parse().unwrap());
        assert_eq!(dst, "10.0.0.1:25565".parse().unwrap());

        assert!(parse_v1_line("PROXY UNKNOWN").is_none());
        assert!(parse_v1_line("GET / HTTP/1.1").is_none());
    }

    async fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn inbound_v2_header_rewrites_source() {
        let (mut client, mut server) = connected_pair().await;
        let header = encode_v2(
            "203.0.113.7:4242".parse().unwrap(),
            "10.0.0.1:25565".parse().unwrap(),
        );
        client.write_all(&header).await.unwrap();
        client.write_all(b"rest").await.unwrap();

        let src = read_inbound_header(&mut server, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(src, Some("203.0.113.7:4242".parse().unwrap()));

        let mut rest = [0u8; 4];
        server.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest, b"rest");
    }

    #[tokio::test]
    async fn inbound_v1_header_rewrites_source() {
        let (mut client, mut server) = connected_pair().await;
        client
            .write_all(b"PROXY TCP4 203.0.113.7 10.0.0.1 4242 25565\r\npayload")
            .await
            .unwrap();

        let src = read_inbound_header(&mut server, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(src, Some("203.0.113.7:4242".parse().unwrap()));

        let mut rest = [0u8; 7];
        server.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest, b"payload");
    }

    #[tokio::test]
    async fn inbound_without_header_leaves_stream_untouched() {
        let (mut client, mut server) = connected_pair().await;
        client.write_all(b"\x10\x00minecraft...").await.unwrap();

        let src = read_inbound_header(&mut server, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(src, None);

        let mut first = [0u8; 2];
        server.read_exact(&mut first).await.unwrap();
        assert_eq!(&first, b"\x10\x00");
    }
}
