//! PROXY protocol v1 decoder.
//!
//! One ASCII line, CRLF-terminated, at most 107 bytes including the
//! terminator, read off the raw socket before any TLS handshake:
//!
//! ```text
//! PROXY <TCP4|TCP6|UNKNOWN> <src-ip> <dst-ip> <src-port> <dst-port>\r\n
//! ```
//!
//! The source address becomes the effective client address for forwarded
//! headers. Malformed input drops the connection.

use std::net::{IpAddr, SocketAddr};

use tokio::io::{AsyncRead, AsyncReadExt};

/// Maximum v1 header length including CRLF.
pub const MAX_HEADER_LEN: usize = 107;

/// Decoded header. `UNKNOWN` carries no addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyHeader {
    pub src: Option<SocketAddr>,
    pub dst: Option<SocketAddr>,
}

#[derive(Debug, thiserror::Error)]
pub enum ProxyProtocolError {
    #[error("header exceeds {MAX_HEADER_LEN} bytes")]
    TooLong,
    #[error("malformed PROXY line: {0}")]
    Malformed(&'static str),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Read exactly one v1 header from the stream. Reads byte-wise so nothing
/// past the CRLF is consumed.
pub async fn read_header<S: AsyncRead + Unpin>(
    stream: &mut S,
) -> Result<ProxyHeader, ProxyProtocolError> {
    let mut line = Vec::with_capacity(MAX_HEADER_LEN);
    let mut byte = [0u8; 1];
    loop {
        stream.read_exact(&mut byte).await?;
        line.push(byte[0]);
        if byte[0] == b'\n' {
            break;
        }
        if line.len() >= MAX_HEADER_LEN {
            return Err(ProxyProtocolError::TooLong);
        }
    }
    parse_line(&line)
}

/// Parse a full header line including the CRLF terminator.
pub fn parse_line(line: &[u8]) -> Result<ProxyHeader, ProxyProtocolError> {
    if line.len() > MAX_HEADER_LEN {
        return Err(ProxyProtocolError::TooLong);
    }
    let line = line
        .strip_suffix(b"\r\n")
        .ok_or(ProxyProtocolError::Malformed("missing CRLF terminator"))?;
    let line = std::str::from_utf8(line)
        .map_err(|_| ProxyProtocolError::Malformed("not ASCII"))?;

    let mut fields = line.split(' ');
    if fields.next() != Some("PROXY") {
        return Err(ProxyProtocolError::Malformed("missing PROXY signature"));
    }

    let family = fields
        .next()
        .ok_or(ProxyProtocolError::Malformed("missing protocol family"))?;
    match family {
        // Senders may append address data after UNKNOWN; it carries no
        // meaning and is ignored.
        "UNKNOWN" => Ok(ProxyHeader {
            src: None,
            dst: None,
        }),
        "TCP4" | "TCP6" => {
            let src_ip = parse_ip(fields.next(), family)?;
            let dst_ip = parse_ip(fields.next(), family)?;
            let src_port = parse_port(fields.next())?;
            let dst_port = parse_port(fields.next())?;
            if fields.next().is_some() {
                return Err(ProxyProtocolError::Malformed("trailing fields"));
            }
            Ok(ProxyHeader {
                src: Some(SocketAddr::new(src_ip, src_port)),
                dst: Some(SocketAddr::new(dst_ip, dst_port)),
            })
        }
        _ => Err(ProxyProtocolError::Malformed("unknown protocol family")),
    }
}

fn parse_ip(field: Option<&str>, family: &str) -> Result<IpAddr, ProxyProtocolError> {
    let ip: IpAddr = field
        .ok_or(ProxyProtocolError::Malformed("missing address"))?
        .parse()
        .map_err(|_| ProxyProtocolError::Malformed("bad address"))?;
    match (family, &ip) {
        ("TCP4", IpAddr::V4(_)) | ("TCP6", IpAddr::V6(_)) => Ok(ip),
        _ => Err(ProxyProtocolError::Malformed("address family mismatch")),
    }
}

fn parse_port(field: Option<&str>) -> Result<u16, ProxyProtocolError> {
    let field = field.ok_or(ProxyProtocolError::Malformed("missing port"))?;
    // Leading zeros and signs are not part of the grammar.
    if field.is_empty() || field.len() > 5 || !field.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ProxyProtocolError::Malformed("bad port"));
    }
    field
        .parse()
        .map_err(|_| ProxyProtocolError::Malformed("bad port"))
}
