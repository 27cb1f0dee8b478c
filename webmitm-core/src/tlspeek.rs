//! Non-consuming TLS handshake inspection.
//!
//! Classifies the first record buffered on a [`FramedStream`] without
//! consuming it: the bytes stay in the framing buffer, so a decision to
//! splice forwards the identical handshake and a decision to decrypt
//! replays it into the TLS acceptor.

use std::io;

use crate::stream::FramedStream;

const TLS_HANDSHAKE: u8 = 0x16;
const CLIENT_HELLO: u8 = 0x01;
const SERVER_HELLO: u8 = 0x02;
const SNI_EXTENSION: u16 = 0x0000;
const ALPN_EXTENSION: u16 = 0x0010;
const SUPPORTED_VERSIONS_EXTENSION: u16 = 0x002b;

/// What the ClientHello reveals before any handshake work is done.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHelloInfo {
    pub sni: Option<String>,
    pub alpn: Vec<String>,
    /// Offered protocol versions: the supported_versions extension when
    /// present, else the legacy record version.
    pub versions: Vec<u16>,
}

/// The origin's answer on a spliced tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerHelloInfo {
    pub version: u16,
    pub cipher_suite: u16,
}

/// Peek the stream for a TLS ClientHello. `Ok(None)` when the first
/// bytes are not a TLS handshake record, or the record cannot be fully
/// buffered (EOF, or a record larger than the framing buffer).
pub async fn client_hello(stream: &mut FramedStream) -> io::Result<Option<ClientHelloInfo>> {
    match peek_handshake_record(stream).await? {
        Some(()) => Ok(parse_client_hello(stream.buffered())),
        None => Ok(None),
    }
}

/// Peek the stream for a TLS ServerHello.
pub async fn server_hello(stream: &mut FramedStream) -> io::Result<Option<ServerHelloInfo>> {
    match peek_handshake_record(stream).await? {
        Some(()) => Ok(parse_server_hello(stream.buffered())),
        None => Ok(None),
    }
}

/// Buffer one full handshake record at the front of the stream.
async fn peek_handshake_record(stream: &mut FramedStream) -> io::Result<Option<()>> {
    if stream.fill_to(5).await? < 5 {
        return Ok(None);
    }
    let header = stream.buffered();
    if header[0] != TLS_HANDSHAKE {
        return Ok(None);
    }
    let record_length = ((header[3] as usize) << 8) | (header[4] as usize);
    if record_length < 4 || 5 + record_length > stream.capacity() {
        return Ok(None);
    }
    if stream.fill_to(5 + record_length).await? < 5 + record_length {
        return Ok(None);
    }
    Ok(Some(()))
}

/// Parse a buffered ClientHello record. Returns `None` on anything that
/// does not walk like a ClientHello; peeking must never fail a tunnel.
pub fn parse_client_hello(record: &[u8]) -> Option<ClientHelloInfo> {
    let body = handshake_body(record, CLIENT_HELLO)?;

    // legacy_version(2) + random(32)
    if body.len() < 34 {
        return None;
    }
    let legacy_version = ((body[0] as u16) << 8) | body[1] as u16;
    let mut pos = 34;

    // session_id
    let session_id_length = *body.get(pos)? as usize;
    pos += 1 + session_id_length;

    // cipher_suites
    let cipher_suites_length = read_u16(body, pos)? as usize;
    pos += 2 + cipher_suites_length;

    // compression_methods
    let compression_length = *body.get(pos)? as usize;
    pos += 1 + compression_length;

    let mut info = ClientHelloInfo {
        sni: None,
        alpn: Vec::new(),
        versions: vec![legacy_version],
    };

    let extensions_length = match read_u16(body, pos) {
        Some(len) => len as usize,
        // A ClientHello without extensions is still a ClientHello
        None => return Some(info),
    };
    pos += 2;
    let extensions_end = (pos + extensions_length).min(body.len());

    while pos + 4 <= extensions_end {
        let extension_type = read_u16(body, pos)?;
        let extension_length = read_u16(body, pos + 2)? as usize;
        pos += 4;
        if pos + extension_length > extensions_end {
            return Some(info);
        }
        let extension = &body[pos..pos + extension_length];
        match extension_type {
            SNI_EXTENSION => info.sni = parse_sni(extension),
            ALPN_EXTENSION => info.alpn = parse_alpn(extension),
            SUPPORTED_VERSIONS_EXTENSION => {
                if let Some(versions) = parse_supported_versions(extension) {
                    info.versions = versions;
                }
            }
            _ => {}
        }
        pos += extension_length;
    }

    Some(info)
}

/// Parse a buffered ServerHello record.
pub fn parse_server_hello(record: &[u8]) -> Option<ServerHelloInfo> {
    let body = handshake_body(record, SERVER_HELLO)?;

    // legacy_version(2) + random(32)
    if body.len() < 34 {
        return None;
    }
    let version = ((body[0] as u16) << 8) | body[1] as u16;
    let mut pos = 34;

    let session_id_length = *body.get(pos)? as usize;
    pos += 1 + session_id_length;

    let cipher_suite = read_u16(body, pos)?;

    Some(ServerHelloInfo {
        version,
        cipher_suite,
    })
}

/// Validate the record + handshake headers and return the handshake body.
fn handshake_body(record: &[u8], expected_type: u8) -> Option<&[u8]> {
    if record.len() < 9 || record[0] != TLS_HANDSHAKE || record[1] != 0x03 {
        return None;
    }
    let record_length = ((record[3] as usize) << 8) | record[4] as usize;
    if record.len() < 5 + record_length || record[5] != expected_type {
        return None;
    }
    let handshake_length = ((record[6] as usize) << 16)
        | ((record[7] as usize) << 8)
        | record[8] as usize;
    let body = &record[9..5 + record_length];
    if body.len() < handshake_length {
        return None;
    }
    Some(&body[..handshake_length])
}

fn read_u16(data: &[u8], pos: usize) -> Option<u16> {
    Some(((*data.get(pos)? as u16) << 8) | *data.get(pos + 1)? as u16)
}

fn parse_sni(extension: &[u8]) -> Option<String> {
    // server_name_list length(2), then entries of type(1) + length(2) + name
    let list_length = read_u16(extension, 0)? as usize;
    let mut pos = 2;
    let end = (2 + list_length).min(extension.len());
    while pos + 3 <= end {
        let name_type = extension[pos];
        let name_length = read_u16(extension, pos + 1)? as usize;
        pos += 3;
        if pos + name_length > end {
            return None;
        }
        if name_type == 0 {
            return std::str::from_utf8(&extension[pos..pos + name_length])
                .ok()
                .map(str::to_string);
        }
        pos += name_length;
    }
    None
}

fn parse_alpn(extension: &[u8]) -> Vec<String> {
    let mut protocols = Vec::new();
    let Some(list_length) = read_u16(extension, 0) else {
        return protocols;
    };
    let mut pos = 2;
    let end = (2 + list_length as usize).min(extension.len());
    while pos < end {
        let length = extension[pos] as usize;
        pos += 1;
        if pos + length > end {
            break;
        }
        if let Ok(protocol) = std::str::from_utf8(&extension[pos..pos + length]) {
            protocols.push(protocol.to_string());
        }
        pos += length;
    }
    protocols
}

fn parse_supported_versions(extension: &[u8]) -> Option<Vec<u16>> {
    let list_length = *extension.first()? as usize;
    let mut versions = Vec::new();
    let mut pos = 1;
    let end = (1 + list_length).min(extension.len());
    while pos + 2 <= end {
        versions.push(read_u16(extension, pos)?);
        pos += 2;
    }
    if versions.is_empty() { None } else { Some(versions) }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a syntactically complete ClientHello record with the given
    /// extensions already serialised.
    pub(crate) fn build_client_hello(extensions: &[u8]) -> Vec<u8> {
        let extensions_len = extensions.len() as u16;
        let handshake_len = 2 + 32 + 1 + 2 + 2 + 1 + 1 + 2 + extensions_len;
        let record_len = 4 + handshake_len;

        let mut record = vec![
            0x16,
            0x03,
            0x03,
            (record_len >> 8) as u8,
            (record_len & 0xff) as u8,
            0x01,
            0x00,
            (handshake_len >> 8) as u8,
            (handshake_len & 0xff) as u8,
            0x03,
            0x03, // legacy version TLS 1.2
        ];
        record.extend_from_slice(&[0; 32]); // random
        record.extend_from_slice(&[
            0x00, // session id length
            0x00, 0x02, // cipher suites length
            0x13, 0x01, // TLS_AES_128_GCM_SHA256
            0x01, 0x00, // compression methods
            (extensions_len >> 8) as u8,
            (extensions_len & 0xff) as u8,
        ]);
        record.extend_from_slice(extensions);
        record
    }

    pub(crate) fn sni_extension(host: &str) -> Vec<u8> {
        let name = host.as_bytes();
        let name_len = name.len() as u16;
        let list_len = 3 + name_len;
        let ext_len = 2 + list_len;
        let mut ext = vec![
            0x00,
            0x00,
            (ext_len >> 8) as u8,
            (ext_len & 0xff) as u8,
            (list_len >> 8) as u8,
            (list_len & 0xff) as u8,
            0x00,
            (name_len >> 8) as u8,
            (name_len & 0xff) as u8,
        ];
        ext.extend_from_slice(name);
        ext
    }

    fn alpn_extension(protocols: &[&str]) -> Vec<u8> {
        let mut list = Vec::new();
        for proto in protocols {
            list.push(proto.len() as u8);
            list.extend_from_slice(proto.as_bytes());
        }
        let list_len = list.len() as u16;
        let ext_len = 2 + list_len;
        let mut ext = vec![
            0x00,
            0x10,
            (ext_len >> 8) as u8,
            (ext_len & 0xff) as u8,
            (list_len >> 8) as u8,
            (list_len & 0xff) as u8,
        ];
        ext.extend_from_slice(&list);
        ext
    }

    #[test]
    fn client_hello_with_sni_and_alpn() {
        let mut extensions = sni_extension("api.example.test");
        extensions.extend_from_slice(&alpn_extension(&["h2", "http/1.1"]));
        let record = build_client_hello(&extensions);

        let info = parse_client_hello(&record).expect("should parse");
        assert_eq!(info.sni.as_deref(), Some("api.example.test"));
        assert_eq!(info.alpn, vec!["h2", "http/1.1"]);
        assert_eq!(info.versions, vec![0x0303]);
    }

    #[test]
    fn client_hello_without_sni() {
        let record = build_client_hello(&[]);
        let info = parse_client_hello(&record).expect("should parse");
        assert_eq!(info.sni, None);
        assert!(info.alpn.is_empty());
    }

    #[test]
    fn supported_versions_override_legacy() {
        // supported_versions: list of TLS 1.3, TLS 1.2
        let ext = vec![0x00, 0x2b, 0x00, 0x05, 0x04, 0x03, 0x04, 0x03, 0x03];
        let record = build_client_hello(&ext);
        let info = parse_client_hello(&record).expect("should parse");
        assert_eq!(info.versions, vec![0x0304, 0x0303]);
    }

    #[test]
    fn non_tls_bytes_are_not_a_hello() {
        assert!(parse_client_hello(b"GET / HTTP/1.1\r\n").is_none());
        assert!(parse_client_hello(&[]).is_none());
    }

    #[test]
    fn truncated_record_is_rejected() {
        let record = build_client_hello(&sni_extension("example.test"));
        assert!(parse_client_hello(&record[..record.len() - 4]).is_none());
    }

    #[test]
    fn server_hello_parses_version_and_cipher() {
        // Minimal ServerHello: version TLS1.2, empty session id, suite 0x1301
        let handshake_len: u16 = 2 + 32 + 1 + 2 + 1;
        let record_len = 4 + handshake_len;
        let mut record = vec![
            0x16,
            0x03,
            0x03,
            (record_len >> 8) as u8,
            (record_len & 0xff) as u8,
            0x02,
            0x00,
            (handshake_len >> 8) as u8,
            (handshake_len & 0xff) as u8,
            0x03,
            0x03,
        ];
        record.extend_from_slice(&[0; 32]);
        record.extend_from_slice(&[0x00, 0x13, 0x01, 0x00]);

        let info = parse_server_hello(&record).expect("should parse");
        assert_eq!(info.version, 0x0303);
        assert_eq!(info.cipher_suite, 0x1301);
    }

    #[tokio::test]
    async fn peek_leaves_record_in_stream() {
        use crate::stream::FramedStream;
        use tokio::io::AsyncWriteExt;

        let record = build_client_hello(&sni_extension("peek.test"));
        let (client, mut server) = tokio::io::duplex(65536);
        let payload = record.clone();
        tokio::spawn(async move {
            server.write_all(&payload).await.unwrap();
            server.shutdown().await.unwrap();
        });

        let mut stream = FramedStream::new(Box::new(client), 8192);
        let info = client_hello(&mut stream).await.unwrap().expect("tls");
        assert_eq!(info.sni.as_deref(), Some("peek.test"));
        // The record is intact and un-consumed
        assert_eq!(stream.take_buffered(), record);
    }
}
