//! The TCPROS connection handshake and frame codec.
//!
//! Every peer connection starts with one connection header in each
//! direction: a `u32` length prefixed block of `u32` length prefixed
//! `key=value` strings. After the handshake, topic traffic is plain
//! length prefixed frames; service responses carry an extra success byte
//! ahead of the length.

use byteorder::{LittleEndian, WriteBytesExt};
use log::*;
use rosnative_common::{Error, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// The key=value blob exchanged at the start of every peer connection.
///
/// Unknown keys encountered while parsing are ignored, never rejected.
#[derive(Debug, Clone, Default)]
pub struct ConnectionHeader {
    pub caller_id: String,
    pub latching: bool,
    pub md5sum: Option<String>,
    pub msg_definition: String,
    pub persistent: bool,
    pub service: Option<String>,
    pub tcp_nodelay: bool,
    pub topic: Option<String>,
    pub topic_type: String,
    pub error: Option<String>,
}

impl ConnectionHeader {
    /// Parses a header body (the block following the outer length prefix).
    pub fn from_bytes(header_data: &[u8]) -> Result<ConnectionHeader> {
        let mut header = ConnectionHeader::default();
        let mut cursor = 0usize;
        while cursor < header_data.len() {
            if cursor + 4 > header_data.len() {
                return Err(Error::Serialization(
                    "connection header truncated inside a field length".to_string(),
                ));
            }
            let field_len =
                u32::from_le_bytes(header_data[cursor..cursor + 4].try_into().unwrap()) as usize;
            cursor += 4;
            if cursor + field_len > header_data.len() {
                return Err(Error::Serialization(
                    "connection header field exceeds header length".to_string(),
                ));
            }
            let field = std::str::from_utf8(&header_data[cursor..cursor + field_len])
                .map_err(|e| Error::Serialization(format!("connection header field: {e}")))?;
            cursor += field_len;

            let Some((key, value)) = field.split_once('=') else {
                warn!("Ignoring connection header field without '=': {field:?}");
                continue;
            };
            match key {
                "callerid" => header.caller_id = value.to_string(),
                "latching" => header.latching = value == "1",
                "md5sum" => header.md5sum = Some(value.to_string()),
                "message_definition" => header.msg_definition = value.to_string(),
                "persistent" => header.persistent = value == "1",
                "service" => header.service = Some(value.to_string()),
                "tcp_nodelay" => header.tcp_nodelay = value == "1",
                "topic" => header.topic = Some(value.to_string()),
                "type" => header.topic_type = value.to_string(),
                "error" => header.error = Some(value.to_string()),
                _ => trace!("Ignoring unknown connection header field: {key}"),
            }
        }
        Ok(header)
    }

    /// Serializes the header including its outer length prefix.
    ///
    /// Topic and service handshakes carry different flag fields, which is
    /// what `is_service` selects.
    pub fn to_bytes(&self, is_service: bool) -> Result<Vec<u8>> {
        let mut body = Vec::new();
        write_field(&mut body, "callerid", &self.caller_id)?;
        if let Some(error) = &self.error {
            write_field(&mut body, "error", error)?;
        }
        if let Some(md5sum) = &self.md5sum {
            write_field(&mut body, "md5sum", md5sum)?;
        }
        if let Some(service) = &self.service {
            write_field(&mut body, "service", service)?;
        }
        if let Some(topic) = &self.topic {
            write_field(&mut body, "topic", topic)?;
        }
        if !self.topic_type.is_empty() {
            write_field(&mut body, "type", &self.topic_type)?;
        }
        if !self.msg_definition.is_empty() {
            write_field(&mut body, "message_definition", &self.msg_definition)?;
        }
        if is_service {
            if self.persistent {
                write_field(&mut body, "persistent", "1")?;
            }
        } else {
            write_field(&mut body, "latching", if self.latching { "1" } else { "0" })?;
            if self.tcp_nodelay {
                write_field(&mut body, "tcp_nodelay", "1")?;
            }
        }

        let mut out = Vec::with_capacity(body.len() + 4);
        WriteBytesExt::write_u32::<LittleEndian>(&mut out, body.len() as u32)?;
        out.extend_from_slice(&body);
        Ok(out)
    }
}

fn write_field(buf: &mut Vec<u8>, key: &str, value: &str) -> Result<()> {
    WriteBytesExt::write_u32::<LittleEndian>(buf, (key.len() + 1 + value.len()) as u32)?;
    buf.extend_from_slice(key.as_bytes());
    buf.push(b'=');
    buf.extend_from_slice(value.as_bytes());
    Ok(())
}

/// Whether a peer's md5sum is acceptable against ours.
///
/// `*` on either side matches anything (generic probes); a missing value
/// never matches.
pub(crate) fn md5_compatible(ours: &str, theirs: Option<&str>) -> bool {
    match theirs {
        None => false,
        Some("*") => true,
        Some(theirs) => ours == "*" || ours == theirs,
    }
}

/// Reads one connection header off the stream.
pub(crate) async fn read_header<R: AsyncRead + Unpin>(stream: &mut R) -> Result<ConnectionHeader> {
    let len = stream.read_u32_le().await?;
    let mut body = vec![0u8; len as usize];
    stream.read_exact(&mut body).await?;
    ConnectionHeader::from_bytes(&body)
}

/// Responds to a bad handshake with an `error=` header and leaves the
/// connection to be closed by the caller.
pub(crate) async fn write_error_header<W: AsyncWrite + Unpin>(
    stream: &mut W,
    caller_id: &str,
    reason: &str,
) -> Result<()> {
    let header = ConnectionHeader {
        caller_id: caller_id.to_string(),
        error: Some(reason.to_string()),
        ..Default::default()
    };
    stream.write_all(&header.to_bytes(true)?).await?;
    Ok(())
}

/// Reads one length prefixed frame, waiting for the full payload.
pub(crate) async fn read_frame<R: AsyncRead + Unpin>(stream: &mut R) -> std::io::Result<Vec<u8>> {
    let len = stream.read_u32_le().await?;
    let mut payload = vec![0u8; len as usize];
    stream.read_exact(&mut payload).await?;
    Ok(payload)
}

/// Writes `payload` as one length prefixed frame.
pub(crate) async fn write_frame<W: AsyncWrite + Unpin>(
    stream: &mut W,
    payload: &[u8],
) -> std::io::Result<()> {
    stream.write_u32_le(payload.len() as u32).await?;
    stream.write_all(payload).await?;
    Ok(())
}

/// Reads a service response: success byte, then a length prefixed payload
/// holding either the response body or an error string.
pub(crate) async fn read_service_response<R: AsyncRead + Unpin>(
    stream: &mut R,
) -> std::io::Result<(bool, Vec<u8>)> {
    let ok = stream.read_u8().await? != 0;
    let payload = read_frame(stream).await?;
    Ok((ok, payload))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn header_round_trips() {
        let header = ConnectionHeader {
            caller_id: "/talker".to_string(),
            latching: true,
            md5sum: Some("992ce8a1687cec8c8bd883ec73ca41d1".to_string()),
            msg_definition: "string data".to_string(),
            topic: Some("/chatter".to_string()),
            topic_type: "std_msgs/String".to_string(),
            ..Default::default()
        };
        let bytes = header.to_bytes(false).unwrap();
        let parsed = ConnectionHeader::from_bytes(&bytes[4..]).unwrap();
        assert_eq!(parsed.caller_id, "/talker");
        assert!(parsed.latching);
        assert_eq!(parsed.md5sum.as_deref(), Some("992ce8a1687cec8c8bd883ec73ca41d1"));
        assert_eq!(parsed.topic.as_deref(), Some("/chatter"));
        assert_eq!(parsed.topic_type, "std_msgs/String");
        assert_eq!(parsed.msg_definition, "string data");
    }

    #[test]
    fn service_header_round_trips() {
        let header = ConnectionHeader {
            caller_id: "/client".to_string(),
            md5sum: Some("6a2e34150c00229791cc89ff309fff21".to_string()),
            service: Some("/add_two_ints".to_string()),
            persistent: true,
            ..Default::default()
        };
        let bytes = header.to_bytes(true).unwrap();
        let parsed = ConnectionHeader::from_bytes(&bytes[4..]).unwrap();
        assert_eq!(parsed.service.as_deref(), Some("/add_two_ints"));
        assert!(parsed.persistent);
        assert!(!parsed.latching);
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let mut body = Vec::new();
        write_field(&mut body, "callerid", "/probe").unwrap();
        write_field(&mut body, "some_future_key", "whatever").unwrap();
        let parsed = ConnectionHeader::from_bytes(&body).unwrap();
        assert_eq!(parsed.caller_id, "/probe");
    }

    #[test]
    fn field_without_equals_is_skipped() {
        let mut body = Vec::new();
        WriteBytesExt::write_u32::<LittleEndian>(&mut body, 7).unwrap();
        body.extend_from_slice(b"garbage");
        write_field(&mut body, "topic", "/chatter").unwrap();
        let parsed = ConnectionHeader::from_bytes(&body).unwrap();
        assert_eq!(parsed.topic.as_deref(), Some("/chatter"));
    }

    #[test]
    fn truncated_header_is_an_error() {
        let header = ConnectionHeader {
            caller_id: "/talker".to_string(),
            ..Default::default()
        };
        let bytes = header.to_bytes(false).unwrap();
        assert!(ConnectionHeader::from_bytes(&bytes[4..bytes.len() - 2]).is_err());
    }

    #[test]
    fn md5_compatibility_rules() {
        assert!(md5_compatible("abc", Some("abc")));
        assert!(md5_compatible("abc", Some("*")));
        assert!(md5_compatible("*", Some("def")));
        assert!(!md5_compatible("abc", Some("def")));
        assert!(!md5_compatible("abc", None));
    }

    #[tokio::test]
    async fn frames_round_trip_and_wait_for_partial_tails() {
        let (mut client, mut server) = tokio::io::duplex(256);
        write_frame(&mut client, b"hello").await.unwrap();
        let payload = read_frame(&mut server).await.unwrap();
        assert_eq!(payload, b"hello");

        // A partial tail must not produce a frame until the rest arrives
        client.write_u32_le(4).await.unwrap();
        client.write_all(b"ab").await.unwrap();
        let pending = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            read_frame(&mut server),
        )
        .await;
        assert!(pending.is_err(), "partial frame should not complete");
        client.write_all(b"cd").await.unwrap();
        let payload = read_frame(&mut server).await.unwrap();
        assert_eq!(payload, b"abcd");
    }

    #[tokio::test]
    async fn service_response_framing() {
        let (mut client, mut server) = tokio::io::duplex(256);
        client.write_u8(1).await.unwrap();
        write_frame(&mut client, b"payload").await.unwrap();
        let (ok, payload) = read_service_response(&mut server).await.unwrap();
        assert!(ok);
        assert_eq!(payload, b"payload");

        client.write_u8(0).await.unwrap();
        write_frame(&mut client, b"handler blew up").await.unwrap();
        let (ok, payload) = read_service_response(&mut server).await.unwrap();
        assert!(!ok);
        assert_eq!(payload, b"handler blew up");
    }
}
