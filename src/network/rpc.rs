//! Wire messages and framing for the remote cache protocol.
//!
//! Every frame is a 4-byte big-endian length followed by a bincode-encoded
//! [`Envelope`]. The correlation id is the envelope's first field, so it can
//! be recovered from a body that otherwise fails to decode.

use crate::error::{NetworkError, Result};
use crate::types::{CachePartitionKey, NumericId};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// A message plus the correlation id the client assigned to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Client-assigned id, echoed unchanged in the response.
    pub correlation_id: u64,

    /// The payload message.
    pub message: Message,
}

impl Envelope {
    pub fn new(correlation_id: u64, message: Message) -> Self {
        Self {
            correlation_id,
            message,
        }
    }
}

/// Every request and response kind of the protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Resolve serialized value keys to ids.
    LookupRequest { keys: Vec<Vec<u8>> },

    /// Ids in the same order as the requested keys.
    LookupResponse { ids: Vec<NumericId> },

    /// Read one payload from a partition.
    GetRequest {
        partition: CachePartitionKey,
        id: NumericId,
    },

    /// The payload, or `None` when absent.
    GetResponse { payload: Option<Bytes> },

    /// Store one payload in a partition.
    PutRequest {
        partition: CachePartitionKey,
        id: NumericId,
        payload: Bytes,
    },

    /// Drop a partition's store.
    DeleteRequest { partition: CachePartitionKey },

    /// Empty acknowledgement.
    Ack,

    /// The server could not complete the request.
    Failure { message: String },
}

impl Message {
    /// Stable name of the message kind, used for logging and metrics labels.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::LookupRequest { .. } => "lookup_request",
            Message::LookupResponse { .. } => "lookup_response",
            Message::GetRequest { .. } => "get_request",
            Message::GetResponse { .. } => "get_response",
            Message::PutRequest { .. } => "put_request",
            Message::DeleteRequest { .. } => "delete_request",
            Message::Ack => "ack",
            Message::Failure { .. } => "failure",
        }
    }
}

/// Encode an envelope to bytes.
pub fn encode_envelope(envelope: &Envelope) -> Result<Vec<u8>> {
    Ok(bincode::serialize(envelope)?)
}

/// Decode an envelope from bytes.
pub fn decode_envelope(data: &[u8]) -> Result<Envelope> {
    Ok(bincode::deserialize(data)?)
}

/// Recover the correlation id from an envelope body that may not decode.
pub fn peek_correlation_id(data: &[u8]) -> Option<u64> {
    let head: [u8; 8] = data.get(..8)?.try_into().ok()?;
    Some(u64::from_le_bytes(head))
}

/// Frame an envelope with length prefix for TCP transmission.
pub fn frame_envelope(envelope: &Envelope) -> Result<Vec<u8>> {
    let data = encode_envelope(envelope)?;
    let len = u32::try_from(data.len())
        .map_err(|_| NetworkError::SendFailed(format!("frame of {} bytes", data.len())))?;

    let mut framed = Vec::with_capacity(4 + data.len());
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(&data);

    Ok(framed)
}

/// Read one frame body. Returns `None` on a clean end of stream.
pub async fn read_frame<R>(reader: &mut R, max_message_size: usize) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(NetworkError::Io(e).into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_message_size {
        return Err(NetworkError::ReceiveFailed(format!(
            "message of {} bytes exceeds limit of {}",
            len, max_message_size
        ))
        .into());
    }

    let mut data = vec![0u8; len];
    reader.read_exact(&mut data).await.map_err(NetworkError::Io)?;
    Ok(Some(data))
}

/// Write one already-framed message.
pub async fn write_frame<W>(writer: &mut W, framed: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(framed).await.map_err(NetworkError::Io)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_serialization() {
        let envelope = Envelope::new(
            42,
            Message::PutRequest {
                partition: CachePartitionKey::new("ViewA", "Cfg1", 100),
                id: 7,
                payload: Bytes::from_static(b"payload"),
            },
        );

        let decoded = decode_envelope(&encode_envelope(&envelope).unwrap()).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn test_frame_envelope() {
        let envelope = Envelope::new(9, Message::Ack);
        let framed = frame_envelope(&envelope).unwrap();

        // First 4 bytes should be length
        let len = u32::from_be_bytes([framed[0], framed[1], framed[2], framed[3]]) as usize;
        assert_eq!(len, framed.len() - 4);
        assert_eq!(decode_envelope(&framed[4..]).unwrap(), envelope);
    }

    #[test]
    fn test_correlation_id_survives_garbage_body() {
        let mut body = encode_envelope(&Envelope::new(0xDEAD_BEEF, Message::Ack)).unwrap();
        // Corrupt the message tag.
        body.truncate(8);
        body.extend_from_slice(&[0xFF, 0xFF, 0xFF, 0xFF]);

        assert!(decode_envelope(&body).is_err());
        assert_eq!(peek_correlation_id(&body), Some(0xDEAD_BEEF));
        assert_eq!(peek_correlation_id(&body[..3]), None);
    }

    #[test]
    fn test_message_kinds() {
        assert_eq!(Message::Ack.kind(), "ack");
        assert_eq!(
            Message::LookupRequest { keys: vec![] }.kind(),
            "lookup_request"
        );
        assert_eq!(
            Message::Failure {
                message: "x".into()
            }
            .kind(),
            "failure"
        );
    }

    #[tokio::test]
    async fn test_read_frame_enforces_limit() {
        let framed = frame_envelope(&Envelope::new(
            1,
            Message::LookupRequest {
                keys: vec![vec![0u8; 64]],
            },
        ))
        .unwrap();

        let mut reader = &framed[..];
        assert!(read_frame(&mut reader, 16).await.is_err());

        let mut reader = &framed[..];
        let body = read_frame(&mut reader, 1024).await.unwrap().unwrap();
        assert_eq!(decode_envelope(&body).unwrap().correlation_id, 1);

        let mut empty: &[u8] = &[];
        assert!(read_frame(&mut empty, 1024).await.unwrap().is_none());
    }
}
