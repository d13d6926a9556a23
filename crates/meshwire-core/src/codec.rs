//! Stream framing codecs
//!
//! Three message shapes travel on the wire:
//! - newline-terminated UTF-8 lines, and unterminated text read to EOF
//! - one JSON transaction record followed by a newline
//! - one blob, encoded as a CBOR definite-length byte string

use crate::{Error, Result, SyncPayload, TransactionRecord};
use serde::{Serialize, Serializer};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// Longest line accepted by [`read_line`], terminator included
pub const MAX_LINE_LEN: usize = 4 * 1024;

/// Longest text accepted by [`read_text`]
pub const MAX_TEXT_LEN: usize = 64 * 1024;

/// Longest encoded transaction record
pub const MAX_RECORD_LEN: usize = 64 * 1024;

/// Largest blob accepted by [`read_blob`]: 1 GiB
pub const MAX_BLOB_LEN: u64 = 1 << 30;

/// CBOR major type 2 (byte string), shifted into the initial byte
const CBOR_BYTES: u8 = 0x40;

// Line codec

/// Write `text` followed by a newline, then flush
pub async fn write_line<W: AsyncWrite + Unpin + ?Sized>(writer: &mut W, text: &str) -> Result<()> {
    if text.contains('\n') {
        return Err(Error::Framing("line contains a newline".to_string()));
    }
    let mut line = Vec::with_capacity(text.len() + 1);
    line.extend_from_slice(text.as_bytes());
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one newline-terminated line, returned without its terminator
///
/// Bytes after the newline may be consumed; callers only use this when the
/// line is the last thing the remote sends before waiting for a reply.
pub async fn read_line<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> Result<String> {
    let mut line = Vec::new();
    let mut limited = BufReader::new(reader.take(MAX_LINE_LEN as u64));
    limited.read_until(b'\n', &mut line).await?;

    if line.last() != Some(&b'\n') {
        return Err(if line.len() >= MAX_LINE_LEN {
            Error::Framing(format!("line exceeds {} bytes", MAX_LINE_LEN))
        } else {
            Error::Framing("stream ended before newline terminator".to_string())
        });
    }
    line.pop();
    String::from_utf8(line).map_err(|_| Error::Framing("line is not valid UTF-8".to_string()))
}

/// Write unterminated text and flush; the reader relies on the close that follows
pub async fn write_text<W: AsyncWrite + Unpin + ?Sized>(writer: &mut W, text: &str) -> Result<()> {
    writer.write_all(text.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Read UTF-8 text until the remote closes the stream
pub async fn read_text<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> Result<String> {
    let mut text = Vec::new();
    reader
        .take(MAX_TEXT_LEN as u64 + 1)
        .read_to_end(&mut text)
        .await?;
    if text.len() > MAX_TEXT_LEN {
        return Err(Error::Framing(format!("reply exceeds {} bytes", MAX_TEXT_LEN)));
    }
    String::from_utf8(text).map_err(|_| Error::Framing("reply is not valid UTF-8".to_string()))
}

// Structured-record codec

/// Encode one record as a JSON document plus newline, written in a single
/// write and flushed
pub async fn write_record<W: AsyncWrite + Unpin + ?Sized>(
    writer: &mut W,
    record: &TransactionRecord,
) -> Result<()> {
    if !record.amount.is_finite() {
        return Err(Error::Framing(format!(
            "amount {} cannot be encoded",
            record.amount
        )));
    }
    let mut encoded = serde_json::to_vec(record)?;
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

/// Decode exactly one record
pub async fn read_record<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> Result<TransactionRecord> {
    let mut encoded = Vec::new();
    let mut limited = BufReader::new(reader.take(MAX_RECORD_LEN as u64));
    limited.read_until(b'\n', &mut encoded).await?;

    if encoded.is_empty() {
        return Err(Error::Framing("stream ended before a record was sent".to_string()));
    }
    if encoded.last() != Some(&b'\n') && encoded.len() >= MAX_RECORD_LEN {
        return Err(Error::Framing(format!("record exceeds {} bytes", MAX_RECORD_LEN)));
    }
    Ok(serde_json::from_slice(&encoded)?)
}

// Length-framed blob codec

/// Borrowed bytes serialized as a CBOR byte string rather than an array
struct ByteString<'a>(&'a [u8]);

impl Serialize for ByteString<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_bytes(self.0)
    }
}

/// Encode one blob and flush it
pub async fn write_blob<W: AsyncWrite + Unpin + ?Sized>(
    writer: &mut W,
    payload: &SyncPayload,
) -> Result<()> {
    let mut encoded = Vec::with_capacity(payload.len() + 9);
    ciborium::ser::into_writer(&ByteString(payload.as_bytes()), &mut encoded)
        .map_err(|e| Error::Framing(format!("blob encode failed: {}", e)))?;
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

/// Decode exactly one blob
pub async fn read_blob<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> Result<SyncPayload> {
    let len = read_blob_head(reader).await?;
    if len > MAX_BLOB_LEN {
        return Err(Error::Framing(format!(
            "blob of {} bytes exceeds limit of {}",
            len, MAX_BLOB_LEN
        )));
    }

    // Grows with the bytes that actually arrive, not with the announced length.
    let mut data = Vec::new();
    reader.take(len).read_to_end(&mut data).await?;
    if data.len() as u64 != len {
        return Err(Error::Framing(format!(
            "stream ended inside a blob after {} of {} bytes",
            data.len(),
            len
        )));
    }
    Ok(SyncPayload::from(data))
}

/// Read a CBOR byte-string head and return the length it announces
async fn read_blob_head<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> Result<u64> {
    let initial = reader.read_u8().await.map_err(truncated)?;
    if initial & 0xe0 != CBOR_BYTES {
        return Err(Error::Framing(format!(
            "expected a byte string, found initial byte {:#04x}",
            initial
        )));
    }

    let len = match initial & 0x1f {
        n @ 0..=23 => u64::from(n),
        24 => u64::from(reader.read_u8().await.map_err(truncated)?),
        25 => u64::from(reader.read_u16().await.map_err(truncated)?),
        26 => u64::from(reader.read_u32().await.map_err(truncated)?),
        27 => reader.read_u64().await.map_err(truncated)?,
        31 => {
            return Err(Error::Framing(
                "indefinite-length blobs are not supported".to_string(),
            ))
        }
        other => {
            return Err(Error::Framing(format!(
                "invalid byte string length encoding {}",
                other
            )))
        }
    };
    Ok(len)
}

fn truncated(e: std::io::Error) -> Error {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        Error::Framing("stream ended inside a blob".to_string())
    } else {
        Error::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    #[tokio::test]
    async fn test_line_roundtrip() {
        let mut wire = Vec::new();
        write_line(&mut wire, "alice is checking availability").await.unwrap();
        assert_eq!(wire, b"alice is checking availability\n");

        let line = read_line(&mut wire.as_slice()).await.unwrap();
        assert_eq!(line, "alice is checking availability");
    }

    #[tokio::test]
    async fn test_line_without_terminator() {
        let err = read_line(&mut &b"no newline"[..]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Framing);

        let err = read_line(&mut &b""[..]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Framing);
    }

    #[tokio::test]
    async fn test_line_too_long() {
        let long = vec![b'a'; MAX_LINE_LEN + 10];
        let err = read_line(&mut long.as_slice()).await.unwrap_err();
        assert!(err.to_string().contains("exceeds"));
    }

    #[tokio::test]
    async fn test_write_line_rejects_newline() {
        let mut wire = Vec::new();
        assert!(write_line(&mut wire, "two\nlines").await.is_err());
        assert!(wire.is_empty());
    }

    #[tokio::test]
    async fn test_read_text() {
        let mut wire = Vec::new();
        write_text(&mut wire, "no terminator needed").await.unwrap();
        let text = read_text(&mut wire.as_slice()).await.unwrap();
        assert_eq!(text, "no terminator needed");

        let err = read_text(&mut &[0xff, 0xfe][..]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Framing);
    }

    #[tokio::test]
    async fn test_record_roundtrip() {
        let record = TransactionRecord::new("A", "B", 12.5);
        let mut wire = Vec::new();
        write_record(&mut wire, &record).await.unwrap();
        assert_eq!(wire.last(), Some(&b'\n'));

        let decoded = read_record(&mut wire.as_slice()).await.unwrap();
        assert_eq!(decoded, record);
    }

    #[tokio::test]
    async fn test_record_amount_bit_exact() {
        let amount = 0.1 + 0.2;
        assert_eq!(amount, 0.30000000000000004);

        let mut wire = Vec::new();
        write_record(&mut wire, &TransactionRecord::new("A", "B", amount))
            .await
            .unwrap();
        let decoded = read_record(&mut wire.as_slice()).await.unwrap();
        assert_eq!(decoded.amount.to_bits(), amount.to_bits());
    }

    #[tokio::test]
    async fn test_record_capitalized_fields() {
        let wire = br#"{"Sender":"A","Receiver":"B","Amount":3.25}"#;
        let decoded = read_record(&mut &wire[..]).await.unwrap();
        assert_eq!(decoded, TransactionRecord::new("A", "B", 3.25));
    }

    #[tokio::test]
    async fn test_record_malformed_and_truncated() {
        for wire in [
            &b""[..],
            &b"{\"sender\":\"A\",\"receiver\":\"B\",\"amo"[..],
            &b"not json\n"[..],
            &b"{\"sender\":\"A\"}\n"[..],
        ] {
            let err = read_record(&mut &wire[..]).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Framing, "{:?}", wire);
        }
    }

    #[tokio::test]
    async fn test_record_rejects_non_finite_amount() {
        let mut wire = Vec::new();
        let err = write_record(&mut wire, &TransactionRecord::new("A", "B", f64::NAN))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Framing);
        assert!(wire.is_empty());
    }

    #[tokio::test]
    async fn test_blob_roundtrip_sizes() {
        for len in [0usize, 23, 24, 255, 256, 70_000] {
            let payload = SyncPayload::from(vec![0x5au8; len]);
            let mut wire = Vec::new();
            write_blob(&mut wire, &payload).await.unwrap();

            let mut reader = wire.as_slice();
            let decoded = read_blob(&mut reader).await.unwrap();
            assert_eq!(decoded, payload);
            assert!(reader.is_empty(), "blob of {} left trailing bytes", len);
        }
    }

    #[tokio::test]
    async fn test_blob_matches_cbor() {
        let payload = SyncPayload::from(b"snapshot".to_vec());
        let mut wire = Vec::new();
        write_blob(&mut wire, &payload).await.unwrap();

        let value: ciborium::Value = ciborium::de::from_reader(wire.as_slice()).unwrap();
        assert_eq!(value, ciborium::Value::Bytes(b"snapshot".to_vec()));
    }

    #[tokio::test]
    async fn test_blob_truncated() {
        let payload = SyncPayload::from(vec![1u8; 1000]);
        let mut wire = Vec::new();
        write_blob(&mut wire, &payload).await.unwrap();
        wire.truncate(500);

        let err = read_blob(&mut wire.as_slice()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Framing);
    }

    #[tokio::test]
    async fn test_blob_wrong_type() {
        // CBOR text string "hi"
        let err = read_blob(&mut &[0x62, b'h', b'i'][..]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Framing);

        // indefinite-length byte string
        let err = read_blob(&mut &[0x5f, 0x41, 0x00, 0xff][..]).await.unwrap_err();
        assert!(err.to_string().contains("indefinite"));
    }

    #[tokio::test]
    async fn test_blob_oversized_head() {
        let mut wire = vec![0x5b];
        wire.extend_from_slice(&(MAX_BLOB_LEN + 1).to_be_bytes());
        let err = read_blob(&mut wire.as_slice()).await.unwrap_err();
        assert!(err.to_string().contains("exceeds"));
    }

    #[tokio::test]
    async fn test_blob_announcing_limit_with_few_bytes() {
        let mut wire = vec![0x5a];
        wire.extend_from_slice(&(MAX_BLOB_LEN as u32).to_be_bytes());
        wire.extend_from_slice(b"abc");

        let err = read_blob(&mut wire.as_slice()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Framing);
        assert!(err.to_string().contains("after 3 of"));
    }
}
