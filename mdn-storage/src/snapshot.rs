//! Binary snapshot codec for data-layer persistence.

use std::fs;
use std::path::Path;

use mdn_common::error::{MdnError, MdnResult};
use mdn_wire::codec::{put_slice, put_u16, put_u32, put_u64, put_u8, WireCursor};

use crate::data_layer::Row;

/// Fixed magic marker at the beginning of every snapshot payload.
const SNAPSHOT_MAGIC: &[u8; 8] = b"MDNSNAP1";
/// Current snapshot format version.
const SNAPSHOT_VERSION: u16 = 1;

/// Encodes rows into snapshot bytes.
///
/// # Errors
///
/// Returns `MdnError::Protocol` when row counts or byte fields exceed
/// format limits.
pub fn encode_rows(rows: &[Row]) -> MdnResult<Vec<u8>> {
    let mut output = Vec::new();
    output.extend_from_slice(SNAPSHOT_MAGIC);
    put_u16(&mut output, SNAPSHOT_VERSION);
    put_u32(
        &mut output,
        u32::try_from(rows.len())
            .map_err(|_| snapshot_error("row count exceeds u32::MAX".to_owned()))?,
    );

    for row in rows {
        put_slice(&mut output, &row.table)?;
        put_slice(&mut output, &row.key)?;
        put_u64(&mut output, row.timestamp);
        match &row.value {
            Some(value) => {
                put_u8(&mut output, 1);
                put_slice(&mut output, value)?;
            }
            None => put_u8(&mut output, 0),
        }
    }

    Ok(output)
}

/// Decodes snapshot bytes into rows.
///
/// # Errors
///
/// Returns `MdnError::Protocol` when the payload is truncated or
/// semantically invalid.
pub fn decode_rows(payload: &[u8]) -> MdnResult<Vec<Row>> {
    let mut cursor = WireCursor::new(payload);

    let magic = cursor.read_slice(SNAPSHOT_MAGIC.len())?;
    if magic != SNAPSHOT_MAGIC {
        return Err(snapshot_error("invalid snapshot magic".to_owned()));
    }

    let version = cursor.read_u16()?;
    if version != SNAPSHOT_VERSION {
        return Err(snapshot_error(format!(
            "unsupported snapshot version {version}"
        )));
    }

    let row_count = usize::try_from(cursor.read_u32()?)
        .map_err(|_| snapshot_error("row count exceeds platform limits".to_owned()))?;
    let mut rows = Vec::with_capacity(row_count);

    for row_index in 0..row_count {
        let table = cursor.read_vec()?;
        let key = cursor.read_vec()?;
        let timestamp = cursor.read_u64()?;
        let value_flag = cursor.read_u8()?;
        let value = match value_flag {
            0 => None,
            1 => Some(cursor.read_vec()?),
            _ => {
                return Err(snapshot_error(format!(
                    "invalid value flag {value_flag} for row index {row_index}"
                )));
            }
        };
        rows.push(Row {
            table,
            key,
            timestamp,
            value,
        });
    }

    cursor.ensure_fully_consumed()?;
    Ok(rows)
}

/// Persists rows to a snapshot file.
///
/// # Errors
///
/// Returns `MdnError::Protocol` for encoding failures and `MdnError::Io`
/// for filesystem failures.
pub fn write_snapshot_file<P: AsRef<Path>>(path: P, rows: &[Row]) -> MdnResult<()> {
    let payload = encode_rows(rows)?;
    fs::write(path, payload).map_err(|error| MdnError::Io(error.to_string()))
}

/// Loads rows from a snapshot file.
///
/// # Errors
///
/// Returns `MdnError::Io` for filesystem read failures and
/// `MdnError::Protocol` for decode failures.
pub fn read_snapshot_file<P: AsRef<Path>>(path: P) -> MdnResult<Vec<Row>> {
    let payload = fs::read(path).map_err(|error| MdnError::Io(error.to_string()))?;
    decode_rows(&payload)
}

fn snapshot_error(message: String) -> MdnError {
    MdnError::Protocol(format!("snapshot payload error: {message}"))
}

#[cfg(test)]
mod tests {
    use super::{decode_rows, encode_rows, SNAPSHOT_MAGIC};
    use crate::data_layer::Row;
    use googletest::prelude::*;
    use mdn_common::error::MdnError;
    use rstest::rstest;

    fn sample_rows() -> Vec<Row> {
        vec![
            Row {
                table: b"accounts".to_vec(),
                key: b"alice".to_vec(),
                timestamp: 100,
                value: Some(b"500".to_vec()),
            },
            Row {
                table: b"accounts".to_vec(),
                key: b"bob".to_vec(),
                timestamp: 120,
                value: None,
            },
        ]
    }

    #[rstest]
    fn snapshot_codec_round_trips() {
        let rows = sample_rows();
        let encoded = encode_rows(&rows).expect("encoding should succeed");
        let decoded = decode_rows(&encoded).expect("decoding should succeed");
        assert_that!(&decoded, eq(&rows));
    }

    #[rstest]
    fn truncated_payload_is_rejected() {
        let mut encoded = encode_rows(&sample_rows()).expect("encoding should succeed");
        let _ = encoded.pop();
        let error = decode_rows(&encoded).expect_err("truncated payload must fail");
        let MdnError::Protocol(message) = error else {
            panic!("expected protocol error");
        };
        assert_that!(message.contains("unexpected end of payload"), eq(true));
    }

    #[rstest]
    fn unknown_version_is_rejected() {
        let mut encoded = encode_rows(&[]).expect("encoding should succeed");
        encoded[SNAPSHOT_MAGIC.len()] = 9;
        let error = decode_rows(&encoded).expect_err("unknown version must fail");
        let MdnError::Protocol(message) = error else {
            panic!("expected protocol error");
        };
        assert_that!(message.contains("unsupported snapshot version"), eq(true));
    }

    #[rstest]
    fn invalid_value_flag_is_rejected() {
        let mut encoded = encode_rows(&sample_rows()).expect("encoding should succeed");
        // First row's value flag sits after magic, version, count, two
        // slices, and the timestamp.
        let offset = SNAPSHOT_MAGIC.len() + 2 + 4 + (4 + 8) + (4 + 5) + 8;
        encoded[offset] = 7;
        let error = decode_rows(&encoded).expect_err("invalid flag must fail");
        let MdnError::Protocol(message) = error else {
            panic!("expected protocol error");
        };
        assert_that!(message.contains("invalid value flag"), eq(true));
    }
}
