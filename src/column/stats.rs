//! Readers for the reserved cells of a row batch: the stats rows and the
//! delete mask.
//!
//! Both payloads are little-endian and start with a non-negative i32
//! encoding id like every decompressed column payload, then an i32 count.
//! The delete mask follows its count with a bitmap, one bit per row.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};

const PAYLOAD_HEADER_SIZE: usize = 8;

/// Decodes the per-batch statistics row.
pub struct StatsReader;

impl StatsReader {
    /// The row count carried by a stats-row payload. Compressed or
    /// truncated input is rejected, never guessed at.
    pub fn row_count(payload: &[u8]) -> Result<i32> {
        let (_, count) = read_header(payload, "stats row")?;
        Ok(count)
    }

    /// Encodes a stats row carrying `row_count`.
    pub fn encode(encoding_id: i32, row_count: i32) -> Vec<u8> {
        encode_header(encoding_id, row_count)
    }
}

/// Decodes the per-batch delete mask: a deleted-row count plus a bitmap
/// with one bit per row.
pub struct DeleteMaskReader;

impl DeleteMaskReader {
    pub fn deleted_count(payload: &[u8]) -> Result<i32> {
        let (_, count) = read_header(payload, "delete mask")?;
        Ok(count)
    }

    /// Whether `row` is marked deleted. Rows past the bitmap are live.
    pub fn is_deleted(payload: &[u8], row: usize) -> Result<bool> {
        read_header(payload, "delete mask")?;
        let bitmap = &payload[PAYLOAD_HEADER_SIZE..];
        let byte = row / 8;
        if byte >= bitmap.len() {
            return Ok(false);
        }
        Ok(bitmap[byte] & (1 << (row % 8)) != 0)
    }

    /// Encodes a delete mask over `rows` rows with the given deleted row
    /// positions.
    pub fn encode(encoding_id: i32, rows: usize, deleted_rows: &[usize]) -> Vec<u8> {
        let mut payload = encode_header(encoding_id, deleted_rows.len() as i32);
        let mut bitmap = vec![0u8; rows.div_ceil(8)];
        for &row in deleted_rows {
            bitmap[row / 8] |= 1 << (row % 8);
        }
        payload.extend_from_slice(&bitmap);
        payload
    }
}

fn read_header(payload: &[u8], what: &str) -> Result<(i32, i32)> {
    let mut cursor = payload;
    let encoding_id = cursor
        .read_i32::<LittleEndian>()
        .map_err(|_| crate::errcorrupt!("{what} payload truncated"))?;
    if encoding_id < 0 {
        return Err(Error::CorruptValue(format!(
            "{what} payload is compressed (leading int {encoding_id})"
        )));
    }
    let count = cursor
        .read_i32::<LittleEndian>()
        .map_err(|_| crate::errcorrupt!("{what} payload truncated"))?;
    if count < 0 {
        return Err(crate::errcorrupt!("{what} count is {count}"));
    }
    Ok((encoding_id, count))
}

fn encode_header(encoding_id: i32, count: i32) -> Vec<u8> {
    let mut payload = Vec::with_capacity(PAYLOAD_HEADER_SIZE);
    payload.write_i32::<LittleEndian>(encoding_id).expect("vec write");
    payload.write_i32::<LittleEndian>(count).expect("vec write");
    payload
}
