//! Compression codec registry and the compress/decompress entry points.
//!
//! A compressed payload is framed as, all little-endian:
//!
//! ```text
//! offset  size  field
//!   0      4   -codec id (negative marks the payload compressed)
//!   4      4   uncompressed length
//!   8      *   codec output
//! ```
//!
//! so decompression needs no side channel for sizing. A decompressed
//! payload starts with a non-negative i32 (the table encoding id) and is
//! passed to the codec whole; decompression reproduces it byte for byte.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};
use crate::region::PerfStats;

/// Size of the codec frame in front of the compressed bytes.
pub const COMPRESSED_FRAME_HEADER: usize = 8;

/// Registered compression codecs. The id appears negated as the leading
/// i32 of a compressed payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CodecId {
    None,
    Lz4,
    Zstd,
}

impl CodecId {
    pub const DEFAULT: CodecId = CodecId::Lz4;

    pub fn id(&self) -> i32 {
        match self {
            CodecId::None => 0,
            CodecId::Lz4 => 1,
            CodecId::Zstd => 2,
        }
    }

    pub fn from_id(id: i32) -> Result<Self> {
        match id {
            0 => Ok(CodecId::None),
            1 => Ok(CodecId::Lz4),
            2 => Ok(CodecId::Zstd),
            other => Err(Error::BadArgument(format!("unknown codec id {other}"))),
        }
    }

    /// True iff `id` names a codec that actually compresses the payload.
    pub fn is_compressed(id: i32) -> bool {
        id > 0
    }

    /// Parses a codec name, for configuration.
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "none" => Ok(CodecId::None),
            "lz4" => Ok(CodecId::Lz4),
            "zstd" => Ok(CodecId::Zstd),
            other => Err(Error::BadArgument(format!("unknown codec \"{other}\""))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            CodecId::None => "none",
            CodecId::Lz4 => "lz4",
            CodecId::Zstd => "zstd",
        }
    }
}

/// Upper bound on the framed output size for a payload of `len` bytes.
pub fn max_compressed_size(codec: CodecId, len: usize) -> usize {
    let bound = match codec {
        CodecId::None => len,
        CodecId::Lz4 => lz4_flex::block::get_maximum_output_size(len),
        CodecId::Zstd => zstd::zstd_safe::compress_bound(len),
    };
    COMPRESSED_FRAME_HEADER + bound
}

/// Compresses `src` into a framed payload. Returns `Ok(None)` when the
/// framed output would not be smaller than the source, in which case the
/// caller keeps the source verbatim and records a skip.
pub fn compress(codec: CodecId, src: &[u8], stats: Option<&PerfStats>) -> Result<Option<Vec<u8>>> {
    if codec == CodecId::None {
        return Ok(None);
    }
    let start = stats.map(PerfStats::start_compression);

    let compressed = match codec {
        CodecId::None => unreachable!(),
        CodecId::Lz4 => lz4_flex::compress(src),
        CodecId::Zstd => zstd::bulk::compress(src, ZSTD_LEVEL)
            .map_err(|e| Error::IO(format!("zstd compress: {e}")))?,
    };

    if COMPRESSED_FRAME_HEADER + compressed.len() >= src.len() {
        if let (Some(stats), Some(start)) = (stats, start) {
            stats.end_compression(start, src.len(), None);
        }
        return Ok(None);
    }

    let mut framed = Vec::with_capacity(COMPRESSED_FRAME_HEADER + compressed.len());
    framed.write_i32::<LittleEndian>(-codec.id())?;
    framed.write_i32::<LittleEndian>(src.len() as i32)?;
    framed.extend_from_slice(&compressed);

    if let (Some(stats), Some(start)) = (stats, start) {
        stats.end_compression(start, src.len(), Some(framed.len()));
    }
    Ok(Some(framed))
}

/// Decompresses a framed payload produced by [`compress`], reproducing
/// the original payload byte for byte.
pub fn decompress(src: &[u8], stats: Option<&PerfStats>) -> Result<Vec<u8>> {
    let mut cursor = src;
    let leading = cursor
        .read_i32::<LittleEndian>()
        .map_err(|_| Error::CorruptValue("compressed payload shorter than its frame".to_string()))?;
    if leading >= 0 {
        return Err(Error::CorruptValue(format!(
            "payload is not compressed, leading int is {leading}"
        )));
    }
    let codec = CodecId::from_id(-leading)
        .map_err(|_| Error::CorruptValue(format!("unknown codec id {}", -leading)))?;
    let uncompressed_len = cursor.read_i32::<LittleEndian>().map_err(|_| {
        Error::CorruptValue("compressed payload shorter than its frame".to_string())
    })?;
    if uncompressed_len < 0 {
        return Err(Error::CorruptValue(format!(
            "negative uncompressed length {uncompressed_len}"
        )));
    }
    let uncompressed_len = uncompressed_len as usize;

    let start = stats.map(PerfStats::start_decompression);
    let out = match codec {
        CodecId::None => {
            return Err(Error::CorruptValue(
                "codec id 0 cannot appear in a compressed payload".to_string(),
            ))
        }
        CodecId::Lz4 => lz4_flex::decompress(cursor, uncompressed_len)
            .map_err(|e| Error::CorruptValue(format!("lz4 decompress: {e}")))?,
        CodecId::Zstd => zstd::bulk::decompress(cursor, uncompressed_len)
            .map_err(|e| Error::CorruptValue(format!("zstd decompress: {e}")))?,
    };
    if out.len() != uncompressed_len {
        return Err(Error::CorruptValue(format!(
            "decompressed to {} bytes, frame promised {uncompressed_len}",
            out.len()
        )));
    }
    if let (Some(stats), Some(start)) = (stats, start) {
        stats.end_decompression(start, out.len());
    }
    Ok(out)
}

const ZSTD_LEVEL: i32 = 1;
