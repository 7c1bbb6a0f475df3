//! Zlib Helpers
//!
//! Thin wrappers used both for message content compression and for
//! stream-level frame compression. Level -1 selects the library default,
//! levels 1..=9 map directly, level 0 means "disabled" and is rejected by the
//! callers before reaching here.

use crate::error::{Error, Result};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use std::io::{Read, Write};

/// Upper bound for a decompressed payload, guards against zip bombs.
const MAX_DECOMPRESSED_SIZE: usize = 64 * 1024 * 1024;

pub(crate) fn clamp_level(level: i32) -> i32 {
    level.clamp(-1, 9)
}

pub(crate) fn zlib_compress(data: &[u8], level: i32) -> Result<Vec<u8>> {
    let compression = match clamp_level(level) {
        -1 => flate2::Compression::default(),
        level => flate2::Compression::new(level as u32),
    };
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(data.len() / 2 + 16), compression);
    encoder
        .write_all(data)
        .map_err(|e| Error::compression(format!("Zlib compression failed: {e}")))?;
    encoder
        .finish()
        .map_err(|e| Error::compression(format!("Zlib compression failed: {e}")))
}

pub(crate) fn zlib_decompress(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(data).take(MAX_DECOMPRESSED_SIZE as u64 + 1);
    let mut out = Vec::with_capacity(data.len() * 2);
    decoder
        .read_to_end(&mut out)
        .map_err(|e| Error::compression(format!("Zlib decompression failed: {e}")))?;
    if out.len() > MAX_DECOMPRESSED_SIZE {
        return Err(Error::compression(format!(
            "Decompressed size exceeds maximum {MAX_DECOMPRESSED_SIZE}"
        )));
    }
    Ok(out)
}
