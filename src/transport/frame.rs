//! Stream Frame Format
//!
//! Every stream frame is `[i32 length][body]` with the length big-endian.
//!
//! Unencrypted mode reuses the sign of the length as the compression flag:
//! positive means a raw body, negative a zipped one, and the absolute value
//! is the body size.
//!
//! Encrypted mode keeps the length positive. The body is
//! `[mac(16)][nonce(24)][ciphertext]` and the ciphertext decrypts to
//! `[u8 is_compressed][u32 data_len][data][u32 pad_len][pad]`, where the
//! random padding rounds the plaintext up to a multiple of 16 bytes so the
//! frame leaks less about the payload size.

use crate::compress::{zlib_compress, zlib_decompress};
use crate::error::{Error, Result};
use crate::transport::crypto::SessionCrypto;
use byteorder::{BigEndian, ByteOrder};
use rand::RngCore;

/// Encrypted plaintext is padded up to a multiple of this block size.
const PADDING_BLOCK: usize = 16;

/// Frames larger than this are treated as a wire corruption.
pub(crate) const MAX_FRAME_SIZE: usize = 256 * 1024 * 1024;

/// Compresses a serialized message for the stream when the policy calls for
/// it.
pub(crate) fn compress_payload(data: &[u8], level: i32) -> Result<Vec<u8>> {
    zlib_compress(data, level)
}

/// Packs a serialized message into a complete frame, length prefix included.
pub(crate) fn pack_frame(
    payload: Vec<u8>,
    compressed: bool,
    crypto: Option<&SessionCrypto>,
) -> Result<Vec<u8>> {
    if payload.len() > MAX_FRAME_SIZE {
        return Err(Error::format(format!(
            "Frame payload size {} exceeds maximum {MAX_FRAME_SIZE}",
            payload.len()
        )));
    }

    let body = match crypto {
        Some(crypto) => {
            let plain = pad_plaintext(&payload, compressed);
            crypto.seal(&plain)?
        }
        None => payload,
    };

    let mut length = body.len() as i32;
    if crypto.is_none() && compressed {
        length = -length;
    }

    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&length.to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Unpacks a frame body back into the serialized message bytes.
///
/// `length` is the signed value read from the frame prefix; `body` holds
/// `|length|` bytes.
pub(crate) fn unpack_body(
    length: i32,
    body: &[u8],
    crypto: Option<&SessionCrypto>,
) -> Result<Vec<u8>> {
    match crypto {
        Some(crypto) => {
            let plain = crypto.open(body)?;
            let (data, compressed) = unpad_plaintext(&plain)?;
            if compressed {
                zlib_decompress(&data)
            } else {
                Ok(data)
            }
        }
        None => {
            if length < 0 {
                zlib_decompress(body)
            } else {
                Ok(body.to_vec())
            }
        }
    }
}

/// Builds `[u8 is_compressed][u32 data_len][data][u32 pad_len][pad]` with
/// cryptographically random padding rounding the total up to a
/// [`PADDING_BLOCK`] multiple.
fn pad_plaintext(data: &[u8], compressed: bool) -> Vec<u8> {
    let base = 1 + 4 + data.len();
    let mut padded = (base / PADDING_BLOCK + 1) * PADDING_BLOCK;
    if padded - base <= 4 {
        padded += PADDING_BLOCK;
    }
    let pad_len = padded - base - 4;

    let mut plain = Vec::with_capacity(padded);
    plain.push(compressed as u8);
    plain.extend_from_slice(&(data.len() as u32).to_be_bytes());
    plain.extend_from_slice(data);
    plain.extend_from_slice(&(pad_len as u32).to_be_bytes());
    let start = plain.len();
    plain.resize(start + pad_len, 0);
    rand::thread_rng().fill_bytes(&mut plain[start..]);
    plain
}

fn unpad_plaintext(plain: &[u8]) -> Result<(Vec<u8>, bool)> {
    if plain.len() < 5 {
        return Err(Error::format("Encrypted frame plaintext too short"));
    }
    let compressed = plain[0] != 0;
    let data_len = BigEndian::read_u32(&plain[1..5]) as usize;
    if plain.len() < 5 + data_len {
        return Err(Error::format(format!(
            "Encrypted frame data length {data_len} exceeds plaintext size {}",
            plain.len()
        )));
    }
    Ok((plain[5..5 + data_len].to_vec(), compressed))
}
