//! Framing for compressed memcached values: a 12-byte header (magic,
//! original length, xxhash32 of the compressed payload, all big-endian)
//! followed by an LZ4 block.

use xxhash_rust::xxh32::xxh32;

const MAGIC: u32 = 0x1a7f_b4f5;
const HEADER_SIZE: usize = 12;

/// Values below this many bytes are never worth compressing.
pub const ZIP_THRESHOLD: usize = 864;
/// Compressed form must be strictly smaller than this share of the input.
const ZIP_SIZE_PERCENT: f64 = 0.95;
/// Hard cap on the uncompressed size, either direction.
pub const ZIP_MAX_SIZE: usize = 1024 * 1024 * 16 - 1;
const ZIP_MIN_SIZE: usize = 48;

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ZipError {
    #[error("input too small to benefit")]
    TooSmall,
    #[error("input exceeds the size cap")]
    TooLarge,
    #[error("compression gains less than the required margin")]
    NoGain,
    #[error("framing header is truncated")]
    Truncated,
    #[error("bad framing magic")]
    BadMagic,
    #[error("original length out of range")]
    BadLength,
    #[error("payload checksum mismatch")]
    BadHash,
    #[error("payload does not decompress to the framed length")]
    Corrupt,
}

/// Compress `input`, returning the framed bytes, or an error when the
/// input is out of range or compression doesn't pay.
pub fn attempt_zip(input: &[u8]) -> Result<Vec<u8>, ZipError> {
    if input.len() < ZIP_MIN_SIZE {
        return Err(ZipError::TooSmall);
    }
    if input.len() > ZIP_MAX_SIZE {
        return Err(ZipError::TooLarge);
    }

    let compressed = lz4_flex::block::compress(input);
    let framed_len = compressed.len() + HEADER_SIZE;
    if framed_len as f64 >= input.len() as f64 * ZIP_SIZE_PERCENT {
        return Err(ZipError::NoGain);
    }

    let mut out = Vec::with_capacity(framed_len);
    out.extend_from_slice(&MAGIC.to_be_bytes());
    out.extend_from_slice(&(input.len() as u32).to_be_bytes());
    out.extend_from_slice(&xxh32(&compressed, 0).to_be_bytes());
    out.extend_from_slice(&compressed);
    Ok(out)
}

/// Decompress a framed value, verifying magic, length and checksum.
pub fn attempt_unzip(input: &[u8]) -> Result<Vec<u8>, ZipError> {
    if input.len() <= HEADER_SIZE {
        return Err(ZipError::Truncated);
    }

    let magic = u32::from_be_bytes(input[0..4].try_into().unwrap());
    let length = u32::from_be_bytes(input[4..8].try_into().unwrap()) as usize;
    let hash = u32::from_be_bytes(input[8..12].try_into().unwrap());

    if magic != MAGIC {
        return Err(ZipError::BadMagic);
    }
    if length > ZIP_MAX_SIZE {
        return Err(ZipError::BadLength);
    }

    let payload = &input[HEADER_SIZE..];
    if xxh32(payload, 0) != hash {
        return Err(ZipError::BadHash);
    }

    match lz4_flex::block::decompress(payload, length) {
        Ok(out) if out.len() == length => Ok(out),
        _ => Err(ZipError::Corrupt),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compressible(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i / 64) as u8).collect()
    }

    fn noisy(len: usize) -> Vec<u8> {
        let mut x: u32 = 0x9e37_79b9;
        (0..len)
            .map(|_| {
                x ^= x << 13;
                x ^= x >> 17;
                x ^= x << 5;
                x as u8
            })
            .collect()
    }

    #[test]
    fn round_trip() {
        let input = compressible(4096);
        let framed = attempt_zip(&input).unwrap();
        assert!(framed.len() < input.len());
        assert_eq!(attempt_unzip(&framed).unwrap(), input);
    }

    #[test]
    fn refuses_small_and_incompressible() {
        assert_eq!(attempt_zip(b"tiny"), Err(ZipError::TooSmall));

        // High-entropy input compresses badly: no gain.
        assert_eq!(attempt_zip(&noisy(2048)), Err(ZipError::NoGain));
    }

    #[test]
    fn rejects_corrupt_framing() {
        let mut framed = attempt_zip(&compressible(4096)).unwrap();

        let mut bad_magic = framed.clone();
        bad_magic[0] ^= 0xff;
        assert_eq!(attempt_unzip(&bad_magic), Err(ZipError::BadMagic));

        let mut bad_hash = framed.clone();
        bad_hash[8] ^= 0xff;
        assert_eq!(attempt_unzip(&bad_hash), Err(ZipError::BadHash));

        // Flip a payload byte: the checksum catches it.
        let last = framed.len() - 1;
        framed[last] ^= 0xff;
        assert_eq!(attempt_unzip(&framed), Err(ZipError::BadHash));

        assert_eq!(attempt_unzip(&[0u8; 12]), Err(ZipError::Truncated));
    }
}
