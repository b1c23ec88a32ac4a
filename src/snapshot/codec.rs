//! Whole-file snapshot codec: framing, compression, integrity.
//!
//! The CRC32 trailer is computed over the post-compression bytes (magic,
//! version/flags, compressed payload), so bit-rot is detected before any
//! decompression is attempted.

use crate::snapshot::format::{
    decode_entry, encode_entry, DecodeError, SnapshotHeader, HEADER_SIZE,
};
use crate::types::SnapshotEntry;
use crc::{Crc, CRC_32_ISO_HDLC};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::io::{Read, Write};
use thiserror::Error;

/// CRC-32 calculator for the file trailer.
const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Payload compression scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    /// Payload stored as-is.
    None,

    /// Payload gzip-compressed.
    Gzip,
}

/// Integrity trailer scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checksum {
    /// No trailer.
    None,

    /// Little-endian CRC32 over all preceding bytes.
    Crc32,
}

/// Encoding options. Decoding always obeys the file's own flags byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodeOptions {
    /// Compression scheme for the payload.
    pub compression: Compression,

    /// Integrity trailer scheme.
    pub checksum: Checksum,
}

impl Default for EncodeOptions {
    fn default() -> Self {
        Self {
            compression: Compression::Gzip,
            checksum: Checksum::Crc32,
        }
    }
}

impl EncodeOptions {
    /// Build options from the two config booleans.
    pub fn from_flags(compress: bool, checksum: bool) -> Self {
        Self {
            compression: if compress {
                Compression::Gzip
            } else {
                Compression::None
            },
            checksum: if checksum {
                Checksum::Crc32
            } else {
                Checksum::None
            },
        }
    }
}

/// Encode-side errors.
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Serialize a set of entries into a complete snapshot byte stream.
///
/// Entries are sorted by key before serialization, so a given logical state
/// always produces the same bytes.
pub fn encode(entries: &[SnapshotEntry], options: &EncodeOptions) -> Result<Vec<u8>, EncodeError> {
    let mut sorted: Vec<&SnapshotEntry> = entries.iter().collect();
    sorted.sort_by(|a, b| a.key.cmp(&b.key));

    let mut payload = Vec::new();
    for entry in sorted {
        encode_entry(entry, &mut payload);
    }

    if options.compression == Compression::Gzip {
        let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(&payload)?;
        payload = encoder.finish()?;
    }

    let header = SnapshotHeader::new(
        options.compression == Compression::Gzip,
        options.checksum == Checksum::Crc32,
    );

    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len() + 4);
    buf.extend_from_slice(&header.to_bytes());
    buf.extend_from_slice(&payload);

    if options.checksum == Checksum::Crc32 {
        let crc = CRC32.checksum(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
    }

    Ok(buf)
}

/// Parse a complete snapshot byte stream back into entries.
///
/// Compression and checksum presence are read from the file's flags byte;
/// no out-of-band knowledge is required.
pub fn decode(bytes: &[u8]) -> Result<Vec<SnapshotEntry>, DecodeError> {
    let header = SnapshotHeader::from_bytes(bytes)?;

    let body = if header.checksumed() {
        if bytes.len() < HEADER_SIZE + 4 {
            return Err(DecodeError::Malformed("truncated checksum trailer"));
        }
        let split = bytes.len() - 4;
        let stored = u32::from_le_bytes(bytes[split..].try_into().expect("4-byte slice"));
        let computed = CRC32.checksum(&bytes[..split]);
        if stored != computed {
            return Err(DecodeError::ChecksumMismatch {
                expected: stored,
                actual: computed,
            });
        }
        &bytes[HEADER_SIZE..split]
    } else {
        &bytes[HEADER_SIZE..]
    };

    let payload = if header.compressed() {
        let mut decoder = GzDecoder::new(body);
        let mut decompressed = Vec::new();
        decoder
            .read_to_end(&mut decompressed)
            .map_err(|e| DecodeError::Decompress(e.to_string()))?;
        decompressed
    } else {
        body.to_vec()
    };

    let mut entries = Vec::new();
    let mut pos = 0;
    while pos < payload.len() {
        let (entry, consumed) = decode_entry(&payload[pos..])?;
        entries.push(entry);
        pos += consumed;
    }

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Value;
    use bytes::Bytes;
    use std::collections::{BTreeMap, BTreeSet};

    fn sample_entries() -> Vec<SnapshotEntry> {
        vec![
            SnapshotEntry::new("alpha", Value::from("one")),
            SnapshotEntry::new("beta", Value::Int(2)),
            SnapshotEntry::with_expiry("gamma", Value::from("ttl"), 4_000_000_000_000),
            SnapshotEntry::new(
                "delta",
                Value::List(vec![Bytes::from("x"), Bytes::from("y")]),
            ),
            SnapshotEntry::new(
                "epsilon",
                Value::Set([Bytes::from("m")].into_iter().collect::<BTreeSet<_>>()),
            ),
            SnapshotEntry::new(
                "zeta",
                Value::SortedSet(
                    [(Bytes::from("a"), 0.5)]
                        .into_iter()
                        .collect::<BTreeMap<_, _>>(),
                ),
            ),
        ]
    }

    fn sort_by_key(mut entries: Vec<SnapshotEntry>) -> Vec<SnapshotEntry> {
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        entries
    }

    #[test]
    fn test_roundtrip_all_option_combinations() {
        let entries = sample_entries();
        let combos = [
            (Compression::None, Checksum::None),
            (Compression::None, Checksum::Crc32),
            (Compression::Gzip, Checksum::None),
            (Compression::Gzip, Checksum::Crc32),
        ];

        for (compression, checksum) in combos {
            let options = EncodeOptions {
                compression,
                checksum,
            };
            let bytes = encode(&entries, &options).unwrap();
            let decoded = decode(&bytes).unwrap();
            assert_eq!(
                decoded,
                sort_by_key(entries.clone()),
                "roundtrip failed for {:?}",
                options
            );
        }
    }

    #[test]
    fn test_encoding_is_deterministic() {
        let entries = sample_entries();
        let mut reversed = entries.clone();
        reversed.reverse();

        let options = EncodeOptions::default();
        assert_eq!(
            encode(&entries, &options).unwrap(),
            encode(&reversed, &options).unwrap()
        );
    }

    #[test]
    fn test_empty_snapshot_roundtrip() {
        let bytes = encode(&[], &EncodeOptions::default()).unwrap();
        assert_eq!(decode(&bytes).unwrap(), Vec::<SnapshotEntry>::new());
    }

    #[test]
    fn test_decode_needs_no_out_of_band_options() {
        // Encode uncompressed, decode must not attempt gunzip.
        let entries = sample_entries();
        let bytes = encode(&entries, &EncodeOptions::from_flags(false, true)).unwrap();
        assert_eq!(decode(&bytes).unwrap(), sort_by_key(entries));
    }

    #[test]
    fn test_bit_flip_in_payload_fails_checksum() {
        let bytes = encode(&sample_entries(), &EncodeOptions::default()).unwrap();

        for bit in [0usize, 3, 7] {
            for pos in [HEADER_SIZE, HEADER_SIZE + 5, bytes.len() - 5] {
                let mut corrupted = bytes.clone();
                corrupted[pos] ^= 1 << bit;
                assert!(
                    matches!(decode(&corrupted), Err(DecodeError::ChecksumMismatch { .. })),
                    "flip of bit {} at {} not caught",
                    bit,
                    pos
                );
            }
        }
    }

    #[test]
    fn test_truncated_file_fails_checksum() {
        let bytes = encode(&sample_entries(), &EncodeOptions::default()).unwrap();
        let truncated = &bytes[..bytes.len() - 1];
        assert!(matches!(
            decode(truncated),
            Err(DecodeError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_garbage_compressed_payload_is_decompress_error() {
        // Valid header claiming gzip, garbage payload, no checksum.
        let header = SnapshotHeader::new(true, false);
        let mut bytes = header.to_bytes().to_vec();
        bytes.extend_from_slice(b"this is not a gzip stream");

        assert!(matches!(decode(&bytes), Err(DecodeError::Decompress(_))));
    }

    #[test]
    fn test_bad_magic() {
        let mut bytes = encode(&sample_entries(), &EncodeOptions::from_flags(false, false)).unwrap();
        bytes[0] = b'X';
        assert!(matches!(decode(&bytes), Err(DecodeError::BadMagic)));
    }

    #[test]
    fn test_compression_shrinks_repetitive_data() {
        let entries: Vec<SnapshotEntry> = (0..200)
            .map(|i| {
                SnapshotEntry::new(
                    format!("key:{:05}", i),
                    Value::Str(Bytes::from(vec![b'v'; 100])),
                )
            })
            .collect();

        let plain = encode(&entries, &EncodeOptions::from_flags(false, false)).unwrap();
        let packed = encode(&entries, &EncodeOptions::from_flags(true, false)).unwrap();
        assert!(packed.len() < plain.len());
    }
}
