//! Block-compressed serialization of the revision array
//!
//! Layout (all integers little-endian):
//! ```text
//! header:  total_slots u64 | record_count u64 | block_size u32 | block_count u32
//! block:   compressed_len u32 | compressed bytes | raw_len u32
//! raw:     record_count u32 | (record_len u32 | bincode record)*
//! ```
//! Only present records are written. On decode each record is placed at
//! its own `revision`, so gaps survive the round trip. Trailing gaps are
//! returned as a slot count and never allocated.
//!
//! Standalone sections (dictionaries, messages) use [`write_blob`] framing:
//! `compressed_len u32 | raw_len u32 | compressed bytes`.

use crate::error::{CacheError, Result};
use crate::revision::{grow_slots, RevisionRecord};
use flate2::read::{DeflateDecoder, DeflateEncoder};
use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};

/// Default number of records per block
pub const DEFAULT_REVISIONS_IN_BLOCK: usize = 1000;

/// Upper bound for the slot count accepted from a header
const MAX_SLOTS: u64 = i32::MAX as u64;

/// Codec used for every compressed section of a cache file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    Deflate,
    Zstd,
}

impl Compression {
    /// Byte stored in the file header
    pub fn code(self) -> u8 {
        match self {
            Compression::Deflate => 0,
            Compression::Zstd => 1,
        }
    }

    pub fn from_code(code: u8) -> Result<Self> {
        match code {
            0 => Ok(Compression::Deflate),
            1 => Ok(Compression::Zstd),
            other => Err(CacheError::decode("header", format!("unknown codec {}", other))),
        }
    }

    pub fn compress(self, raw: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        match self {
            Compression::Deflate => {
                DeflateEncoder::new(raw, flate2::Compression::default()).read_to_end(&mut out)?;
            }
            Compression::Zstd => {
                out = zstd::stream::encode_all(raw, 0)?;
            }
        }
        Ok(out)
    }

    /// Inflate `data`, requiring exactly `raw_len` bytes of output
    pub fn decompress(self, data: &[u8], raw_len: usize, section: &'static str) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let limit = raw_len as u64 + 1;
        let read = match self {
            Compression::Deflate => DeflateDecoder::new(data).take(limit).read_to_end(&mut out),
            Compression::Zstd => {
                zstd::stream::read::Decoder::new(data).and_then(|d| d.take(limit).read_to_end(&mut out))
            }
        };
        read.map_err(|e| CacheError::decode(section, e))?;
        if out.len() != raw_len {
            return Err(CacheError::decode(
                section,
                format!("expected {} bytes, inflated {}", raw_len, out.len()),
            ));
        }
        Ok(out)
    }
}

pub(crate) fn write_u8(w: &mut impl Write, value: u8) -> Result<()> {
    w.write_all(&[value])?;
    Ok(())
}

pub(crate) fn write_u32(w: &mut impl Write, value: u32) -> Result<()> {
    w.write_all(&value.to_le_bytes())?;
    Ok(())
}

pub(crate) fn write_i32(w: &mut impl Write, value: i32) -> Result<()> {
    w.write_all(&value.to_le_bytes())?;
    Ok(())
}

pub(crate) fn write_u64(w: &mut impl Write, value: u64) -> Result<()> {
    w.write_all(&value.to_le_bytes())?;
    Ok(())
}

fn read_array<const N: usize>(r: &mut impl Read, section: &'static str) -> Result<[u8; N]> {
    let mut buf = [0u8; N];
    r.read_exact(&mut buf).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => CacheError::decode(section, "unexpected end of data"),
        _ => CacheError::Io(e),
    })?;
    Ok(buf)
}

pub(crate) fn read_u8(r: &mut impl Read, section: &'static str) -> Result<u8> {
    Ok(read_array::<1>(r, section)?[0])
}

pub(crate) fn read_u32(r: &mut impl Read, section: &'static str) -> Result<u32> {
    Ok(u32::from_le_bytes(read_array(r, section)?))
}

pub(crate) fn read_i32(r: &mut impl Read, section: &'static str) -> Result<i32> {
    Ok(i32::from_le_bytes(read_array(r, section)?))
}

pub(crate) fn read_u64(r: &mut impl Read, section: &'static str) -> Result<u64> {
    Ok(u64::from_le_bytes(read_array(r, section)?))
}

/// Read exactly `len` bytes without trusting `len` for preallocation
fn read_exact_vec(r: &mut impl Read, len: usize, section: &'static str) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    r.take(len as u64).read_to_end(&mut buf)?;
    if buf.len() != len {
        return Err(CacheError::decode(section, "unexpected end of data"));
    }
    Ok(buf)
}

fn len_u32(len: usize, section: &'static str) -> Result<u32> {
    u32::try_from(len).map_err(|_| CacheError::decode(section, format!("{} bytes exceeds u32", len)))
}

/// Write one compressed, length-prefixed section
pub fn write_blob(w: &mut impl Write, compression: Compression, raw: &[u8]) -> Result<()> {
    let compressed = compression.compress(raw)?;
    write_u32(w, len_u32(compressed.len(), "blob")?)?;
    write_u32(w, len_u32(raw.len(), "blob")?)?;
    w.write_all(&compressed)?;
    Ok(())
}

/// Read a section written by [`write_blob`]
pub fn read_blob(r: &mut impl Read, compression: Compression, section: &'static str) -> Result<Vec<u8>> {
    let compressed_len = read_u32(r, section)? as usize;
    let raw_len = read_u32(r, section)? as usize;
    let compressed = read_exact_vec(r, compressed_len, section)?;
    compression.decompress(&compressed, raw_len, section)
}

/// Encoder/decoder for the revision array
#[derive(Debug, Clone, Copy)]
pub struct BlockCodec {
    block_size: usize,
    compression: Compression,
}

impl BlockCodec {
    pub fn new(block_size: usize, compression: Compression) -> Self {
        Self {
            block_size: block_size.max(1),
            compression,
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Write `revisions` block by block; only one block is buffered at a time.
    ///
    /// `slot_count` is stored as the total when it exceeds `revisions.len()`.
    pub fn encode(
        &self,
        w: &mut impl Write,
        revisions: &[Option<RevisionRecord>],
        slot_count: usize,
    ) -> Result<()> {
        let record_count = revisions.iter().filter(|r| r.is_some()).count();
        let block_count = record_count.div_ceil(self.block_size);

        write_u64(w, slot_count.max(revisions.len()) as u64)?;
        write_u64(w, record_count as u64)?;
        write_u32(w, len_u32(self.block_size, "revisions")?)?;
        write_u32(w, len_u32(block_count, "revisions")?)?;

        let mut present = revisions.iter().flatten().peekable();
        while present.peek().is_some() {
            let block: Vec<&RevisionRecord> = present.by_ref().take(self.block_size).collect();
            let mut raw = Vec::new();
            write_u32(&mut raw, len_u32(block.len(), "revisions")?)?;
            for record in block {
                let bytes = record.to_bytes()?;
                write_u32(&mut raw, len_u32(bytes.len(), "revisions")?)?;
                raw.extend_from_slice(&bytes);
            }

            let compressed = self.compression.compress(&raw)?;
            write_u32(w, len_u32(compressed.len(), "revisions")?)?;
            w.write_all(&compressed)?;
            write_u32(w, len_u32(raw.len(), "revisions")?)?;
        }
        Ok(())
    }

    /// Read the revision array and the declared slot count.
    ///
    /// The array ends at the highest present record. The block size comes
    /// from the header.
    pub fn decode(&self, r: &mut impl Read) -> Result<(Vec<Option<RevisionRecord>>, usize)> {
        const SECTION: &str = "revisions";

        let total_slots = read_u64(r, SECTION)?;
        let record_count = read_u64(r, SECTION)?;
        let block_size = read_u32(r, SECTION)? as u64;
        let block_count = read_u32(r, SECTION)? as u64;

        if total_slots > MAX_SLOTS || record_count > total_slots {
            return Err(CacheError::decode(
                SECTION,
                format!("{} records in {} slots", record_count, total_slots),
            ));
        }
        if block_size == 0 || block_count != record_count.div_ceil(block_size) {
            return Err(CacheError::decode(
                SECTION,
                format!(
                    "{} blocks of {} can not hold {} records",
                    block_count, block_size, record_count
                ),
            ));
        }

        let mut revisions: Vec<Option<RevisionRecord>> = Vec::new();
        let mut decoded = 0u64;
        for _ in 0..block_count {
            let compressed_len = read_u32(r, SECTION)? as usize;
            let compressed = read_exact_vec(r, compressed_len, SECTION)?;
            let raw_len = read_u32(r, SECTION)? as usize;
            let raw = self.compression.decompress(&compressed, raw_len, SECTION)?;

            let mut cursor = raw.as_slice();
            let in_block = read_u32(&mut cursor, SECTION)?;
            for _ in 0..in_block {
                let len = read_u32(&mut cursor, SECTION)? as usize;
                if len > cursor.len() {
                    return Err(CacheError::decode(SECTION, "record overruns its block"));
                }
                let (bytes, rest) = cursor.split_at(len);
                cursor = rest;

                let record = RevisionRecord::from_bytes(bytes)?;
                if record.revision >= total_slots {
                    return Err(CacheError::decode(
                        SECTION,
                        format!("revision {} outside {} slots", record.revision, total_slots),
                    ));
                }
                let slot = record.revision as usize;
                grow_slots(&mut revisions, slot + 1, || None)
                    .map_err(|e| CacheError::decode(SECTION, e))?;
                revisions[slot] = Some(record);
            }
            if !cursor.is_empty() {
                return Err(CacheError::decode(SECTION, "trailing bytes in block"));
            }
            decoded += in_block as u64;
        }

        if decoded != record_count {
            return Err(CacheError::decode(
                SECTION,
                format!("header declares {} records, found {}", record_count, decoded),
            ));
        }
        Ok((revisions, total_slots as usize))
    }
}
