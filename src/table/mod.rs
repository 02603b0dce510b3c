//! Immutable table files.
//!
//! A table file is an append-only batch of chunks with a prefix-sorted
//! lookup index at its tail. All integers are big-endian.
//!
//! # File Format
//!
//! ```text
//! +--------------------------------------------------+
//! | chunk record 0 .. chunk record N-1               |  data region,
//! |   each: u32 dataLen | [u8;20] address | data     |  insertion order
//! +--------------------------------------------------+
//! | (u64 prefix, u32 ordinal) x N, sorted by prefix  |  index region
//! | u32 recordLen x N, ordinal order                 |
//! | [u8;12] suffix x N, ordinal order                |
//! +--------------------------------------------------+
//! | footer: u32 N | u64 totalDataLen | [u8;8] magic  |
//! +--------------------------------------------------+
//! ```
//!
//! Record offsets are not stored; they are the prefix-sum of the record
//! lengths in ordinal order. The file's name is the address of its index
//! region plus footer, which makes table files content-addressed and hence
//! immutable: a table is never rewritten, only replaced wholesale by a
//! conjoin.

pub mod index;
pub mod reader;
pub mod writer;

use std::collections::HashMap;
use std::sync::mpsc::Sender;

use crate::chunk::Chunk;
use crate::errdata;
use crate::error::Result;
use crate::hash::{Addr, ADDR_LEN};

pub use index::{IndexEntry, TableIndex};
pub use reader::{TableData, TableReader};
pub use writer::write_table;

pub const TABLE_MAGIC: [u8; 8] = *b"strata01";

/// Footer byte length: chunk count + total data length + magic.
pub const FOOTER_LEN: usize = 4 + 8 + 8;

/// Per-chunk index entry byte length: prefix tuple + length + suffix.
pub const INDEX_ENTRY_LEN: usize = (8 + 4) + 4 + 12;

/// Framing ahead of each chunk's data: data length + full address.
pub const RECORD_HEADER_LEN: usize = 4 + ADDR_LEN;

/// Byte length of the index region plus footer for a table of `count` chunks.
pub fn index_region_len(count: u32) -> u64 {
    count as u64 * INDEX_ENTRY_LEN as u64 + FOOTER_LEN as u64
}

/// Byte length of one framed chunk record.
pub fn record_len(data_len: usize) -> u64 {
    (RECORD_HEADER_LEN + data_len) as u64
}

/// One pending lookup in a batched read. Requests are sorted by prefix so
/// each table can resolve them with one binary search apiece; `found` marks
/// requests already satisfied by a younger layer.
#[derive(Debug, Clone)]
pub struct GetRecord {
    pub prefix: u64,
    pub addr: Addr,
    pub found: bool,
}

/// One pending lookup in a batched presence check.
#[derive(Debug, Clone)]
pub struct HasRecord {
    pub prefix: u64,
    pub addr: Addr,
    pub has: bool,
}

/// Builds prefix-sorted, deduplicated get records for the given addresses.
pub fn to_get_records(addrs: &[Addr]) -> Vec<GetRecord> {
    let mut sorted: Vec<Addr> = addrs.to_vec();
    sorted.sort_unstable();
    sorted.dedup();
    sorted
        .into_iter()
        .map(|addr| GetRecord {
            prefix: addr.prefix(),
            addr,
            found: false,
        })
        .collect()
}

/// Builds prefix-sorted, deduplicated has records for the given addresses.
pub fn to_has_records(addrs: &[Addr]) -> Vec<HasRecord> {
    let mut sorted: Vec<Addr> = addrs.to_vec();
    sorted.sort_unstable();
    sorted.dedup();
    sorted
        .into_iter()
        .map(|addr| HasRecord {
            prefix: addr.prefix(),
            addr,
            has: false,
        })
        .collect()
}

/// The byte range of one chunk record within a table file, as served to
/// remote-protocol clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkLocation {
    pub offset: u64,
    pub length: u32,
}

/// A readable table of chunks: a parsed table file over some byte source.
///
/// Sources are shared snapshots (`Arc`) across concurrently-read table set
/// generations, so all methods take `&self`.
pub trait ChunkSource: Send + Sync {
    /// The table's content address.
    fn name(&self) -> Addr;

    /// Number of chunks in the table.
    fn count(&self) -> u32;

    /// Total uncompressed chunk data length.
    fn uncompressed_len(&self) -> u64;

    /// Total byte length of the table file.
    fn physical_len(&self) -> u64;

    fn has(&self, addr: &Addr) -> Result<bool>;

    /// Marks records present in this table. Returns whether any record is
    /// still unresolved.
    fn has_many(&self, reqs: &mut [HasRecord]) -> Result<bool>;

    fn get(&self, addr: &Addr) -> Result<Option<Vec<u8>>>;

    /// Reads all still-unfound records that this table holds, delivering
    /// them through `sink`, and marks them found. Returns whether any
    /// record remains unserved.
    fn get_many(&self, reqs: &mut [GetRecord], sink: &Sender<Chunk>) -> Result<bool>;

    /// Estimates the physical reads needed to serve the still-unfound
    /// records this table holds, marking them found. Returns
    /// `(reads, split, remaining)` where `split` reports whether any single
    /// read spans more than `block_size` bytes.
    fn calc_reads(&self, reqs: &mut [GetRecord], block_size: u64) -> Result<(usize, bool, bool)>;

    /// Resolves the byte ranges of the requested chunks within this table,
    /// removing resolved addresses from `addrs`.
    fn chunk_ranges(&self, addrs: &mut Vec<Addr>) -> Result<HashMap<Addr, ChunkLocation>>;

    /// Reads every chunk in the table, in ordinal order.
    fn all_chunks(&self) -> Result<Vec<Chunk>>;
}

impl std::fmt::Debug for dyn ChunkSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkSource").field("name", &self.name()).finish()
    }
}

/// Parses and verifies one framed chunk record. The record must carry the
/// expected address and its data must hash back to it.
pub(crate) fn parse_record(buf: &[u8], expected: &Addr) -> Result<Vec<u8>> {
    if buf.len() < RECORD_HEADER_LEN {
        return errdata!("truncated chunk record: {} bytes", buf.len());
    }
    let data_len = u32::from_be_bytes(buf[..4].try_into().unwrap()) as usize;
    if buf.len() != RECORD_HEADER_LEN + data_len {
        return errdata!(
            "chunk record length mismatch: framed {} bytes, indexed {}",
            RECORD_HEADER_LEN + data_len,
            buf.len()
        );
    }
    let addr = Addr::from_slice(&buf[4..4 + ADDR_LEN])?;
    if addr != *expected {
        return errdata!("chunk record for {addr} found where {expected} was indexed");
    }
    let data = buf[RECORD_HEADER_LEN..].to_vec();
    if Addr::of(&data) != *expected {
        return errdata!("chunk {expected} is corrupt: content hash mismatch");
    }
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_get_records_sorted_and_deduped() {
        let a = Addr::of(b"a");
        let b = Addr::of(b"b");
        let reqs = to_get_records(&[b, a, b]);
        assert_eq!(reqs.len(), 2);
        assert!(reqs[0].prefix <= reqs[1].prefix);
        assert!(reqs.iter().all(|r| !r.found));
    }

    #[test]
    fn test_parse_record_round_trip() -> Result<()> {
        let data = b"payload".to_vec();
        let addr = Addr::of(&data);
        let mut rec = Vec::new();
        rec.extend_from_slice(&(data.len() as u32).to_be_bytes());
        rec.extend_from_slice(addr.as_bytes());
        rec.extend_from_slice(&data);

        assert_eq!(parse_record(&rec, &addr)?, data);
        Ok(())
    }

    #[test]
    fn test_parse_record_detects_flipped_byte() {
        let data = b"payload".to_vec();
        let addr = Addr::of(&data);
        let mut rec = Vec::new();
        rec.extend_from_slice(&(data.len() as u32).to_be_bytes());
        rec.extend_from_slice(addr.as_bytes());
        rec.extend_from_slice(&data);

        rec[RECORD_HEADER_LEN] ^= 0xff;
        assert!(parse_record(&rec, &addr).is_err());
    }

    #[test]
    fn test_parse_record_detects_wrong_address() {
        let data = b"payload".to_vec();
        let addr = Addr::of(&data);
        let other = Addr::of(b"other");
        let mut rec = Vec::new();
        rec.extend_from_slice(&(data.len() as u32).to_be_bytes());
        rec.extend_from_slice(addr.as_bytes());
        rec.extend_from_slice(&data);

        assert!(parse_record(&rec, &other).is_err());
    }
}
