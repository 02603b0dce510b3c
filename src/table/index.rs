use byteorder::{BigEndian, ReadBytesExt};

use super::{index_region_len, ChunkLocation, FOOTER_LEN, INDEX_ENTRY_LEN, TABLE_MAGIC};
use crate::errdata;
use crate::error::Result;
use crate::hash::{Addr, ADDR_LEN, PREFIX_LEN, SUFFIX_LEN};

/// The record offset and framed length of one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub offset: u64,
    pub length: u32,
}

impl IndexEntry {
    pub fn location(&self) -> ChunkLocation {
        ChunkLocation {
            offset: self.offset,
            length: self.length,
        }
    }
}

/// The parsed lookup index of a table file.
///
/// All vectors are owned copies of the on-disk index region; the mapping
/// used to read it is released once parsing completes. Parsed indices are
/// shared through the index cache as `Arc<TableIndex>`, so a cache eviction
/// frees the memory only after the last reader drops its handle.
pub struct TableIndex {
    chunk_count: u32,
    total_data: u64,
    /// sorted; parallel to `ordinals`
    prefixes: Vec<u64>,
    ordinals: Vec<u32>,
    /// framed record lengths, ordinal order
    lengths: Vec<u32>,
    /// prefix-sum of `lengths`, ordinal order
    offsets: Vec<u64>,
    /// `SUFFIX_LEN`-byte suffixes, ordinal order
    suffixes: Vec<u8>,
}

impl TableIndex {
    /// Reads the chunk count and total data length out of a footer. Used by
    /// backends that must size the index fetch before reading it.
    pub fn parse_footer(buf: &[u8]) -> Result<(u32, u64)> {
        if buf.len() != FOOTER_LEN {
            return errdata!("table footer must be {FOOTER_LEN} bytes, got {}", buf.len());
        }
        if buf[12..] != TABLE_MAGIC {
            return errdata!("bad table magic");
        }
        let mut r = &buf[..];
        let count = r.read_u32::<BigEndian>()?;
        let total_data = r.read_u64::<BigEndian>()?;
        Ok((count, total_data))
    }

    /// Parses a complete index region plus footer, exactly as sliced from
    /// the tail of a table file.
    pub fn parse(buf: &[u8]) -> Result<TableIndex> {
        if buf.len() < FOOTER_LEN {
            return errdata!("table tail too short: {} bytes", buf.len());
        }
        let (count, total_data) = Self::parse_footer(&buf[buf.len() - FOOTER_LEN..])?;
        if buf.len() as u64 != index_region_len(count) {
            return errdata!(
                "table index region for {count} chunks must be {} bytes, got {}",
                index_region_len(count),
                buf.len()
            );
        }

        let n = count as usize;
        let mut prefixes = Vec::with_capacity(n);
        let mut ordinals = Vec::with_capacity(n);
        let mut lengths = Vec::with_capacity(n);

        let mut r = &buf[..n * (PREFIX_LEN + 4)];
        for _ in 0..n {
            prefixes.push(r.read_u64::<BigEndian>()?);
            let ordinal = r.read_u32::<BigEndian>()?;
            if ordinal >= count {
                return errdata!("table index ordinal {ordinal} out of range ({count} chunks)");
            }
            ordinals.push(ordinal);
        }

        let mut r = &buf[n * (PREFIX_LEN + 4)..n * (PREFIX_LEN + 4 + 4)];
        for _ in 0..n {
            lengths.push(r.read_u32::<BigEndian>()?);
        }

        let suffixes = buf[n * (PREFIX_LEN + 4 + 4)..n * INDEX_ENTRY_LEN].to_vec();

        let mut offsets = Vec::with_capacity(n);
        let mut offset = 0u64;
        for length in &lengths {
            offsets.push(offset);
            offset += *length as u64;
        }

        Ok(TableIndex {
            chunk_count: count,
            total_data,
            prefixes,
            ordinals,
            lengths,
            offsets,
            suffixes,
        })
    }

    pub fn chunk_count(&self) -> u32 {
        self.chunk_count
    }

    /// Total uncompressed chunk data length, from the footer.
    pub fn uncompressed_len(&self) -> u64 {
        self.total_data
    }

    /// Total byte length of the table file this index describes.
    pub fn physical_len(&self) -> u64 {
        let data: u64 = self.lengths.iter().map(|l| *l as u64).sum();
        data + index_region_len(self.chunk_count)
    }

    /// Approximate in-memory weight, for cache accounting.
    pub fn weight(&self) -> u64 {
        index_region_len(self.chunk_count) + std::mem::size_of::<TableIndex>() as u64
    }

    pub fn entry(&self, ordinal: u32) -> IndexEntry {
        IndexEntry {
            offset: self.offsets[ordinal as usize],
            length: self.lengths[ordinal as usize],
        }
    }

    /// Binary-searches the prefix tuples for the given address, then
    /// disambiguates prefix collisions with the stored suffix.
    pub fn lookup(&self, addr: &Addr) -> Option<IndexEntry> {
        self.lookup_ordinal(addr).map(|ord| self.entry(ord))
    }

    pub fn lookup_ordinal(&self, addr: &Addr) -> Option<u32> {
        let prefix = addr.prefix();
        let mut i = self.prefixes.partition_point(|p| *p < prefix);
        while i < self.prefixes.len() && self.prefixes[i] == prefix {
            let ordinal = self.ordinals[i] as usize;
            let suffix = &self.suffixes[ordinal * SUFFIX_LEN..(ordinal + 1) * SUFFIX_LEN];
            if suffix == addr.suffix() {
                return Some(ordinal as u32);
            }
            i += 1;
        }
        None
    }

    /// Reassembles the full address of every chunk from the prefix tuples
    /// and suffixes, in ordinal order. One pass over the index.
    pub fn ordinal_addrs(&self) -> Vec<Addr> {
        let mut addrs = vec![Addr::default(); self.chunk_count as usize];
        for (i, prefix) in self.prefixes.iter().enumerate() {
            let ordinal = self.ordinals[i] as usize;
            let mut bytes = [0u8; ADDR_LEN];
            bytes[..PREFIX_LEN].copy_from_slice(&prefix.to_be_bytes());
            bytes[PREFIX_LEN..]
                .copy_from_slice(&self.suffixes[ordinal * SUFFIX_LEN..(ordinal + 1) * SUFFIX_LEN]);
            addrs[ordinal] = Addr::from_bytes(bytes);
        }
        addrs
    }
}

#[cfg(test)]
mod tests {
    use super::super::writer::write_table;
    use super::*;

    fn build_index(chunks: &[(Addr, Vec<u8>)]) -> TableIndex {
        let (_, bytes, count) = write_table(chunks.iter().map(|(a, d)| (a, d.as_slice())));
        let tail = &bytes[bytes.len() - index_region_len(count) as usize..];
        TableIndex::parse(tail).expect("index should parse")
    }

    fn chunks_of(n: usize) -> Vec<(Addr, Vec<u8>)> {
        (0..n)
            .map(|i| {
                let data = format!("chunk payload {i}").into_bytes();
                (Addr::of(&data), data)
            })
            .collect()
    }

    #[test]
    fn test_lookup_every_chunk() {
        let chunks = chunks_of(64);
        let index = build_index(&chunks);

        let mut offset = 0u64;
        let addrs = index.ordinal_addrs();
        for (ordinal, (addr, _)) in chunks.iter().enumerate() {
            let entry = index.lookup(addr).expect("missing chunk");
            assert_eq!(entry.offset, offset);
            assert_eq!(index.lookup_ordinal(addr), Some(ordinal as u32));
            offset += entry.length as u64;
            assert_eq!(addrs[ordinal], *addr);
        }
        assert_eq!(index.lookup(&Addr::of(b"not present")), None);
    }

    #[test]
    fn test_physical_len_matches_file() {
        let chunks = chunks_of(8);
        let (_, bytes, count) = write_table(chunks.iter().map(|(a, d)| (a, d.as_slice())));
        let tail = &bytes[bytes.len() - index_region_len(count) as usize..];
        let index = TableIndex::parse(tail).unwrap();
        assert_eq!(index.physical_len(), bytes.len() as u64);
    }

    #[test]
    fn test_parse_rejects_bad_magic() {
        let chunks = chunks_of(2);
        let (_, bytes, count) = write_table(chunks.iter().map(|(a, d)| (a, d.as_slice())));
        let mut tail = bytes[bytes.len() - index_region_len(count) as usize..].to_vec();
        let end = tail.len();
        tail[end - 1] ^= 0xff;
        assert!(TableIndex::parse(&tail).is_err());
    }

    #[test]
    fn test_parse_rejects_truncation() {
        let chunks = chunks_of(2);
        let (_, bytes, count) = write_table(chunks.iter().map(|(a, d)| (a, d.as_slice())));
        let tail = &bytes[bytes.len() - index_region_len(count) as usize + 1..];
        assert!(TableIndex::parse(tail).is_err());
    }

    #[test]
    fn test_parse_footer() -> Result<()> {
        let chunks = chunks_of(3);
        let (_, bytes, _) = write_table(chunks.iter().map(|(a, d)| (a, d.as_slice())));
        let (count, total) = TableIndex::parse_footer(&bytes[bytes.len() - FOOTER_LEN..])?;
        assert_eq!(count, 3);
        assert_eq!(total, chunks.iter().map(|(_, d)| d.len() as u64).sum::<u64>());
        Ok(())
    }
}
