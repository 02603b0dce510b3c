use byteorder::{BigEndian, WriteBytesExt};

use super::{index_region_len, record_len, TABLE_MAGIC};
use crate::hash::Addr;

/// Serializes chunks into the table file format, preserving the given
/// insertion order in the data region. Returns the table's name (the
/// address of its index region plus footer), the file bytes, and the chunk
/// count.
///
/// Callers must not pass duplicate addresses; the memtable and conjoin
/// paths both deduplicate before serializing.
pub fn write_table<'a, I>(chunks: I) -> (Addr, Vec<u8>, u32)
where
    I: IntoIterator<Item = (&'a Addr, &'a [u8])>,
{
    let mut records = Vec::new();
    let mut tuples: Vec<(u64, u32)> = Vec::new();
    let mut lengths: Vec<u32> = Vec::new();
    let mut suffixes: Vec<&[u8]> = Vec::new();
    let mut total_data: u64 = 0;

    for (ordinal, (addr, data)) in chunks.into_iter().enumerate() {
        records.write_u32::<BigEndian>(data.len() as u32).unwrap();
        records.extend_from_slice(addr.as_bytes());
        records.extend_from_slice(data);

        tuples.push((addr.prefix(), ordinal as u32));
        lengths.push(record_len(data.len()) as u32);
        suffixes.push(addr.suffix());
        total_data += data.len() as u64;
    }

    let count = lengths.len() as u32;
    tuples.sort_unstable();

    let mut tail = Vec::with_capacity(index_region_len(count) as usize);
    for (prefix, ordinal) in tuples {
        tail.write_u64::<BigEndian>(prefix).unwrap();
        tail.write_u32::<BigEndian>(ordinal).unwrap();
    }
    for length in &lengths {
        tail.write_u32::<BigEndian>(*length).unwrap();
    }
    for suffix in suffixes {
        tail.extend_from_slice(suffix);
    }
    tail.write_u32::<BigEndian>(count).unwrap();
    tail.write_u64::<BigEndian>(total_data).unwrap();
    tail.extend_from_slice(&TABLE_MAGIC);
    debug_assert_eq!(tail.len() as u64, index_region_len(count));

    let name = Addr::of(&tail);

    let mut file = records;
    file.extend_from_slice(&tail);
    (name, file, count)
}

#[cfg(test)]
mod tests {
    use super::super::index::TableIndex;
    use super::*;

    fn sample_chunks() -> Vec<(Addr, Vec<u8>)> {
        [b"alpha".as_slice(), b"bravo", b"charlie", b""]
            .iter()
            .map(|data| (Addr::of(data), data.to_vec()))
            .collect()
    }

    #[test]
    fn test_write_table_layout() {
        let chunks = sample_chunks();
        let (name, bytes, count) =
            write_table(chunks.iter().map(|(a, d)| (a, d.as_slice())));

        assert_eq!(count, 4);
        let data_len: u64 = chunks.iter().map(|(_, d)| record_len(d.len())).sum();
        assert_eq!(bytes.len() as u64, data_len + index_region_len(count));

        // Magic sits at the very end of the file.
        assert_eq!(&bytes[bytes.len() - TABLE_MAGIC.len()..], &TABLE_MAGIC);

        // The name is the address of the tail region.
        let tail_start = bytes.len() - index_region_len(count) as usize;
        assert_eq!(name, Addr::of(&bytes[tail_start..]));
    }

    #[test]
    fn test_name_is_stable_across_rewrites() {
        let chunks = sample_chunks();
        let (name1, _, _) = write_table(chunks.iter().map(|(a, d)| (a, d.as_slice())));
        let (name2, _, _) = write_table(chunks.iter().map(|(a, d)| (a, d.as_slice())));
        assert_eq!(name1, name2);
    }

    #[test]
    fn test_name_depends_on_contents() {
        let chunks = sample_chunks();
        let (name1, _, _) = write_table(chunks.iter().map(|(a, d)| (a, d.as_slice())));
        let (name2, _, _) = write_table(chunks.iter().take(2).map(|(a, d)| (a, d.as_slice())));
        assert_ne!(name1, name2);
    }

    #[test]
    fn test_index_parses_back() -> crate::error::Result<()> {
        let chunks = sample_chunks();
        let (_, bytes, count) = write_table(chunks.iter().map(|(a, d)| (a, d.as_slice())));

        let tail_start = bytes.len() - index_region_len(count) as usize;
        let index = TableIndex::parse(&bytes[tail_start..])?;
        assert_eq!(index.chunk_count(), count);
        for (ordinal, (addr, data)) in chunks.iter().enumerate() {
            let entry = index.lookup(addr).expect("chunk missing from index");
            assert_eq!(entry.length as u64, record_len(data.len()));
            assert_eq!(index.entry(ordinal as u32).offset, entry.offset);
        }
        Ok(())
    }

    #[test]
    fn test_footer_total_data_len() -> crate::error::Result<()> {
        let chunks = sample_chunks();
        let (_, bytes, count) = write_table(chunks.iter().map(|(a, d)| (a, d.as_slice())));
        let tail_start = bytes.len() - index_region_len(count) as usize;
        let index = TableIndex::parse(&bytes[tail_start..])?;
        let expected: u64 = chunks.iter().map(|(_, d)| d.len() as u64).sum();
        assert_eq!(index.uncompressed_len(), expected);
        Ok(())
    }
}
