use std::fmt;

use crate::hash::Addr;

/// An immutable `(address, bytes)` pair. The address is always the content
/// hash of the bytes; the store never interprets the bytes themselves.
#[derive(Clone, PartialEq, Eq)]
pub struct Chunk {
    addr: Addr,
    data: Vec<u8>,
}

impl Chunk {
    /// Creates a chunk, computing its address from the data.
    pub fn new(data: Vec<u8>) -> Chunk {
        let addr = Addr::of(&data);
        Chunk { addr, data }
    }

    /// Creates a chunk with a known address. The caller asserts that
    /// `addr == Addr::of(&data)`; readers that cannot assert this must use
    /// [`Chunk::new`] instead.
    pub fn with_addr(addr: Addr, data: Vec<u8>) -> Chunk {
        debug_assert_eq!(addr, Addr::of(&data));
        Chunk { addr, data }
    }

    pub fn addr(&self) -> &Addr {
        &self.addr
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn into_parts(self) -> (Addr, Vec<u8>) {
        (self.addr, self.data)
    }
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Chunk")
            .field("addr", &self.addr)
            .field("len", &self.data.len())
            .finish()
    }
}
