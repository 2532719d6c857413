//! Append-only byte arena made of fixed-capacity blocks.
//!
//! Captured records and upload payloads are appended here while a stream is
//! recorded. Offsets are logical: the position the bytes will occupy once
//! the blocks are concatenated for the wire.

/// Blocks hold `block_size` bytes; a single write larger than that gets a
/// block of its own.
#[derive(Debug)]
pub struct BlockArena {
    block_size: usize,
    blocks: Vec<Vec<u8>>,
    len: u64,
}

impl BlockArena {
    pub fn new(block_size: usize) -> Self {
        Self { block_size: block_size.max(1), blocks: Vec::new(), len: 0 }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Total bytes written.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Append `bytes` without splitting them across blocks. Returns the
    /// logical offset of the first byte.
    pub fn write(&mut self, bytes: &[u8]) -> u64 {
        let offset = self.len;
        let fits = self
            .blocks
            .last()
            .is_some_and(|block| block.len() + bytes.len() <= self.block_size);
        if !fits {
            self.blocks.push(Vec::with_capacity(self.block_size.max(bytes.len())));
        }
        if let Some(block) = self.blocks.last_mut() {
            block.extend_from_slice(bytes);
        }
        self.len += bytes.len() as u64;
        offset
    }

    /// Append `data` in pieces of at most one block each, filling the
    /// current block first. Returns `(offset, size)` for every piece.
    pub fn write_chunked(&mut self, data: &[u8]) -> Vec<(u64, u64)> {
        let mut pieces = Vec::new();
        let mut rest = data;
        while !rest.is_empty() {
            let room = match self.blocks.last() {
                Some(block) if block.len() < self.block_size => self.block_size - block.len(),
                _ => self.block_size,
            };
            let (head, tail) = rest.split_at(room.min(rest.len()));
            let offset = self.write(head);
            pieces.push((offset, head.len() as u64));
            rest = tail;
        }
        pieces
    }

    /// Append the arena's contents to `out` in logical order.
    pub fn copy_into(&self, out: &mut Vec<u8>) {
        out.reserve(self.len as usize);
        for block in &self.blocks {
            out.extend_from_slice(block);
        }
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.copy_into(&mut out);
        out
    }

    /// Drop every block.
    pub fn clear(&mut self) {
        self.blocks.clear();
        self.len = 0;
    }
}
