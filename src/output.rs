//! Captured-output buffer.
//!
//! Each child's scrollback is staged in an append-only log of
//! `(fd, payload)` chunks held in page-sized arena blocks. One reader task
//! appends, the foreground drains once, and after promotion the buffer
//! switches to pass-through: new bytes go straight to the real terminal.

use std::os::fd::BorrowedFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::memory::MemoryBudget;

/// Arena page size; oversized chunks get a dedicated page.
const PAGE_SIZE: usize = 64 * 1024;

/// Chunk framing: one fd byte plus a little-endian payload length.
const CHUNK_HEADER_SIZE: usize = 1 + 4;

static NEXT_OUTPUT_ID: AtomicU64 = AtomicU64::new(1);

/// Bytes a chunk occupies in the buffer, as accounted against the
/// memory budget.
pub fn chunk_size_with_header(payload_len: usize) -> u64 {
    (CHUNK_HEADER_SIZE + payload_len) as u64
}

/// The mutable half of an [`OutputBuffer`], guarded by the parts mutex.
#[derive(Default)]
pub struct Parts {
    pages: Vec<Vec<u8>>,
    /// Once latched by the foreground, fresh scrollback bypasses the pages
    /// and is written straight to the real terminal.
    pass_to_parent: bool,
}

impl Parts {
    fn append_chunk(&mut self, fd: u8, payload: &[u8]) {
        let needed = CHUNK_HEADER_SIZE + payload.len();
        let page = match self.pages.last_mut() {
            Some(page) if page.capacity() - page.len() >= needed => page,
            _ => {
                self.pages.push(Vec::with_capacity(needed.max(PAGE_SIZE)));
                self.pages.last_mut().unwrap()
            }
        };
        page.push(fd);
        page.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        page.extend_from_slice(payload);
    }
}

/// Walks the chunks of a [`Parts`] in append order.
#[derive(Default)]
struct ChunkCursor {
    page: usize,
    offset: usize,
}

impl ChunkCursor {
    fn next<'a>(&mut self, parts: &'a Parts) -> Option<(u8, &'a [u8])> {
        while self.page < parts.pages.len() {
            let page = &parts.pages[self.page];
            if self.offset >= page.len() {
                self.page += 1;
                self.offset = 0;
                continue;
            }
            let fd = page[self.offset];
            let len = u32::from_le_bytes(
                page[self.offset + 1..self.offset + CHUNK_HEADER_SIZE]
                    .try_into()
                    .unwrap(),
            ) as usize;
            let start = self.offset + CHUNK_HEADER_SIZE;
            self.offset = start + len;
            return Some((fd, &page[start..start + len]));
        }
        None
    }
}

/// The staging buffer for one child's captured output.
pub struct OutputBuffer {
    id: u64,
    parts: Mutex<Parts>,
}

impl Default for OutputBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputBuffer {
    pub fn new() -> Self {
        Self {
            id: NEXT_OUTPUT_ID.fetch_add(1, Ordering::Relaxed),
            parts: Mutex::new(Parts::default()),
        }
    }

    /// Identity used by the memory budget's foreground marker.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Append a chunk, or forward it to the real terminal when the buffer
    /// has been promoted. Returns the bytes newly held in memory (0 in
    /// pass-through), to be added to the memory budget by the caller.
    pub fn append(&self, fd: u8, payload: &[u8]) -> u64 {
        let mut parts = self.lock_parts();
        if parts.pass_to_parent {
            write_to_real_fd(fd, payload);
            0
        } else {
            parts.append_chunk(fd, payload);
            chunk_size_with_header(payload.len())
        }
    }

    /// Promote to the foreground: under one hold of the parts mutex, drain
    /// every staged chunk to the real terminal, free the pages, settle the
    /// memory accounting, and latch pass-through for everything that
    /// follows.
    pub fn promote(&self, budget: &MemoryBudget) {
        let mut parts = self.lock_parts();

        let mut cleared: u64 = 0;
        let mut cursor = ChunkCursor::default();
        while let Some((fd, payload)) = cursor.next(&parts) {
            write_to_real_fd(fd, payload);
            cleared += chunk_size_with_header(payload.len());
        }

        parts.pages.clear();
        parts.pages.shrink_to_fit();
        parts.pass_to_parent = true;

        budget.release(cleared, self.id);
    }

    fn lock_parts(&self) -> MutexGuard<'_, Parts> {
        match self.parts.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Copy out the staged chunks, for assertions.
    #[cfg(test)]
    pub fn snapshot(&self) -> Vec<(u8, Vec<u8>)> {
        let parts = self.lock_parts();
        let mut cursor = ChunkCursor::default();
        let mut chunks = Vec::new();
        while let Some((fd, payload)) = cursor.next(&parts) {
            chunks.push((fd, payload.to_vec()));
        }
        chunks
    }
}

/// Write to the real stdout/stderr. Errors are deliberately ignored: the
/// terminal may be gone, and the run must still reap its children.
pub fn write_to_real_fd(fd: u8, mut payload: &[u8]) {
    // Only ever called with the fd byte of a captured stream.
    let target: BorrowedFd<'_> = if fd == 2 {
        rustix::stdio::stderr()
    } else {
        rustix::stdio::stdout()
    };
    while !payload.is_empty() {
        match rustix::io::write(target, payload) {
            Ok(0) => break,
            Ok(n) => payload = &payload[n..],
            Err(rustix::io::Errno::INTR) => continue,
            Err(_) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(parts: &Parts) -> Vec<(u8, Vec<u8>)> {
        let mut cursor = ChunkCursor::default();
        let mut out = Vec::new();
        while let Some((fd, payload)) = cursor.next(parts) {
            out.push((fd, payload.to_vec()));
        }
        out
    }

    #[test]
    fn test_chunks_kept_in_append_order() {
        let buffer = OutputBuffer::new();
        buffer.append(1, b"first");
        buffer.append(2, b"second");
        buffer.append(1, b"third");

        let parts = buffer.lock_parts();
        assert_eq!(
            collect(&parts),
            vec![
                (1, b"first".to_vec()),
                (2, b"second".to_vec()),
                (1, b"third".to_vec()),
            ]
        );
    }

    #[test]
    fn test_oversized_chunk_gets_own_page() {
        let buffer = OutputBuffer::new();
        let big = vec![0xAB; PAGE_SIZE * 2];
        buffer.append(1, b"small");
        buffer.append(1, &big);

        let parts = buffer.lock_parts();
        assert_eq!(parts.pages.len(), 2);
        let chunks = collect(&parts);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1].1.len(), big.len());
    }

    #[test]
    fn test_append_accounts_header() {
        let buffer = OutputBuffer::new();
        assert_eq!(buffer.append(1, b"12345"), chunk_size_with_header(5));
    }

    #[test]
    fn test_promote_frees_and_latches_pass_through() {
        let budget = MemoryBudget::new(1 << 20);
        let buffer = OutputBuffer::new();
        budget.add(buffer.append(1, b"staged"));
        assert_ne!(budget.stored(), 0);

        buffer.promote(&budget);
        assert_eq!(budget.stored(), 0);
        assert!(budget.is_foreground(buffer.id()));

        // Buffered nothing after promotion.
        assert_eq!(buffer.append(1, b""), 0);
        assert!(buffer.lock_parts().pages.is_empty());
    }
}
