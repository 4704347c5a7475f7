// Byte buffer utilities for peerswarm.
//
// BufferPool hands out PooledBuf values. A PooledBuf has exactly one owner at a time
// and goes back to its pool when dropped, so every exit path of a loop that holds one
// returns it, and it can never be returned twice.

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use bytes::BytesMut;
use parking_lot::Mutex;

struct PoolInner {
    free: Mutex<Vec<BytesMut>>,
    buf_capacity: usize,
    max_pooled: usize,
    outstanding: AtomicUsize,
    allocations: AtomicUsize,
}

/// A bounded free-list of same-sized byte buffers. Cheap to clone.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    /// `buf_capacity` is the capacity of every fresh buffer, `max_pooled` bounds how many
    /// idle buffers are kept around. Returned buffers beyond that are freed.
    pub fn new(buf_capacity: usize, max_pooled: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                free: Mutex::new(Vec::with_capacity(max_pooled)),
                buf_capacity,
                max_pooled,
                outstanding: AtomicUsize::new(0),
                allocations: AtomicUsize::new(0),
            }),
        }
    }

    /// Take an empty buffer out of the pool.
    pub fn get(&self) -> PooledBuf {
        let buf = match self.inner.free.lock().pop() {
            Some(buf) => buf,
            None => {
                self.inner.allocations.fetch_add(1, Ordering::Relaxed);
                BytesMut::with_capacity(self.inner.buf_capacity)
            }
        };
        self.inner.outstanding.fetch_add(1, Ordering::Relaxed);
        PooledBuf {
            buf,
            pool: self.inner.clone(),
        }
    }

    /// Take a buffer out of the pool and copy `data` into it.
    pub fn get_filled(&self, data: &[u8]) -> PooledBuf {
        let mut b = self.get();
        b.extend_from_slice(data);
        b
    }

    pub fn buf_capacity(&self) -> usize {
        self.inner.buf_capacity
    }

    /// Idle buffers ready for reuse.
    pub fn available(&self) -> usize {
        self.inner.free.lock().len()
    }

    /// Buffers currently checked out.
    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::Relaxed)
    }

    /// How many times the pool had to allocate because it was empty.
    pub fn allocations(&self) -> usize {
        self.inner.allocations.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("buf_capacity", &self.inner.buf_capacity)
            .field("available", &self.available())
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

/// A byte buffer on loan from a [`BufferPool`].
pub struct PooledBuf {
    buf: BytesMut,
    pool: Arc<PoolInner>,
}

impl PooledBuf {
    pub fn extend_from_slice(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data)
    }

    pub fn clear(&mut self) {
        self.buf.clear()
    }

    pub fn resize(&mut self, new_len: usize) {
        self.buf.resize(new_len, 0)
    }

    /// Access to the underlying buffer, e.g. to serialize into it via `bytes::BufMut`.
    pub fn bytes_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        self.pool.outstanding.fetch_sub(1, Ordering::Relaxed);
        let mut buf = std::mem::take(&mut self.buf);
        // Buffers that grew way past the pool size (e.g. a huge bitfield) aren't worth keeping.
        if buf.capacity() < self.pool.buf_capacity || buf.capacity() > self.pool.buf_capacity * 2
        {
            return;
        }
        buf.clear();
        let mut free = self.pool.free.lock();
        if free.len() < self.pool.max_pooled {
            free.push(buf);
        }
    }
}

impl std::ops::Deref for PooledBuf {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.buf
    }
}

impl std::ops::DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.buf
    }
}

impl AsRef<[u8]> for PooledBuf {
    fn as_ref(&self) -> &[u8] {
        &self.buf
    }
}

impl std::fmt::Debug for PooledBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        debug_bytes(&self.buf, f, true)
    }
}

/// A borrowed byte slice that prints nicely.
#[derive(Default, PartialEq, Eq, Hash, Clone, Copy, PartialOrd, Ord)]
pub struct ByteBuf<'a>(pub &'a [u8]);

struct HexBytes<'a>(&'a [u8]);
impl std::fmt::Display for HexBytes<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x?}")?;
        }
        Ok(())
    }
}

fn debug_bytes(b: &[u8], f: &mut std::fmt::Formatter<'_>, debug_strings: bool) -> std::fmt::Result {
    if b.iter().all(|b| *b == 0) {
        return write!(f, "<{} bytes, all zeroes>", b.len());
    }
    if let Ok(s) = std::str::from_utf8(b) {
        // Only if all chars are "printable".
        if s.chars().all(|c| c.escape_debug().len() == 1) {
            if debug_strings {
                return write!(f, "{s:?}");
            } else {
                return write!(f, "{s}");
            }
        }
    }

    if b.len() <= 20 {
        return write!(f, "<{} bytes, 0x{}>", b.len(), HexBytes(b));
    }

    write!(f, "<{} bytes>", b.len())
}

impl std::fmt::Debug for ByteBuf<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        debug_bytes(self.0, f, true)
    }
}

impl std::fmt::Display for ByteBuf<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        debug_bytes(self.0, f, false)
    }
}

impl AsRef<[u8]> for ByteBuf<'_> {
    fn as_ref(&self) -> &[u8] {
        self.0
    }
}

impl std::ops::Deref for ByteBuf<'_> {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.0
    }
}

impl<'a> From<&'a [u8]> for ByteBuf<'a> {
    fn from(b: &'a [u8]) -> Self {
        Self(b)
    }
}
