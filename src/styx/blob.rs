//! Bounded handshake buffer passed between the driver and a handler.

/// Fixed-capacity byte buffer with independent write and read cursors.
///
/// Writes never grow the buffer: anything past capacity is dropped and the
/// accepted count is returned, so handlers must chunk larger payloads
/// across several calls.
#[derive(Debug, Clone)]
pub struct Blob {
    data: Box<[u8]>,
    len: usize,
    pos: usize,
}

impl Blob {
    /// Allocate a blob able to hold `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            len: 0,
            pos: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Bytes written so far.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Space left for writing.
    pub fn remaining_capacity(&self) -> usize {
        self.data.len() - self.len
    }

    /// Written bytes not yet read.
    pub fn unread(&self) -> usize {
        self.len - self.pos
    }

    /// Append bytes at the write cursor, returning how many were accepted.
    pub fn write(&mut self, bytes: &[u8]) -> usize {
        let n = bytes.len().min(self.remaining_capacity());
        self.data[self.len..self.len + n].copy_from_slice(&bytes[..n]);
        self.len += n;
        n
    }

    /// Write at an absolute offset, extending the written length if needed.
    ///
    /// Returns the accepted count; an offset at or past capacity accepts 0.
    pub fn write_at(&mut self, offset: usize, bytes: &[u8]) -> usize {
        if offset >= self.data.len() {
            return 0;
        }
        let n = bytes.len().min(self.data.len() - offset);
        self.data[offset..offset + n].copy_from_slice(&bytes[..n]);
        if offset + n > self.len {
            // gap between the old length and offset keeps whatever was there
            self.len = offset + n;
        }
        n
    }

    /// Read from the read cursor, returning how many bytes were copied.
    pub fn read(&mut self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.unread());
        out[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        n
    }

    /// Read at an absolute offset without moving the read cursor.
    pub fn read_at(&self, offset: usize, out: &mut [u8]) -> usize {
        if offset >= self.len {
            return 0;
        }
        let n = out.len().min(self.len - offset);
        out[..n].copy_from_slice(&self.data[offset..offset + n]);
        n
    }

    /// Consume every unread byte.
    pub fn take_unread(&mut self) -> &[u8] {
        let start = self.pos;
        self.pos = self.len;
        &self.data[start..self.len]
    }

    /// The written region.
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// Reset both cursors for reuse. Contents are zeroed.
    pub fn clear(&mut self) {
        self.data[..self.len].fill(0);
        self.len = 0;
        self.pos = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_truncates_at_capacity() {
        let mut blob = Blob::with_capacity(4);
        assert_eq!(blob.write(b"abc"), 3);
        assert_eq!(blob.write(b"def"), 1);
        assert_eq!(blob.as_slice(), b"abcd");
        assert_eq!(blob.remaining_capacity(), 0);
        assert_eq!(blob.write(b"x"), 0);
    }

    #[test]
    fn test_read_is_bounded_by_unread() {
        let mut blob = Blob::with_capacity(8);
        blob.write(b"hello");
        let mut out = [0u8; 3];
        assert_eq!(blob.read(&mut out), 3);
        assert_eq!(&out, b"hel");
        let mut rest = [0u8; 8];
        assert_eq!(blob.read(&mut rest), 2);
        assert_eq!(&rest[..2], b"lo");
        assert_eq!(blob.unread(), 0);
        assert_eq!(blob.read(&mut rest), 0);
    }

    #[test]
    fn test_write_at_and_read_at() {
        let mut blob = Blob::with_capacity(6);
        assert_eq!(blob.write_at(2, b"wxyz"), 4);
        assert_eq!(blob.len(), 6);
        assert_eq!(blob.write_at(5, b"12"), 1);
        assert_eq!(blob.write_at(6, b"1"), 0);

        let mut out = [0u8; 4];
        assert_eq!(blob.read_at(2, &mut out), 4);
        assert_eq!(&out, b"wxy1");
        assert_eq!(blob.read_at(9, &mut out), 0);
        // read_at does not move the cursor
        assert_eq!(blob.unread(), 6);
    }

    #[test]
    fn test_take_unread_and_clear() {
        let mut blob = Blob::with_capacity(8);
        blob.write(b"abcdef");
        let mut first = [0u8; 2];
        blob.read(&mut first);
        assert_eq!(blob.take_unread(), b"cdef");
        assert_eq!(blob.take_unread(), b"");

        blob.clear();
        assert!(blob.is_empty());
        assert_eq!(blob.remaining_capacity(), 8);
    }

    #[test]
    fn test_zero_capacity_blob() {
        let mut blob = Blob::with_capacity(0);
        assert_eq!(blob.write(b"a"), 0);
        assert_eq!(blob.write_at(0, b"a"), 0);
        assert!(blob.is_empty());
    }
}
