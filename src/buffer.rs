/// Growable scratch buffer used for page encoding, log reads and
/// relocation. Each writer context keeps one per purpose so hot paths never
/// allocate.
pub struct Buffer {
    bs: Vec<u8>,
}

impl Buffer {
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    pub fn with_capacity(size: usize) -> Self {
        Self { bs: vec![0; size] }
    }

    /// Ensure the buffer covers `offset + size` bytes, doubling on growth.
    pub fn grow(&mut self, offset: usize, size: usize) {
        let want = offset + size;
        if self.bs.len() < want {
            let next = (self.bs.len() * 2).max(want);
            self.bs.resize(next, 0);
        }
    }

    pub fn get_mut(&mut self, offset: usize, size: usize) -> &mut [u8] {
        self.grow(offset, size);
        &mut self.bs[offset..offset + size]
    }

    pub fn slice(&self, offset: usize, size: usize) -> &[u8] {
        &self.bs[offset..offset + size]
    }

    pub fn len(&self) -> usize {
        self.bs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bs.is_empty()
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grow_doubles() {
        let mut buf = Buffer::with_capacity(8);
        buf.get_mut(0, 4).copy_from_slice(b"abcd");
        buf.grow(8, 8);
        assert!(buf.len() >= 16);
        assert_eq!(buf.slice(0, 4), b"abcd");
    }

    #[test]
    fn test_get_mut_past_end() {
        let mut buf = Buffer::new();
        let s = buf.get_mut(100, 10);
        assert_eq!(s.len(), 10);
    }
}
