use core::cmp;

/// Staging area between the serial port and the frame decoder. Bytes are
/// appended at the write position and handed out from the read position;
/// already consumed bytes are dropped when room is needed.
pub struct RxBuffer<const N: usize> {
    store: [u8; N],
    rpos: usize,
    wpos: usize,
}

impl<const N: usize> Default for RxBuffer<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> RxBuffer<N> {
    pub fn new() -> Self {
        Self {
            store: [0; N],
            rpos: 0,
            wpos: 0,
        }
    }

    pub fn clear(&mut self) {
        self.rpos = 0;
        self.wpos = 0;
    }

    pub fn available_read(&self) -> usize {
        // 0 <= rpos <= wpos <= N
        self.wpos - self.rpos
    }

    pub fn available_write(&self) -> usize {
        N - self.wpos + self.rpos
    }

    /// Unconsumed bytes, oldest first.
    pub fn data(&self) -> &[u8] {
        &self.store[self.rpos..self.wpos]
    }

    pub fn consume(&mut self, amt: usize) {
        self.rpos += cmp::min(amt, self.available_read());
        if self.rpos == self.wpos {
            self.clear();
        }
    }

    /// Copies as much of `data` as fits and returns the number of bytes taken.
    pub fn write(&mut self, data: &[u8]) -> usize {
        self.fill(|space| {
            let count = cmp::min(space.len(), data.len());
            space[..count].copy_from_slice(&data[..count]);
            Ok::<_, core::convert::Infallible>(count)
        })
        .unwrap_or(0)
    }

    /// Hands all free space to `f`, which returns how many bytes it stored.
    /// Nothing is kept if `f` fails.
    pub fn fill<E>(&mut self, f: impl FnOnce(&mut [u8]) -> Result<usize, E>) -> Result<usize, E> {
        if self.wpos == N && self.rpos > 0 {
            self.compact();
        }

        let count = f(&mut self.store[self.wpos..])?;
        let count = cmp::min(count, N - self.wpos);
        self.wpos += count;
        Ok(count)
    }

    fn compact(&mut self) {
        self.store.copy_within(self.rpos..self.wpos, 0);
        self.wpos -= self.rpos;
        self.rpos = 0;
    }
}

#[cfg(test)]
mod tests {
    const DATA: &[u8] = &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12];
    const LEN: usize = 5;
    type Buf = super::RxBuffer<LEN>;

    #[test]
    fn write() {
        let mut b = Buf::new();

        assert_eq!(b.write(&DATA[0..2]), 2);
        assert_eq!(b.available_write(), LEN - 2);
        assert_eq!(b.available_read(), 2);

        assert_eq!(b.write(&DATA[0..5]), 3);
        assert_eq!(b.available_write(), 0);
        assert_eq!(b.available_read(), LEN);
    }

    #[test]
    fn read() {
        let mut b = Buf::new();

        assert_eq!(b.write(&DATA[0..4]), 4);
        assert_eq!(b.data(), &DATA[0..4]);

        b.consume(3);
        assert_eq!(b.data(), &DATA[3..4]);

        b.consume(10);
        assert!(b.data().is_empty());
        assert_eq!(b.available_write(), LEN);
    }

    #[test]
    fn compacts_when_full() {
        let mut b = Buf::new();

        assert_eq!(b.write(&DATA[0..5]), 5);
        b.consume(2);
        assert_eq!(b.available_write(), 2);

        assert_eq!(b.write(&DATA[5..9]), 2);
        assert_eq!(b.data(), &DATA[2..7]);
    }

    #[test]
    fn failed_fill_keeps_nothing() {
        let mut b = Buf::new();

        let result = b.fill(|space| {
            space[0] = 0xAA;
            Err::<usize, ()>(())
        });
        assert_eq!(result, Err(()));
        assert_eq!(b.available_read(), 0);
    }
}
