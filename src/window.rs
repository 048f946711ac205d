/// Sliding replay window for DTLS record sequence numbers.
///
/// Tracks the latest accepted sequence number and a bitmap of the records
/// seen below it. The window covers 64 records; `margin` extends the bitmap
/// further down so that records up to `margin` below the lower window edge
/// are still accepted once.
///
/// Each epoch has its own `ReplayWindow`. The caller routes records to the
/// window of their epoch.
#[derive(Debug)]
pub struct ReplayWindow {
    max_seq: Option<u64>,
    /// Bit `i` set means `max_seq - i` was seen.
    bits: Vec<u64>,
    /// Number of tracked positions, 64 + margin.
    size: u64,
}

impl ReplayWindow {
    pub const SIZE: u64 = 64;

    pub fn new(margin: u64) -> Self {
        let size = Self::SIZE + margin;
        let words = size.div_ceil(64) as usize;
        ReplayWindow {
            max_seq: None,
            bits: vec![0; words],
            size,
        }
    }

    /// Whether `seqno` would be accepted. Does not change the window, records
    /// are checked before decryption and marked after.
    pub fn is_acceptable(&self, seqno: u64) -> bool {
        let Some(max) = self.max_seq else {
            return true;
        };
        if seqno > max {
            return true;
        }
        let offset = max - seqno;
        if offset >= self.size {
            return false;
        }
        !self.is_set(offset)
    }

    /// Mark `seqno` as seen.
    pub fn mark(&mut self, seqno: u64) {
        match self.max_seq {
            None => {
                self.max_seq = Some(seqno);
                self.set(0);
            }
            Some(max) if seqno > max => {
                self.shift(seqno - max);
                self.max_seq = Some(seqno);
                self.set(0);
            }
            Some(max) => {
                let offset = max - seqno;
                if offset < self.size {
                    self.set(offset);
                }
            }
        }
    }

    fn is_set(&self, offset: u64) -> bool {
        let (word, bit) = ((offset / 64) as usize, offset % 64);
        self.bits[word] & (1 << bit) != 0
    }

    fn set(&mut self, offset: u64) {
        let (word, bit) = ((offset / 64) as usize, offset % 64);
        self.bits[word] |= 1 << bit;
    }

    fn shift(&mut self, delta: u64) {
        if delta >= self.size {
            self.bits.iter_mut().for_each(|w| *w = 0);
            return;
        }
        let word_shift = (delta / 64) as usize;
        let bit_shift = delta % 64;
        for w in (0..self.bits.len()).rev() {
            let mut v = 0;
            if w >= word_shift {
                let src = w - word_shift;
                v = self.bits[src] << bit_shift;
                if bit_shift > 0 && src > 0 {
                    v |= self.bits[src - 1] >> (64 - bit_shift);
                }
            }
            self.bits[w] = v;
        }
    }
}
