//! Bounded buffers for traffic that has to wait for a handshake.

use std::collections::VecDeque;

use crate::buffer::Buf;

/// Application data submitted before the connection is established.
///
/// Holds at most `max` messages. Pushing beyond that drops the oldest.
#[derive(Debug)]
pub(crate) struct DeferredOutbound {
    queue: VecDeque<Vec<u8>>,
    max: usize,
}

impl DeferredOutbound {
    pub fn new(max: usize) -> Self {
        DeferredOutbound {
            queue: VecDeque::new(),
            max,
        }
    }

    /// Queue `data`. Returns the message dropped to make room, if any.
    pub fn push(&mut self, data: Vec<u8>) -> Option<Vec<u8>> {
        if self.max == 0 {
            return Some(data);
        }
        let dropped = if self.queue.len() >= self.max {
            self.queue.pop_front()
        } else {
            None
        };
        self.queue.push_back(data);
        dropped
    }

    pub fn drain(&mut self) -> impl Iterator<Item = Vec<u8>> + '_ {
        self.queue.drain(..)
    }
}

/// Records that arrived ahead of the keys needed to open them.
///
/// Capped by total size. A record that would exceed the cap is dropped,
/// the records already held are kept.
#[derive(Debug)]
pub(crate) struct DeferredInbound {
    records: Vec<Buf>,
    size: usize,
    max_size: usize,
}

impl DeferredInbound {
    pub fn new(max_size: usize) -> Self {
        DeferredInbound {
            records: Vec::new(),
            size: 0,
            max_size,
        }
    }

    /// Hold a copy of the raw record. False if it was dropped.
    pub fn push(&mut self, raw: &[u8]) -> bool {
        if self.size + raw.len() > self.max_size {
            return false;
        }
        self.size += raw.len();
        self.records.push(Buf::from_slice(raw));
        true
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// All held records in arrival order.
    pub fn take(&mut self) -> Vec<Buf> {
        self.size = 0;
        std::mem::take(&mut self.records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outbound_drops_oldest() {
        let mut q = DeferredOutbound::new(2);
        assert_eq!(q.push(vec![1]), None);
        assert_eq!(q.push(vec![2]), None);
        assert_eq!(q.push(vec![3]), Some(vec![1]));
        let left: Vec<_> = q.drain().collect();
        assert_eq!(left, vec![vec![2], vec![3]]);
        assert_eq!(q.drain().count(), 0);
    }

    #[test]
    fn outbound_without_capacity() {
        let mut q = DeferredOutbound::new(0);
        assert_eq!(q.push(vec![1]), Some(vec![1]));
        assert_eq!(q.drain().count(), 0);
    }

    #[test]
    fn inbound_caps_total_size() {
        let mut q = DeferredInbound::new(10);
        assert!(q.push(&[0; 6]));
        assert!(!q.push(&[0; 6]));
        assert!(q.push(&[0; 4]));
        assert_eq!(q.size(), 10);

        let held = q.take();
        assert_eq!(held.len(), 2);
        assert_eq!(q.size(), 0);
        assert!(q.is_empty());
    }
}
