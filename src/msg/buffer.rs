//! Per-child message buffers.
//!
//! Each child of an internal node owns a FIFO of buffered messages routed
//! to it (or duplicated into it, for broadcasts). Insertion order is the
//! MSN order, so draining front-to-back replays writes in the order they
//! entered the tree.

use std::collections::VecDeque;

use super::Message;

/// FIFO of messages destined for one child, with running byte accounting.
#[derive(Debug, Clone, Default)]
pub struct MessageBuffer {
    queue: VecDeque<Message>,
    n_bytes: usize,
}

impl MessageBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, msg: Message) {
        self.n_bytes += msg.buffered_size();
        self.queue.push_back(msg);
    }

    pub fn dequeue(&mut self) -> Option<Message> {
        let msg = self.queue.pop_front()?;
        self.n_bytes -= msg.buffered_size();
        Some(msg)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Bytes currently buffered; the weight used for heaviest-child
    /// selection.
    pub fn n_bytes(&self) -> usize {
        self.n_bytes
    }

    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.queue.iter()
    }

    /// Drain everything in FIFO order, leaving the buffer empty.
    pub fn drain(&mut self) -> impl Iterator<Item = Message> + '_ {
        self.n_bytes = 0;
        self.queue.drain(..)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::{MessageType, Xids};

    fn msg(key: &[u8]) -> Message {
        Message::new(MessageType::Insert, Xids::root(), key.to_vec(), b"v".to_vec())
    }

    #[test]
    fn fifo_order_and_accounting() {
        let mut buf = MessageBuffer::new();
        buf.enqueue(msg(b"a"));
        buf.enqueue(msg(b"bb"));
        assert_eq!(buf.len(), 2);
        let expected = msg(b"a").buffered_size() + msg(b"bb").buffered_size();
        assert_eq!(buf.n_bytes(), expected);

        let first = buf.dequeue().unwrap();
        assert_eq!(first.key, b"a");
        assert_eq!(buf.n_bytes(), msg(b"bb").buffered_size());

        buf.enqueue(msg(b"c"));
        let keys: Vec<_> = buf.drain().map(|m| m.key).collect();
        assert_eq!(keys, vec![b"bb".to_vec(), b"c".to_vec()]);
        assert_eq!(buf.n_bytes(), 0);
        assert!(buf.is_empty());
    }
}
