use chrono::{DateTime, Local};
use std::borrow::Cow;
use std::collections::VecDeque;

use super::config::MESSAGE_CAPACITY;

/// A received message as it is shown to the operator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageRecord {
    /// Arrival order, monotonic for the lifetime of the buffer
    pub seq: u64,
    pub topic: String,
    pub body: String,
    pub received_at: DateTime<Local>,
    /// Set when undecodable bytes were replaced while decoding the payload
    pub lossy: bool,
}

impl MessageRecord {
    pub fn render(&self) -> String {
        format!(
            "{} {}: {}",
            self.received_at.format("%H:%M:%S"),
            self.topic,
            self.body.trim_end_matches(['\r', '\n'])
        )
    }
}

/// Decodes a payload as UTF-8, replacing invalid sequences with U+FFFD.
///
/// Returns the text and whether anything had to be replaced.
pub fn decode_payload(raw: &[u8]) -> (String, bool) {
    match String::from_utf8_lossy(raw) {
        Cow::Borrowed(text) => (text.to_string(), false),
        Cow::Owned(text) => (text, true),
    }
}

/// Bounded FIFO of the most recent messages for the active subscription.
#[derive(Debug)]
pub struct MessageRingBuffer {
    records: VecDeque<MessageRecord>,
    capacity: usize,
    next_seq: u64,
}

impl Default for MessageRingBuffer {
    fn default() -> Self {
        Self::with_capacity(MESSAGE_CAPACITY)
    }
}

impl MessageRingBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            records: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            next_seq: 0,
        }
    }

    /// Stores a new message, evicting the oldest one when full.
    pub fn append(&mut self, topic: &str, body: String, lossy: bool) -> &MessageRecord {
        if self.records.len() == self.capacity {
            self.records.pop_front();
        }
        let record = MessageRecord {
            seq: self.next_seq,
            topic: topic.to_string(),
            body,
            received_at: Local::now(),
            lossy,
        };
        self.next_seq += 1;
        self.records.push_back(record);
        // just pushed, cannot be empty
        &self.records[self.records.len() - 1]
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    /// Owned copy of the contents, oldest first.
    pub fn snapshot(&self) -> Vec<MessageRecord> {
        self.records.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bodies(buffer: &MessageRingBuffer) -> Vec<String> {
        buffer.snapshot().into_iter().map(|r| r.body).collect()
    }

    #[test]
    fn keeps_only_the_most_recent_ten_in_arrival_order() {
        let mut buffer = MessageRingBuffer::default();
        for i in 0..25 {
            buffer.append("t", i.to_string(), false);
            assert!(buffer.snapshot().len() <= MESSAGE_CAPACITY);
        }

        let expected: Vec<String> = (15..25).map(|i| i.to_string()).collect();
        assert_eq!(bodies(&buffer), expected);

        let seqs: Vec<u64> = buffer.snapshot().iter().map(|r| r.seq).collect();
        assert_eq!(seqs, (15..25).collect::<Vec<u64>>());
    }

    #[test]
    fn clear_empties_but_keeps_sequence_running() {
        let mut buffer = MessageRingBuffer::default();
        buffer.append("t", "a".into(), false);
        buffer.append("t", "b".into(), false);
        buffer.clear();
        assert!(buffer.snapshot().is_empty());

        let record = buffer.append("t", "c".into(), false);
        assert_eq!(record.seq, 2);
    }

    #[test]
    fn snapshot_is_detached_from_the_buffer() {
        let mut buffer = MessageRingBuffer::default();
        buffer.append("t", "first".into(), false);
        let snapshot = buffer.snapshot();
        buffer.append("t", "second".into(), false);
        assert_eq!(snapshot.len(), 1);
        assert_eq!(buffer.snapshot().len(), 2);
    }

    #[test]
    fn record_render_strips_trailing_line_break() {
        let mut buffer = MessageRingBuffer::with_capacity(3);
        let record = buffer.append("sensors/temp", "23.5\r\n".into(), false);
        assert!(record.render().ends_with(" sensors/temp: 23.5"));
    }

    #[test]
    fn decode_substitutes_invalid_bytes() {
        assert_eq!(decode_payload(b"23.5"), ("23.5".to_string(), false));

        let (text, lossy) = decode_payload(&[b'o', b'k', 0xff, b'!']);
        assert!(lossy);
        assert_eq!(text, "ok\u{FFFD}!");
    }
}
