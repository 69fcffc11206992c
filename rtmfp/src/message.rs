use std::collections::BTreeMap;
use std::ops::Bound::{Excluded, Unbounded};
use bytes::Bytes;
use tokio::time::Instant;
use crate::stage::Stage;

/// A message queued in a writer. The payload is immutable once queued; the writer records each
///  fragment's start offset together with the stage at which it was last transmitted.
pub struct OutgoingMessage {
    data: Bytes,
    /// lost fragments are re-sent rather than written off
    repeatable: bool,
    /// last message of a closed writer
    end: bool,
    /// fragment start offset -> stage of the fragment's most recent transmission
    fragments: BTreeMap<usize, Stage>,
    first_sent: Option<Instant>,
}

impl OutgoingMessage {
    pub fn new(data: Bytes, repeatable: bool) -> OutgoingMessage {
        OutgoingMessage {
            data,
            repeatable,
            end: false,
            fragments: BTreeMap::default(),
            first_sent: None,
        }
    }

    /// The empty message that terminates a writer's flow
    pub fn end_marker(repeatable: bool) -> OutgoingMessage {
        OutgoingMessage {
            end: true,
            ..OutgoingMessage::new(Bytes::new(), repeatable)
        }
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn is_repeatable(&self) -> bool {
        self.repeatable
    }

    pub fn is_end(&self) -> bool {
        self.end
    }

    pub fn first_sent(&self) -> Option<Instant> {
        self.first_sent
    }

    pub fn on_fragment_sent(&mut self, offset: usize, stage: Stage, now: Instant) {
        self.fragments.insert(offset, stage);
        self.first_sent.get_or_insert(now);
    }

    pub fn has_pending_fragments(&self) -> bool {
        !self.fragments.is_empty()
    }

    pub fn num_pending_fragments(&self) -> usize {
        self.fragments.len()
    }

    pub fn first_pending_offset(&self) -> Option<usize> {
        self.fragments.keys().next().copied()
    }

    pub fn next_pending_offset(&self, offset: usize) -> Option<usize> {
        self.fragments.range((Excluded(offset), Unbounded))
            .next()
            .map(|(k, _)| *k)
    }

    pub fn pending_offsets(&self) -> Vec<usize> {
        self.fragments.keys().copied().collect()
    }

    pub fn last_sent_stage(&self, offset: usize) -> Option<Stage> {
        self.fragments.get(&offset).copied()
    }

    pub fn set_last_sent_stage(&mut self, offset: usize, stage: Stage) {
        self.fragments.insert(offset, stage);
    }

    pub fn acknowledge_fragment(&mut self, offset: usize) {
        self.fragments.remove(&offset);
    }

    /// Byte range of the fragment starting at `offset`: it extends to the next pending fragment,
    ///  or to the end of the message for the last one. Returns the range together with the
    ///  information whether another fragment follows.
    pub fn fragment_range(&self, offset: usize) -> (std::ops::Range<usize>, bool) {
        match self.next_pending_offset(offset) {
            Some(next) => (offset..next, true),
            None => (offset..self.data.len(), false),
        }
    }

    /// Drops all pending fragments, returning how many there were
    pub fn abandon(&mut self) -> usize {
        let result = self.fragments.len();
        self.fragments.clear();
        result
    }
}
