use std::collections::VecDeque;

use crate::document::Document;

/// A document on its way to the store, with the number of attempts that already failed.
#[derive(Clone, Debug)]
pub(crate) struct PendingWrite {
    pub(crate) document: Document,
    pub(crate) attempts: usize,
}

impl PendingWrite {
    pub(crate) fn fresh(document: Document) -> Self {
        Self {
            document,
            attempts: 0,
        }
    }
}

/// FIFO of writes that failed and wait for another attempt. Drained ahead of fresh
/// documents.
#[derive(Debug, Default)]
pub(crate) struct RetryQueue {
    writes: VecDeque<PendingWrite>,
}

impl RetryQueue {
    pub(crate) fn push(&mut self, write: PendingWrite) {
        self.writes.push_back(write);
    }

    pub(crate) fn pop(&mut self) -> Option<PendingWrite> {
        self.writes.pop_front()
    }

    pub(crate) fn len(&self) -> usize {
        self.writes.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }
}
