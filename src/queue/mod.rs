// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! FIFO queues that hand buffers from one pipeline stage to the next.
//!
//! A [`Queue`] is either unbounded (appending never blocks) or bounded, in
//! which case appending to a full queue stalls the producer until a consumer
//! removes an item. A slow stage therefore
//! causes backpressure up the pipeline, never silent sample loss.
//!
//! Removing blocks until an item is available. Each appended item wakes
//! exactly one blocked consumer.
//!
//! Stages don't share `Queue`s directly; a queue is split into a
//! [`Producer`] and a [`Consumer`] so that a stage notices when everything
//! upstream of it has finished (all producers dropped) and can shut down.


use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use thiserror::Error;

pub struct Queue<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
}

impl<T> Queue<T> {
    /// A queue whose `append` never blocks.
    pub fn unbounded() -> Queue<T> {
        let (tx, rx) = unbounded();
        Queue { tx, rx }
    }

    /// A queue that holds at most `capacity` items; appending to a full queue
    /// blocks until space is available. A capacity of 0 makes every append
    /// wait for a matching remove.
    pub fn bounded(capacity: usize) -> Queue<T> {
        let (tx, rx) = bounded(capacity);
        Queue { tx, rx }
    }

    pub fn append(&self, item: T) {
        // Both ends of the channel are owned by `self`, so it can't be
        // disconnected.
        self.tx
            .send(item)
            .unwrap_or_else(|_| unreachable!("queue owns its receiver"))
    }

    pub fn remove(&self) -> T {
        self.rx
            .recv()
            .unwrap_or_else(|_| unreachable!("queue owns its sender"))
    }

    /// Like [`Queue::remove`], but give up after `timeout`.
    pub fn remove_timeout(&self, timeout: Duration) -> Option<T> {
        self.rx.recv_timeout(timeout).ok()
    }

    pub fn try_remove(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// `None` if the queue is unbounded.
    pub fn capacity(&self) -> Option<usize> {
        self.tx.capacity()
    }

    /// Give up direct access to the queue in favour of producer and consumer
    /// handles. Once every [`Producer`] is dropped, consumers drain the
    /// remaining items and then see the end of the stream.
    pub fn split(self) -> (Producer<T>, Consumer<T>) {
        (Producer { tx: self.tx }, Consumer { rx: self.rx })
    }
}

/// All consumers of a queue have gone away; the item that couldn't be
/// appended is handed back.
#[derive(Error, Debug, PartialEq, Eq)]
#[error("The queue's consumers have all gone away")]
pub struct QueueClosed<T>(pub T);

/// The appending end of a split [`Queue`].
pub struct Producer<T> {
    tx: Sender<T>,
}

// Derive would demand `T: Clone`.
impl<T> Clone for Producer<T> {
    fn clone(&self) -> Self {
        Producer {
            tx: self.tx.clone(),
        }
    }
}

impl<T> Producer<T> {
    /// Append an item, blocking while a bounded queue is full.
    pub fn append(&self, item: T) -> Result<(), QueueClosed<T>> {
        self.tx.send(item).map_err(|e| QueueClosed(e.into_inner()))
    }
}

/// The removing end of a split [`Queue`]. Multiple consumers may share a
/// queue; each item is removed by exactly one of them.
pub struct Consumer<T> {
    rx: Receiver<T>,
}

impl<T> Clone for Consumer<T> {
    fn clone(&self) -> Self {
        Consumer {
            rx: self.rx.clone(),
        }
    }
}

impl<T> Consumer<T> {
    /// Block until an item is available. `None` means that all producers have
    /// gone away and the queue is empty.
    pub fn remove(&self) -> Option<T> {
        self.rx.recv().ok()
    }

    /// Like [`Consumer::remove`], but give up after `timeout`. The outer
    /// `Err` distinguishes a timeout from the end of the stream.
    pub fn remove_timeout(&self, timeout: Duration) -> Result<Option<T>, QueueTimeout> {
        match self.rx.recv_timeout(timeout) {
            Ok(item) => Ok(Some(item)),
            Err(RecvTimeoutError::Disconnected) => Ok(None),
            Err(RecvTimeoutError::Timeout) => Err(QueueTimeout(timeout)),
        }
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Remove items until the stream ends.
    pub fn iter(&self) -> impl Iterator<Item = T> + '_ {
        self.rx.iter()
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("Nothing arrived on the queue within {0:?}")]
pub struct QueueTimeout(pub Duration);
