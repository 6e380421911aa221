// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The inbound queue seam between the transfer pacer and the receive side.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

/// The delivery target for bytes arriving at an endpoint.
///
/// The registry only does availability accounting; the queue itself belongs
/// to the receiving collaborator, typically its flip/receive buffer.
pub trait InboundQueue: Send {
    /// Returns the space currently available for newly delivered bytes.
    fn room(&self) -> usize;

    /// Accepts delivered bytes. Called with at most [`room`](Self::room)
    /// bytes.
    fn receive(&mut self, data: &[u8]);
}

/// An [`InboundQueue`] that discards everything delivered to it.
///
/// Useful for endpoints whose receive side nobody drains.
#[derive(Debug, Default)]
pub struct Discard;

impl InboundQueue for Discard {
    fn room(&self) -> usize {
        usize::MAX
    }

    fn receive(&mut self, _data: &[u8]) {}
}

/// A shared bounded receive buffer.
///
/// Clones share the same storage, so one clone can serve as the delivery
/// target inside the registry while another is drained by the reader
/// session.
#[derive(Debug, Clone)]
pub struct FlipBuffer {
    data: Arc<Mutex<VecDeque<u8>>>,
    capacity: usize,
}

impl FlipBuffer {
    /// Creates a buffer holding at most `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            data: Arc::new(Mutex::new(VecDeque::new())),
            capacity,
        }
    }

    /// Drains buffered bytes into `buf`, returning how many were copied.
    pub fn read(&self, buf: &mut [u8]) -> usize {
        let mut data = self.data.lock();
        let n = buf.len().min(data.len());
        for (dst, src) in buf.iter_mut().zip(data.drain(..n)) {
            *dst = src;
        }
        n
    }

    /// Returns the number of buffered bytes.
    pub fn len(&self) -> usize {
        self.data.lock().len()
    }

    /// Returns true if nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.data.lock().is_empty()
    }
}

impl InboundQueue for FlipBuffer {
    fn room(&self) -> usize {
        self.capacity.saturating_sub(self.data.lock().len())
    }

    fn receive(&mut self, data: &[u8]) {
        let mut queue = self.data.lock();
        let n = data.len().min(self.capacity.saturating_sub(queue.len()));
        queue.extend(&data[..n]);
    }
}
