#![expect(
    clippy::module_name_repetitions,
    reason = "The queue type names its role, which repeats the module name"
)]

//! Bounded buffer for messages sent while the transport is down.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::config::QueueConfig;
use super::error::TransportError;
use super::message::Message;
use super::traits::{ReadyState, Transport};
use crate::Result;

/// What happened to a message handed to `send`.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Written to the open transport
    Sent,
    /// Buffered for replay once the connection opens
    Queued {
        /// Oldest messages evicted to make room
        evicted: usize,
    },
}

/// FIFO of outbound messages with drop-oldest eviction.
#[derive(Debug)]
pub struct OutboundQueue {
    config: QueueConfig,
    messages: Mutex<VecDeque<Message>>,
}

impl OutboundQueue {
    #[must_use]
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            messages: Mutex::new(VecDeque::new()),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Write straight to `transport` when it is open, otherwise buffer.
    ///
    /// Fails with [`TransportError::SendRejected`] when the transport is not open and
    /// queueing is disabled.
    pub fn send(&self, message: Message, transport: Option<&dyn Transport>) -> Result<SendOutcome> {
        if let Some(transport) = transport
            && transport.ready_state() == ReadyState::Open
        {
            transport.send(&message.to_frame())?;
            return Ok(SendOutcome::Sent);
        }

        if !self.config.enabled {
            return Err(TransportError::SendRejected.into());
        }

        let evicted = self.enqueue(message);
        Ok(SendOutcome::Queued { evicted })
    }

    /// Append to the tail, evicting from the head beyond `buffer_size`. Returns the eviction count.
    pub fn enqueue(&self, message: Message) -> usize {
        let mut messages = self.lock();
        messages.push_back(message);

        let evicted = messages.len().saturating_sub(self.config.buffer_size);
        messages.drain(..evicted);

        if evicted > 0 {
            #[cfg(feature = "tracing")]
            tracing::warn!(
                error = %TransportError::QueueOverflow { dropped: evicted },
                capacity = self.config.buffer_size,
                "Outbound queue full"
            );
        }
        evicted
    }

    /// Send every buffered message in FIFO order through `send`.
    ///
    /// Each message is removed only once `send` accepts it, so a failure leaves that message
    /// and everything behind it queued for the next replay. The lock is not held while
    /// `send` runs.
    pub fn replay<F>(&self, mut send: F) -> Result<usize>
    where
        F: FnMut(&Message) -> Result<()>,
    {
        let mut sent = 0;
        loop {
            let Some(message) = self.lock().pop_front() else {
                return Ok(sent);
            };

            if let Err(e) = send(&message) {
                self.lock().push_front(message);
                self.trim();
                return Err(e);
            }
            sent += 1;
        }
    }

    /// Replay into an open transport.
    pub fn replay_to(&self, transport: &dyn Transport) -> Result<usize> {
        self.replay(|message| transport.send(&message.to_frame()))
    }

    /// Copy of the buffered messages, oldest first.
    #[must_use]
    pub fn queued_messages(&self) -> Vec<Message> {
        self.lock().iter().cloned().collect()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    // A message pushed back after a failed replay may overfill a queue that refilled meanwhile.
    fn trim(&self) {
        let mut messages = self.lock();
        let excess = messages.len().saturating_sub(self.config.buffer_size);
        messages.drain(..excess);
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Message>> {
        self.messages.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
