//! Per-channel priority mailbox.
//!
//! Four FIFO sub-queues, one per [`MessagePriority`], with a nominal capacity
//! and a hard ceiling. Admission when full:
//!
//! - the oldest `Low` message is evicted if there is one, and the newcomer
//!   is admitted whatever its priority;
//! - otherwise a `Low` newcomer is rejected;
//! - otherwise the newcomer is admitted above capacity, up to the ceiling;
//! - at the ceiling the newcomer may only displace the oldest message of a
//!   strictly lower class, and is rejected when there is none.

use std::collections::VecDeque;

use crate::domain::{MessagePriority, OutboundMessage};

/// Result of offering a message to the mailbox.
#[derive(Debug)]
pub enum Admission {
    /// Admitted within capacity.
    Accepted,
    /// Admitted after evicting the returned message.
    AcceptedEvicting(OutboundMessage),
    /// Admitted above nominal capacity.
    AcceptedOverCapacity,
    /// Not admitted; the message is handed back.
    Rejected(OutboundMessage),
}

impl Admission {
    pub fn is_accepted(&self) -> bool {
        !matches!(self, Admission::Rejected(_))
    }
}

#[derive(Debug)]
pub struct PriorityMailbox {
    /// Indexed by [`MessagePriority::index`].
    queues: [VecDeque<OutboundMessage>; 4],
    capacity: usize,
    ceiling: usize,
    starvation_threshold: Option<u32>,
    /// Consecutive dequeues that passed over a waiting lower class.
    skipped_streak: u32,
}

impl PriorityMailbox {
    /// `max_overflow` is how far above `capacity` higher-priority traffic may
    /// push the mailbox.
    pub fn new(capacity: usize, max_overflow: usize) -> Self {
        Self {
            queues: Default::default(),
            capacity,
            ceiling: capacity.saturating_add(max_overflow),
            starvation_threshold: None,
            skipped_streak: 0,
        }
    }

    /// Enable aging: after `threshold` consecutive dequeues that skipped a
    /// waiting lower class, one lower-class message is served.
    pub fn with_starvation_threshold(mut self, threshold: Option<u32>) -> Self {
        self.starvation_threshold = threshold.filter(|t| *t > 0);
        self
    }

    /// Offer a new message at the back of its class.
    pub fn admit(&mut self, message: OutboundMessage) -> Admission {
        self.place(message, false)
    }

    /// Return a message to the front of its class, ahead of later arrivals.
    ///
    /// Uses the same capacity policy as [`admit`](Self::admit).
    pub fn requeue(&mut self, message: OutboundMessage) -> Admission {
        self.place(message, true)
    }

    /// Next message to deliver.
    pub fn take_next(&mut self) -> Option<OutboundMessage> {
        let top = self.highest_populated()?;
        let waiting_below = self.highest_populated_below(top);

        let chosen = match (self.starvation_threshold, waiting_below) {
            (Some(threshold), Some(lower)) if self.skipped_streak >= threshold => {
                self.skipped_streak = 0;
                lower
            }
            (_, Some(_)) => {
                self.skipped_streak = self.skipped_streak.saturating_add(1);
                top
            }
            (_, None) => {
                self.skipped_streak = 0;
                top
            }
        };

        self.queues[chosen.index()].pop_front()
    }

    pub fn size(&self) -> usize {
        self.queues.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.iter().all(VecDeque::is_empty)
    }

    pub fn len_of(&self, priority: MessagePriority) -> usize {
        self.queues[priority.index()].len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    /// Discard everything; returns how many messages were dropped.
    pub fn clear(&mut self) -> usize {
        let dropped = self.size();
        for queue in &mut self.queues {
            queue.clear();
        }
        self.skipped_streak = 0;
        dropped
    }

    fn place(&mut self, message: OutboundMessage, front: bool) -> Admission {
        let size = self.size();

        let outcome = if size < self.capacity {
            Admission::Accepted
        } else if let Some(evicted) = self.queues[MessagePriority::Low.index()].pop_front() {
            Admission::AcceptedEvicting(evicted)
        } else if message.priority == MessagePriority::Low {
            return Admission::Rejected(message);
        } else if size < self.ceiling {
            Admission::AcceptedOverCapacity
        } else {
            match self
                .lowest_populated()
                .filter(|lowest| *lowest < message.priority)
                .and_then(|lowest| self.queues[lowest.index()].pop_front())
            {
                Some(evicted) => Admission::AcceptedEvicting(evicted),
                None => return Admission::Rejected(message),
            }
        };

        let queue = &mut self.queues[message.priority.index()];
        if front {
            queue.push_front(message);
        } else {
            queue.push_back(message);
        }
        outcome
    }

    fn highest_populated(&self) -> Option<MessagePriority> {
        MessagePriority::DEQUEUE_ORDER
            .into_iter()
            .find(|p| !self.queues[p.index()].is_empty())
    }

    fn highest_populated_below(&self, above: MessagePriority) -> Option<MessagePriority> {
        MessagePriority::DEQUEUE_ORDER
            .into_iter()
            .filter(|p| *p < above)
            .find(|p| !self.queues[p.index()].is_empty())
    }

    fn lowest_populated(&self) -> Option<MessagePriority> {
        MessagePriority::DEQUEUE_ORDER
            .into_iter()
            .rev()
            .find(|p| !self.queues[p.index()].is_empty())
    }
}
