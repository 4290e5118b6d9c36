// src/events.rs

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;

use crate::models::{JobId, Outcome};

/// Per-job notification published by the state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Title learned from metadata.
    Title { job: JobId, title: String },
    /// Human-readable status line.
    Status { job: JobId, text: String },
    /// Transfer progress. `None` means the total is unknown.
    Progress { job: JobId, fraction: Option<f64> },
    /// A pre-existing file occupies the job's final path; a decision is
    /// required via `provide_collision_decision`.
    CollisionPrompt { job: JobId, path: PathBuf },
    /// The single terminal event for a job.
    Terminal { job: JobId, outcome: Outcome },
}

impl Event {
    pub fn job(&self) -> JobId {
        match self {
            Event::Title { job, .. }
            | Event::Status { job, .. }
            | Event::Progress { job, .. }
            | Event::CollisionPrompt { job, .. }
            | Event::Terminal { job, .. } => *job,
        }
    }

    /// Progress and status chatter may be shed under backpressure; prompts
    /// and terminals never are.
    fn is_droppable(&self) -> bool {
        matches!(self, Event::Progress { .. } | Event::Status { .. })
    }
}

struct Buffer {
    events: VecDeque<Event>,
    capacity: usize,
}

/// Ordered, bounded, non-blocking delivery of job events to a single
/// logical subscriber.
///
/// `publish` never blocks: when the buffer is full the oldest droppable
/// event is shed first. Events that carry a decision or a terminal outcome
/// are retained even if that means transiently exceeding capacity.
#[derive(Clone)]
pub struct EventBus {
    buffer: Arc<Mutex<Buffer>>,
    notify: Arc<Notify>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: Arc::new(Mutex::new(Buffer {
                events: VecDeque::new(),
                capacity: capacity.max(1),
            })),
            notify: Arc::new(Notify::new()),
        }
    }

    fn hold(&self) -> MutexGuard<'_, Buffer> {
        // A panic while publishing leaves the queue intact, so recover.
        self.buffer.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Enqueues an event for the subscriber. Never blocks the publisher.
    pub fn publish(&self, event: Event) {
        {
            let mut buf = self.hold();
            if buf.events.len() >= buf.capacity {
                if let Some(pos) = buf.events.iter().position(Event::is_droppable) {
                    tracing::debug!(dropped = ?buf.events[pos], "event buffer full, shedding");
                    buf.events.remove(pos);
                }
            }
            buf.events.push_back(event);
        }
        self.notify.notify_one();
    }

    /// Subscriber handle over the same buffer.
    pub fn subscribe(&self) -> Events {
        Events { bus: self.clone() }
    }
}

/// Receiving side of the event bus.
pub struct Events {
    bus: EventBus,
}

impl Events {
    /// Waits for the next event.
    pub async fn recv(&mut self) -> Event {
        loop {
            if let Some(event) = self.try_recv() {
                return event;
            }
            self.bus.notify.notified().await;
        }
    }

    /// Returns the next event if one is already buffered.
    pub fn try_recv(&mut self) -> Option<Event> {
        self.bus.hold().events.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CancelReason;

    fn progress(job: JobId, fraction: f64) -> Event {
        Event::Progress {
            job,
            fraction: Some(fraction),
        }
    }

    #[test]
    fn delivery_preserves_publish_order() {
        let bus = EventBus::new(16);
        let mut events = bus.subscribe();
        bus.publish(progress(1, 0.1));
        bus.publish(progress(1, 0.2));
        bus.publish(progress(1, 0.3));
        assert_eq!(events.try_recv(), Some(progress(1, 0.1)));
        assert_eq!(events.try_recv(), Some(progress(1, 0.2)));
        assert_eq!(events.try_recv(), Some(progress(1, 0.3)));
        assert_eq!(events.try_recv(), None);
    }

    #[test]
    fn oldest_progress_is_shed_when_full() {
        let bus = EventBus::new(2);
        let mut events = bus.subscribe();
        bus.publish(progress(1, 0.1));
        bus.publish(progress(1, 0.2));
        bus.publish(progress(1, 0.3));
        assert_eq!(events.try_recv(), Some(progress(1, 0.2)));
        assert_eq!(events.try_recv(), Some(progress(1, 0.3)));
    }

    #[test]
    fn terminal_and_prompt_events_survive_backpressure() {
        let bus = EventBus::new(2);
        let terminal = Event::Terminal {
            job: 1,
            outcome: Outcome::Cancelled(CancelReason::User),
        };
        let prompt = Event::CollisionPrompt {
            job: 2,
            path: PathBuf::from("/tmp/x"),
        };
        bus.publish(terminal.clone());
        bus.publish(prompt.clone());
        // Buffer is full of undroppable events; the next publish must not
        // evict either of them.
        bus.publish(progress(3, 0.5));

        let mut events = bus.subscribe();
        assert_eq!(events.try_recv(), Some(terminal));
        assert_eq!(events.try_recv(), Some(prompt));
        assert_eq!(events.try_recv(), Some(progress(3, 0.5)));
    }

    #[tokio::test]
    async fn recv_wakes_on_publish() {
        let bus = EventBus::new(4);
        let mut events = bus.subscribe();
        let publisher = bus.clone();
        tokio::spawn(async move {
            publisher.publish(progress(7, 1.0));
        });
        assert_eq!(events.recv().await, progress(7, 1.0));
    }
}
