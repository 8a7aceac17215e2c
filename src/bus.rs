//! Event bus - in-process fan-out
//!
//! Each published event goes, in publish order, to exactly one durable sink
//! (durable events only) and then to every live outlet. Outlets are fed with
//! `try_send`: a full or closed outlet is removed instead of blocking the
//! producer.

use std::collections::HashMap;

use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::channel::Subscription;
use crate::error::Result;
use crate::event::Event;
use crate::ids::SubscriberId;

/// Destination for durable events
pub trait EventSink: Send {
    fn record(&mut self, event: &Event) -> Result<()>;
}

enum Outlet {
    /// External subscriber with a bounded buffer
    Bounded(mpsc::Sender<Event>),
    /// Internal listener that must see every event (the query stream)
    Unbounded(mpsc::UnboundedSender<Event>),
}

pub struct EventBus<S> {
    sink: S,
    outlets: HashMap<SubscriberId, Outlet>,
    next_id: u64,
    buffer: usize,
}

impl<S: EventSink> EventBus<S> {
    /// `buffer` is the per-subscriber queue length
    pub fn new(sink: S, buffer: usize) -> Self {
        Self {
            sink,
            outlets: HashMap::new(),
            next_id: 0,
            buffer: buffer.max(1),
        }
    }

    fn allocate_id(&mut self) -> SubscriberId {
        self.next_id += 1;
        SubscriberId::new(self.next_id)
    }

    /// Register a live subscriber
    pub fn subscribe(&mut self) -> Subscription {
        let id = self.allocate_id();
        let (tx, rx) = mpsc::channel(self.buffer);
        self.outlets.insert(id, Outlet::Bounded(tx));
        debug!(subscriber = %id, "Subscriber registered");
        Subscription::new(id, rx)
    }

    /// Register a listener that is never dropped for being slow
    pub(crate) fn attach(&mut self) -> (SubscriberId, mpsc::UnboundedReceiver<Event>) {
        let id = self.allocate_id();
        let (tx, rx) = mpsc::unbounded_channel();
        self.outlets.insert(id, Outlet::Unbounded(tx));
        (id, rx)
    }

    /// Remove a subscriber; returns whether it was registered
    pub fn unsubscribe(&mut self, id: SubscriberId) -> bool {
        self.outlets.remove(&id).is_some()
    }

    /// Deliver one event; returns how many outlets received it
    ///
    /// A durable event the sink rejects is not fanned out.
    pub fn publish(&mut self, event: &Event) -> Result<usize> {
        if event.is_durable() {
            if let Err(e) = self.sink.record(event) {
                error!(event_type = event.kind(), error = %e, "Failed to persist event");
                return Err(e);
            }
        }

        let mut delivered = 0;
        let mut to_remove = Vec::new();
        for (id, outlet) in &self.outlets {
            let sent = match outlet {
                Outlet::Bounded(tx) => match tx.try_send(event.clone()) {
                    Ok(()) => true,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(subscriber = %id, "Dropping slow subscriber");
                        false
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => false,
                },
                Outlet::Unbounded(tx) => tx.send(event.clone()).is_ok(),
            };
            if sent {
                delivered += 1;
            } else {
                to_remove.push(*id);
            }
        }
        for id in to_remove {
            self.outlets.remove(&id);
            debug!(subscriber = %id, "Subscriber removed from fan-out");
        }
        Ok(delivered)
    }

    pub fn subscriber_count(&self) -> usize {
        self.outlets.len()
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }
}
