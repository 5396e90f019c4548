//! Graph event system.
//!
//! Events are emitted while a graph is wired, finalized and closed, and can
//! be received asynchronously by any number of listeners.

use crate::error::ElementRole;
use crate::item::PadId;
use std::fmt;
use tokio::sync::broadcast;

/// Events emitted by a [`Graph`](super::Graph).
#[derive(Debug, Clone, PartialEq)]
pub enum GraphEvent {
    /// An element was registered.
    ElementAdded {
        /// Element name.
        name: String,
        /// Role it was registered with.
        role: ElementRole,
    },

    /// Two elements were connected and the sink's pads configured.
    Connected {
        /// Upstream element.
        source: String,
        /// Downstream element.
        sink: String,
        /// `(source pad, sink pad)` pairs, ascending by source pad.
        pads: Vec<(PadId, PadId)>,
    },

    /// A connection task is running.
    ConnectionStarted {
        /// Upstream element.
        source: String,
        /// Downstream element.
        sink: String,
    },

    /// A connection task ended (stream closed or graph cancelled).
    ConnectionFinished {
        /// Upstream element.
        source: String,
        /// Downstream element.
        sink: String,
    },

    /// Every connection task has started.
    Finalized {
        /// Number of connections.
        connections: usize,
    },

    /// A delivery or close failed.
    Error {
        /// The error message.
        message: String,
        /// The element concerned, if known.
        element: Option<String>,
    },

    /// The graph was closed.
    Closed,
}

impl fmt::Display for GraphEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GraphEvent::ElementAdded { name, role } => write!(f, "Added {} {}", role, name),
            GraphEvent::Connected { source, sink, pads } => {
                write!(f, "Connected {} -> {} ({} pads)", source, sink, pads.len())
            }
            GraphEvent::ConnectionStarted { source, sink } => {
                write!(f, "Connection {} -> {} started", source, sink)
            }
            GraphEvent::ConnectionFinished { source, sink } => {
                write!(f, "Connection {} -> {} finished", source, sink)
            }
            GraphEvent::Finalized { connections } => {
                write!(f, "Graph finalized ({} connections)", connections)
            }
            GraphEvent::Error { message, element } => match element {
                Some(e) => write!(f, "Error in {}: {}", e, message),
                None => write!(f, "Error: {}", message),
            },
            GraphEvent::Closed => write!(f, "Graph closed"),
        }
    }
}

/// Sender for graph events.
#[derive(Clone)]
pub struct EventSender {
    sender: broadcast::Sender<GraphEvent>,
}

impl EventSender {
    /// Create a new event sender with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Send an event.
    ///
    /// Returns the number of receivers that got it; 0 without receivers.
    pub fn send(&self, event: GraphEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    /// Send an error event.
    pub fn send_error(&self, message: impl Into<String>, element: Option<String>) {
        self.send(GraphEvent::Error {
            message: message.into(),
            element,
        });
    }

    /// Create a receiver for events sent from now on.
    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
        }
    }
}

impl Default for EventSender {
    fn default() -> Self {
        Self::new(256)
    }
}

impl fmt::Debug for EventSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSender")
            .field("receivers", &self.sender.receiver_count())
            .finish()
    }
}

/// Receiver for graph events.
pub struct EventReceiver {
    receiver: broadcast::Receiver<GraphEvent>,
}

impl EventReceiver {
    /// Receive the next event.
    ///
    /// Skips over events lost to lagging. Returns `None` once the graph is
    /// gone.
    pub async fn recv(&mut self) -> Option<GraphEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Receive an event without waiting.
    pub fn try_recv(&mut self) -> Option<GraphEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }

    /// Wait for [`GraphEvent::Closed`].
    ///
    /// Returns the error events seen on the way.
    pub async fn wait_closed(&mut self) -> Vec<GraphEvent> {
        let mut errors = Vec::new();
        while let Some(event) = self.recv().await {
            match event {
                GraphEvent::Closed => break,
                e @ GraphEvent::Error { .. } => errors.push(e),
                _ => {}
            }
        }
        errors
    }
}
