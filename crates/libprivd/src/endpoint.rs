use std::sync::{Arc, Mutex};

/// Observer invoked exactly once when a remote endpoint becomes unreachable.
pub type DisconnectObserver = Box<dyn FnOnce() + Send>;

/// A handle to a remote peer whose liveness can be observed.
///
/// Generalizes the transport's death-notification facility: an observer
/// registered on a live handle fires when the peer disappears; an observer
/// registered on an already-dead handle fires immediately, so registries
/// never retain a record for a peer that died during attach.
pub trait RemoteEndpoint: Send + Sync {
    /// Register a disconnect observer. Fires at most once.
    fn watch_disconnect(&self, observer: DisconnectObserver);

    /// Whether the peer is still reachable.
    fn is_connected(&self) -> bool;

    /// Tear the endpoint down, firing disconnect observers.
    fn close(&self);
}

#[derive(Default)]
struct EndpointState {
    disconnected: bool,
    observers: Vec<DisconnectObserver>,
}

/// Shared endpoint state used by the server's connection layer and tests.
///
/// The transport marks the handle disconnected when its read loop ends;
/// queued observers run outside the lock so they can re-enter the
/// registries that installed them.
#[derive(Default)]
pub struct EndpointHandle {
    inner: Mutex<EndpointState>,
}

impl EndpointHandle {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Mark the endpoint dead and fire all pending observers.
    /// Subsequent calls are no-ops.
    pub fn mark_disconnected(&self) {
        let observers = {
            let mut state = self.inner.lock().expect("endpoint state lock");
            if state.disconnected {
                return;
            }
            state.disconnected = true;
            std::mem::take(&mut state.observers)
        };
        for observer in observers {
            observer();
        }
    }
}

impl RemoteEndpoint for EndpointHandle {
    fn watch_disconnect(&self, observer: DisconnectObserver) {
        let fire_now = {
            let mut state = self.inner.lock().expect("endpoint state lock");
            if state.disconnected {
                Some(observer)
            } else {
                state.observers.push(observer);
                None
            }
        };
        if let Some(observer) = fire_now {
            observer();
        }
    }

    fn is_connected(&self) -> bool {
        !self.inner.lock().expect("endpoint state lock").disconnected
    }

    fn close(&self) {
        self.mark_disconnected();
    }
}
