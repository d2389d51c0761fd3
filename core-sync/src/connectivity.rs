//! # Network Monitor
//!
//! Single authoritative connectivity flag with edge-triggered notifications.
//!
//! - Connectivity listeners fire once per actual transition, never for a
//!   repeated report of the same state.
//! - Reconnection listeners fire only on the offline to online edge.
//! - Transitions are delivered one at a time by a single dispatcher. A report
//!   made while a transition is being delivered (from a listener or another
//!   thread) is queued and delivered after it, so every listener observes the
//!   same sequence of values in the same order.
//!
//! What happens after a reconnection is up to the listener; the offline
//! queue registers one through [`OfflineQueue::start_auto_flush`](crate::OfflineQueue::start_auto_flush).

use bridge_traits::error::Result as BridgeResult;
use bridge_traits::NetworkStatusSource;
use core_runtime::events::{CoreEvent, EventBus, NetworkEvent};
use core_runtime::listeners::{Listener, ListenerId, ListenerSet, Subscription};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

struct State {
    connected: bool,
    /// Accepted transitions not yet delivered to listeners
    pending: VecDeque<bool>,
    dispatching: bool,
}

pub struct NetworkMonitor {
    state: Mutex<State>,
    change_listeners: ListenerSet<bool>,
    reconnect_listeners: ListenerSet<()>,
    events: Option<EventBus>,
    pump: Mutex<Option<core_async::task::JoinHandle<()>>>,
}

impl NetworkMonitor {
    /// Monitor driven through [`report`](Self::report), starting at `initial`.
    pub fn new(initial: bool) -> Self {
        Self {
            state: Mutex::new(State {
                connected: initial,
                pending: VecDeque::new(),
                dispatching: false,
            }),
            change_listeners: ListenerSet::new(),
            reconnect_listeners: ListenerSet::new(),
            events: None,
            pump: Mutex::new(None),
        }
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Initialize from `source` and follow its change stream in a background
    /// task.
    ///
    /// An indeterminate or failed initial read starts the monitor offline;
    /// indeterminate updates are ignored.
    pub async fn attach(
        source: Arc<dyn NetworkStatusSource>,
        events: Option<EventBus>,
    ) -> BridgeResult<Arc<Self>> {
        let initial = match source.get_network_info().await {
            Ok(info) => info.reachable().unwrap_or(false),
            Err(e) => {
                warn!(error = %e, "Initial network status unavailable; starting offline");
                false
            }
        };

        let mut monitor = Self::new(initial);
        monitor.events = events;
        let monitor = Arc::new(monitor);

        let mut stream = source.subscribe_changes().await?;
        let weak = Arc::downgrade(&monitor);
        let handle = core_async::spawn(async move {
            while let Some(info) = stream.next().await {
                let Some(monitor) = weak.upgrade() else { break };
                match info.reachable() {
                    Some(connected) => {
                        monitor.report(connected);
                    }
                    None => debug!("Ignoring indeterminate network status"),
                }
            }
            debug!("Network change stream closed");
        });
        *monitor.pump.lock() = Some(handle);

        info!(connected = initial, "Network monitor attached");
        Ok(monitor)
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    /// Apply a settled connectivity report.
    ///
    /// Returns `true` if the state changed. Listeners run outside the state
    /// lock; a report arriving mid-delivery is delivered once the current
    /// transition has reached every listener.
    pub fn report(&self, connected: bool) -> bool {
        {
            let mut state = self.state.lock();
            if state.connected == connected {
                return false;
            }
            state.connected = connected;
            state.pending.push_back(connected);
            if state.dispatching {
                debug!(connected = connected, "Queued connectivity change behind delivery");
                return true;
            }
            state.dispatching = true;
        }

        loop {
            let next = {
                let mut state = self.state.lock();
                match state.pending.pop_front() {
                    Some(next) => next,
                    None => {
                        state.dispatching = false;
                        break;
                    }
                }
            };
            self.deliver(next);
        }
        true
    }

    fn deliver(&self, connected: bool) {
        info!(connected = connected, "Connectivity changed");
        self.change_listeners.notify(&connected);
        self.emit(NetworkEvent::StatusChanged { connected });

        if connected {
            self.reconnect_listeners.notify(&());
            self.emit(NetworkEvent::Reconnected);
        }
    }

    pub fn on_connectivity_change(&self, listener: Listener<bool>) -> Subscription {
        self.change_listeners.add(listener)
    }

    pub fn off_connectivity_change(&self, id: ListenerId) -> bool {
        self.change_listeners.remove(id)
    }

    pub fn on_reconnection(&self, listener: Listener<()>) -> Subscription {
        self.reconnect_listeners.add(listener)
    }

    pub fn off_reconnection(&self, id: ListenerId) -> bool {
        self.reconnect_listeners.remove(id)
    }

    pub fn reconnection_listener_count(&self) -> usize {
        self.reconnect_listeners.len()
    }

    fn emit(&self, event: NetworkEvent) {
        if let Some(events) = &self.events {
            let _ = events.emit(CoreEvent::Network(event));
        }
    }
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}

impl Drop for NetworkMonitor {
    fn drop(&mut self) {
        if let Some(handle) = self.pump.lock().take() {
            handle.abort();
        }
    }
}

impl fmt::Debug for NetworkMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkMonitor")
            .field("connected", &self.is_connected())
            .field("change_listeners", &self.change_listeners.len())
            .field("reconnect_listeners", &self.reconnect_listeners.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn recorder(monitor: &NetworkMonitor) -> Arc<Mutex<Vec<bool>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        monitor.on_connectivity_change(Arc::new(move |connected: &bool| {
            sink.lock().push(*connected);
        }));
        seen
    }

    fn reconnect_counter(monitor: &NetworkMonitor) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&count);
        monitor.on_reconnection(Arc::new(move |_: &()| {
            sink.fetch_add(1, Ordering::SeqCst);
        }));
        count
    }

    #[test]
    fn test_redundant_reports_do_not_fire() {
        let monitor = NetworkMonitor::new(true);
        let seen = recorder(&monitor);

        assert!(!monitor.report(true));
        assert!(monitor.report(false));
        assert!(!monitor.report(false));
        assert!(monitor.report(true));

        assert_eq!(*seen.lock(), vec![false, true]);
    }

    #[test]
    fn test_reconnection_is_edge_triggered() {
        let monitor = NetworkMonitor::new(true);
        let reconnects = reconnect_counter(&monitor);

        monitor.report(true);
        assert_eq!(reconnects.load(Ordering::SeqCst), 0);

        monitor.report(false);
        assert_eq!(reconnects.load(Ordering::SeqCst), 0);

        monitor.report(true);
        monitor.report(true);
        assert_eq!(reconnects.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_all_listeners_see_same_sequence() {
        let monitor = NetworkMonitor::new(false);
        let first = recorder(&monitor);
        let second = recorder(&monitor);

        for state in [true, true, false, true, false, false] {
            monitor.report(state);
        }

        assert_eq!(*first.lock(), vec![true, false, true, false]);
        assert_eq!(*first.lock(), *second.lock());
    }

    #[test]
    fn test_listener_registered_twice_fires_once() {
        let monitor = NetworkMonitor::new(false);
        let count = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&count);
        let listener: Listener<()> = Arc::new(move |_: &()| {
            sink.fetch_add(1, Ordering::SeqCst);
        });

        monitor.on_reconnection(Arc::clone(&listener));
        monitor.on_reconnection(listener);
        monitor.report(true);

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_off_stops_notifications() {
        let monitor = NetworkMonitor::new(true);
        let count = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&count);
        let subscription = monitor.on_connectivity_change(Arc::new(move |_: &bool| {
            sink.fetch_add(1, Ordering::SeqCst);
        }));

        assert!(monitor.off_connectivity_change(subscription.id()));
        monitor.report(false);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_reentrant_report_is_delivered_after_current_transition() {
        let bus = EventBus::new(16);
        let mut events = bus.subscribe();
        let monitor = Arc::new(NetworkMonitor::new(true).with_events(bus));

        let inner = Arc::clone(&monitor);
        let first = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&first);
        monitor.on_connectivity_change(Arc::new(move |connected: &bool| {
            sink.lock().push(*connected);
            if !*connected {
                inner.report(true);
            }
        }));
        let second = recorder(&monitor);
        let reconnects = reconnect_counter(&monitor);

        assert!(monitor.report(false));

        assert!(monitor.is_connected());
        assert_eq!(*first.lock(), vec![false, true]);
        assert_eq!(*second.lock(), vec![false, true]);
        assert_eq!(reconnects.load(Ordering::SeqCst), 1);

        let mut seen = Vec::new();
        while let Ok(CoreEvent::Network(event)) = events.try_recv() {
            seen.push(event);
        }
        assert_eq!(
            seen,
            vec![
                NetworkEvent::StatusChanged { connected: false },
                NetworkEvent::StatusChanged { connected: true },
                NetworkEvent::Reconnected,
            ]
        );
    }

    #[test]
    fn test_reentrant_report_of_same_state_is_ignored() {
        let monitor = Arc::new(NetworkMonitor::new(true));
        let inner = Arc::clone(&monitor);
        let changed = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&changed);
        monitor.on_connectivity_change(Arc::new(move |_: &bool| {
            sink.lock().push(inner.report(false));
        }));
        let seen = recorder(&monitor);

        monitor.report(false);
        assert_eq!(*changed.lock(), vec![false]);
        assert_eq!(*seen.lock(), vec![false]);
        assert!(!monitor.is_connected());
    }
}
