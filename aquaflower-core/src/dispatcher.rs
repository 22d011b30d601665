//! Hub-wide signal dispatcher.
//!
//! Signals are plain strings; each one owns a broadcast channel created on
//! first `connect`. Sending to a signal nobody listens on is a no-op.

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::broadcast;

const SIGNAL_CAPACITY: usize = 32;

pub struct Dispatcher {
    signals: DashMap<String, broadcast::Sender<Value>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            signals: DashMap::new(),
        }
    }

    /// Subscribe to a signal.
    pub fn connect(&self, signal: &str) -> broadcast::Receiver<Value> {
        self.signals
            .entry(signal.to_string())
            .or_insert_with(|| broadcast::channel(SIGNAL_CAPACITY).0)
            .subscribe()
    }

    /// Send a payload to every listener of `signal`. Returns how many
    /// receivers got it.
    pub fn send(&self, signal: &str, payload: Value) -> usize {
        let delivered = match self.signals.get(signal) {
            Some(tx) => tx.send(payload).unwrap_or(0),
            None => 0,
        };

        if delivered == 0 {
            // Drop channels whose listeners are gone
            self.signals
                .remove_if(signal, |_, tx| tx.receiver_count() == 0);
            tracing::debug!(signal = %signal, "Signal had no listeners");
        }

        delivered
    }

    pub fn signal_count(&self) -> usize {
        self.signals.len()
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_send_reaches_connected_listener() {
        let dispatcher = Dispatcher::new();
        let mut rx = dispatcher.connect("aquaflower_update_D1_3");

        assert_eq!(dispatcher.send("aquaflower_update_D1_3", json!("on")), 1);
        assert_eq!(rx.recv().await.unwrap(), json!("on"));
    }

    #[test]
    fn test_send_without_listeners() {
        let dispatcher = Dispatcher::new();
        assert_eq!(dispatcher.send("nobody", json!(1)), 0);
        assert_eq!(dispatcher.signal_count(), 0);
    }

    #[test]
    fn test_dropped_listener_cleans_up_signal() {
        let dispatcher = Dispatcher::new();
        let rx = dispatcher.connect("sig");
        assert_eq!(dispatcher.signal_count(), 1);

        drop(rx);
        assert_eq!(dispatcher.send("sig", json!(null)), 0);
        assert_eq!(dispatcher.signal_count(), 0);
    }

    #[test]
    fn test_signals_are_isolated() {
        let dispatcher = Dispatcher::new();
        let mut a = dispatcher.connect("a");
        let _b = dispatcher.connect("b");

        dispatcher.send("b", json!("x"));
        assert!(a.try_recv().is_err());
    }
}
