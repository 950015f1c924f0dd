//! Typed signals emitted by every public store operation.
//!
//! Subscribers attach through [`SignalHub::subscribe`]; emission is
//! fire-and-forget and never blocks a store call.

use std::fmt;

use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMethod {
    Put,
    Get,
    Last,
    Delete,
    Incr,
    Scan,
}

impl fmt::Display for StoreMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StoreMethod::Put => "put",
            StoreMethod::Get => "get",
            StoreMethod::Last => "last",
            StoreMethod::Delete => "delete",
            StoreMethod::Incr => "incr",
            StoreMethod::Scan => "scan",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct StoreSignal {
    pub store: &'static str,
    pub method: StoreMethod,
    pub count: usize,
    pub row_keys: Vec<String>,
    pub timer_s: f64,
}

pub struct SignalHub {
    tx: broadcast::Sender<StoreSignal>,
}

impl SignalHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreSignal> {
        self.tx.subscribe()
    }

    pub fn emit(&self, signal: StoreSignal) {
        let _ = self.tx.send(signal);
    }
}

impl Default for SignalHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_and_receive() {
        let hub = SignalHub::new();
        let mut rx = hub.subscribe();
        hub.emit(StoreSignal {
            store: "timeseries",
            method: StoreMethod::Put,
            count: 3,
            row_keys: vec!["dev1#29799949".to_string()],
            timer_s: 0.01,
        });
        let sig = rx.recv().await.unwrap();
        assert_eq!(sig.store, "timeseries");
        assert_eq!(sig.method, StoreMethod::Put);
        assert_eq!(sig.count, 3);
    }

    #[test]
    fn test_emit_without_subscribers_is_noop() {
        let hub = SignalHub::new();
        hub.emit(StoreSignal {
            store: "metadata",
            method: StoreMethod::Get,
            count: 0,
            row_keys: vec![],
            timer_s: 0.0,
        });
    }
}
