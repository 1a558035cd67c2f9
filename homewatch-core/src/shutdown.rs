use tokio::sync::watch;

/// Owner side of the process-wide shutdown signal.
#[derive(Debug)]
pub struct Shutdown {
    tx: watch::Sender<bool>,
}

/// Cloneable receiver checked at every suspension point.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal { rx: self.tx.subscribe() }
    }

    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownSignal {
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown was triggered (or the owner is gone).
    pub async fn wait(&self) {
        let mut rx = self.rx.clone();
        let _ = rx.wait_for(|triggered| *triggered).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_late_subscriber_sees_trigger() {
        let shutdown = Shutdown::new();
        shutdown.trigger();
        let signal = shutdown.signal();
        assert!(signal.is_triggered());
        tokio::time::timeout(Duration::from_secs(1), signal.wait()).await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_blocks_until_trigger() {
        let shutdown = Shutdown::new();
        let signal = shutdown.signal();
        assert!(tokio::time::timeout(Duration::from_millis(50), signal.wait()).await.is_err());
        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(1), signal.wait()).await.unwrap();
    }
}
