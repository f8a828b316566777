use tokio::sync::watch;

/// The sending half of a stop signal, shared by all loops of a session. Dropping the trigger
///  stops the loops as well.
pub struct StopTrigger {
    tx: watch::Sender<bool>,
}

/// The receiving half of a stop signal. Every loop holds its own clone and checks it at each
///  bounded wait.
#[derive(Clone)]
pub struct StopSignal {
    rx: watch::Receiver<bool>,
}

impl StopTrigger {
    pub fn new() -> StopTrigger {
        let (tx, _) = watch::channel(false);
        StopTrigger { tx }
    }

    pub fn signal(&self) -> StopSignal {
        StopSignal { rx: self.tx.subscribe() }
    }

    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }
}

impl Default for StopTrigger {
    fn default() -> Self {
        Self::new()
    }
}

impl StopSignal {
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }

    /// Completes once stop was triggered, or the trigger was dropped
    pub async fn triggered(&mut self) {
        let _ = self.rx.wait_for(|stopped| *stopped).await;
    }
}
