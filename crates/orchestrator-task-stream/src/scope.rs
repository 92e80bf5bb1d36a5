use tokio::sync::watch;

/// Handle used to cancel every operation bound to a scope.
#[derive(Clone)]
pub struct AbortHandle {
    tx: watch::Sender<bool>,
}

impl AbortHandle {
    /// Requests cancellation. Idempotent.
    ///
    /// Cancellation is not an error: bound operations stop quietly and their
    /// late results are discarded.
    pub fn abort(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_aborted(&self) -> bool {
        *self.tx.borrow()
    }

    /// Returns a token observing this scope.
    pub fn token(&self) -> ScopeToken {
        ScopeToken {
            rx: self.tx.subscribe(),
        }
    }
}

/// Read side of a scope; checked before applying any asynchronous result.
#[derive(Clone)]
pub struct ScopeToken {
    rx: watch::Receiver<bool>,
}

impl ScopeToken {
    /// True once the scope was aborted or its handle dropped.
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }

    /// Resolves when the scope is cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        let _ = rx.wait_for(|aborted| *aborted).await;
    }
}

/// Creates a new, live scope.
pub fn scope() -> (AbortHandle, ScopeToken) {
    let (tx, rx) = watch::channel(false);
    (AbortHandle { tx }, ScopeToken { rx })
}
