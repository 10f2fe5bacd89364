//! Cooperative shutdown.
//!
//! Signal handling only flips a flag; the accept loop and every relay pair
//! observe it from their own tasks and close through their normal paths.

use std::sync::Arc;

use tokio::sync::watch;

/// Owner side of the shutdown flag.
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
}

impl Shutdown {
    /// Create an untriggered flag.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Request shutdown. Repeated calls have no further effect.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    /// Whether shutdown was requested.
    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// A handle that resolves once shutdown is requested.
    pub fn subscribe(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Observer side of the shutdown flag.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Wait until shutdown is requested.
    pub async fn recv(&mut self) {
        let orphaned = self.rx.wait_for(|stop| *stop).await.is_err();
        if orphaned {
            // Every owner is gone, nobody can request shutdown any more.
            std::future::pending::<()>().await;
        }
    }

    /// Consume the handle, resolving once shutdown is requested.
    pub async fn recv_owned(mut self) {
        self.recv().await
    }
}

/// Wait for SIGINT or SIGTERM.
#[cfg(unix)]
pub async fn wait_for_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = terminate.recv() => {}
    }
    Ok(())
}

/// Wait for Ctrl-C.
#[cfg(not(unix))]
pub async fn wait_for_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
