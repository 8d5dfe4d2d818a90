use tokio::sync::watch;

/// Sender side, owned by the application bootstrap.
pub struct ShutdownHandle {
    tx: watch::Sender<bool>,
}

/// Receiver side handed to every long-running loop (event loop, worker
/// pools). Clones observe the same signal.
#[derive(Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

pub fn new_pair() -> (ShutdownHandle, ShutdownSignal) {
    let (tx, rx) = watch::channel(false);
    (ShutdownHandle { tx }, ShutdownSignal { rx })
}

impl ShutdownHandle {
    pub fn trigger(&self) {
        // Fails only when every signal has been dropped.
        let _ = self.tx.send(true);
    }
}

impl ShutdownSignal {
    /// Resolve once shutdown has been triggered, immediately if it already
    /// was. A dropped handle counts as a trigger.
    pub async fn wait(&mut self) {
        let _ = self.rx.wait_for(|&v| v).await;
    }
}

/// Wait for `SIGINT` or `SIGTERM`.
pub async fn wait_for_os_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::select! {
        _ = sigint.recv()  => tracing::info!("🔔 SIGINT received"),
        _ = sigterm.recv() => tracing::info!("🔔 SIGTERM received"),
    }
    Ok(())
}
