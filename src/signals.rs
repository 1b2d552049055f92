use std::io;
use std::process;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const FORCED_EXIT_CODE: i32 = 1;

/// First SIGINT/SIGTERM cancels `shutdown` so in-flight work can finish,
/// a second one exits the process immediately.
///
/// Listeners are registered before returning, so no signal is missed between
/// the first and the second one.
pub fn spawn_signal_handler(shutdown: CancellationToken) -> io::Result<JoinHandle<()>> {
    let mut signals = ShutdownSignals::new()?;
    Ok(tokio::spawn(async move {
        signals.recv().await;
        info!("Received shutdown signal, finishing in-flight work");
        shutdown.cancel();

        signals.recv().await;
        warn!("Received second shutdown signal, exiting immediately");
        process::exit(FORCED_EXIT_CODE);
    }))
}

#[cfg(unix)]
struct ShutdownSignals {
    sigterm: tokio::signal::unix::Signal,
    sigint: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl ShutdownSignals {
    fn new() -> io::Result<Self> {
        use tokio::signal::unix::{SignalKind, signal};

        Ok(Self {
            sigterm: signal(SignalKind::terminate())?,
            sigint: signal(SignalKind::interrupt())?,
        })
    }

    async fn recv(&mut self) {
        tokio::select! {
            _ = self.sigterm.recv() => info!("Received SIGTERM"),
            _ = self.sigint.recv() => info!("Received SIGINT"),
        }
    }
}

#[cfg(windows)]
struct ShutdownSignals {
    ctrl_c: tokio::signal::windows::CtrlC,
}

#[cfg(windows)]
impl ShutdownSignals {
    fn new() -> io::Result<Self> {
        Ok(Self {
            ctrl_c: tokio::signal::windows::ctrl_c()?,
        })
    }

    async fn recv(&mut self) {
        self.ctrl_c.recv().await;
        info!("Received Ctrl+C");
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::process::Command;
    use std::time::Duration;
    use tokio::time::timeout;

    fn send_sigterm_to_self() {
        let status = Command::new("sh")
            .arg("-c")
            .arg(format!("kill -TERM {}", process::id()))
            .status()
            .unwrap();
        assert!(status.success());
    }

    #[tokio::test]
    async fn test_signal_between_receives_is_not_lost() {
        let mut signals = ShutdownSignals::new().unwrap();

        send_sigterm_to_self();
        timeout(Duration::from_secs(5), signals.recv()).await.unwrap();

        // Arrives before anyone waits for it again
        send_sigterm_to_self();
        timeout(Duration::from_secs(5), signals.recv()).await.unwrap();
    }
}
