use futures_util::future::{select_all, BoxFuture, FutureExt};
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

fn stop_signals() -> [(SignalKind, &'static str); 4] {
    [
        (SignalKind::interrupt(), "SIGINT"),
        (SignalKind::terminate(), "SIGTERM"),
        (SignalKind::hangup(), "SIGHUP"),
        (SignalKind::quit(), "SIGQUIT"),
    ]
}

/// Cancels `shutdown` on the first stop signal. The scheduler notices at its
/// next tick and runs its own shutdown path. A signal that cannot be
/// registered is logged and left to its default disposition.
pub fn spawn_shutdown_handler(shutdown: CancellationToken) -> JoinHandle<()> {
    let mut waits: Vec<BoxFuture<'static, &'static str>> = Vec::new();
    for (kind, name) in stop_signals() {
        match signal(kind) {
            Ok(mut stream) => waits.push(
                async move {
                    stream.recv().await;
                    name
                }
                .boxed(),
            ),
            Err(err) => tracing::warn!(signal = name, error = %err, "failed to register handler"),
        }
    }

    tokio::spawn(async move {
        if waits.is_empty() {
            shutdown.cancelled().await;
            return;
        }
        tokio::select! {
            (name, _, _) = select_all(waits) => {
                tracing::info!(signal = name, "stop signal received, stopping agent");
                shutdown.cancel();
            }
            _ = shutdown.cancelled() => {}
        }
    })
}
