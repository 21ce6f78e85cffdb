use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

fn shutdown_signals() -> [(SignalKind, &'static str); 3] {
    [
        (SignalKind::interrupt(), "SIGINT"),
        (SignalKind::terminate(), "SIGTERM"),
        (SignalKind::hangup(), "SIGHUP"),
    ]
}

/// Cancel the returned token on the first SIGINT, SIGTERM or SIGHUP.
///
/// Handlers are registered before this returns, so a signal delivered right
/// after is not lost. The broker reaps its workers and the pipeline closes its
/// sockets once the token fires.
pub fn install_shutdown_handler() -> std::io::Result<CancellationToken> {
    let token = CancellationToken::new();

    for (kind, name) in shutdown_signals() {
        let mut stream = signal(kind)?;
        let token = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                received = stream.recv() => {
                    if received.is_some() {
                        tracing::info!(signal = name, "Received signal, shutting down");
                        token.cancel();
                    }
                }
                _ = token.cancelled() => {}
            }
        });
    }

    Ok(token)
}
