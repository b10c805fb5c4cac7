use {super::*, tokio::signal::ctrl_c};

/// Returns a token cancelled on the first Ctrl-C or SIGTERM.
pub(crate) fn setup_signal_handler() -> CancellationToken {
    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();

    tokio::spawn(async move {
        match shutdown_signal().await {
            Ok(signal) => info!("Received shutdown signal ({signal})"),
            Err(err) => error!("Failed to listen for shutdown signals: {err}"),
        }

        cancel_clone.cancel();
    });

    cancel
}

#[cfg(unix)]
async fn shutdown_signal() -> io::Result<&'static str> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::select! {
        result = ctrl_c() => result.map(|()| "Ctrl-C / SIGINT"),
        _ = sigterm.recv() => Ok("SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> io::Result<&'static str> {
    ctrl_c().await.map(|()| "Ctrl-C")
}
