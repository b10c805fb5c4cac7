use {super::*, tracing_appender::non_blocking::WorkerGuard};

/// Installs the global subscriber. Output goes to stderr through a
/// background writer that flushes when the returned guard is dropped.
pub(crate) fn init() -> WorkerGuard {
    let (writer, guard) = non_blocking(io::stderr());

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(writer)
                .with_filter(EnvFilter::from_default_env()),
        )
        .init();

    guard
}
