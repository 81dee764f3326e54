/// Fire-and-forget sink for persistence failures and unrecoverable
/// corruption. The stores report; they never wait on or retry the sink.
pub trait ErrorReporter: Send + Sync {
    fn capture_error(&self, error: &eyre::Report);
    fn capture_message(&self, message: &str);
}

/// Default reporter: structured log events only.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingReporter;

impl ErrorReporter for TracingReporter {
    fn capture_error(&self, error: &eyre::Report) {
        tracing::error!(error = %error, "storage error captured");
    }

    fn capture_message(&self, message: &str) {
        tracing::error!("{message}");
    }
}
