use std::future::Future;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, trace};

fn log_result(result: crate::Result<()>) {
    match result {
        Ok(()) => trace!("finished"),
        Err(e) if e.is_bug() => error!("finished with error: {e:#}"),
        Err(e) => debug!("finished with error: {e:#}"),
    }
}

/// Spawn a task inside the span, logging how it ended.
pub(crate) fn spawn<F>(span: tracing::Span, fut: F) -> JoinHandle<()>
where
    F: Future<Output = crate::Result<()>> + Send + 'static,
{
    tokio::spawn(async move { log_result(fut.await) }.instrument(span))
}

/// Same as [`spawn`], but the task is dropped as soon as the token is cancelled.
pub(crate) fn spawn_with_cancel<F>(
    span: tracing::Span,
    cancellation_token: CancellationToken,
    fut: F,
) -> JoinHandle<()>
where
    F: Future<Output = crate::Result<()>> + Send + 'static,
{
    spawn(span, async move {
        tokio::select! {
            _ = cancellation_token.cancelled() => {
                trace!("cancelled");
                Ok(())
            }
            r = fut => r,
        }
    })
}
