use crate::{Error, Result};
use std::future::Future;
use tokio_util::sync::CancellationToken;

/// Races `fut` against `ctx`. Cancellation wins ties and drops the in-flight
/// future, which aborts the underlying request.
pub(crate) async fn cancellable<F, T>(ctx: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    if ctx.is_cancelled() {
        return Err(Error::Cancelled);
    }
    tokio::select! {
        biased;
        () = ctx.cancelled() => Err(Error::Cancelled),
        res = fut => res,
    }
}

/// Like [`cancellable`] but also gives up when the session behind the call
/// ends, reporting `SessionClosed`.
pub(crate) async fn session_bound<F, T>(
    ctx: &CancellationToken,
    done: &CancellationToken,
    fut: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    cancellable(ctx, async {
        tokio::select! {
            biased;
            () = done.cancelled() => Err(Error::SessionClosed),
            res = fut => res,
        }
    })
    .await
}
