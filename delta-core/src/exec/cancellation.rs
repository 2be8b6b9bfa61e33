//! Cancellation scope tied to user interrupts.
//!
//! Long operations (downloads, validation suites, container builds, shell
//! subprocesses) read the scoped token and stop cooperatively; timeouts are
//! handled separately by each operation.

use std::future::Future;

use tokio::task_local;
use tokio_util::sync::CancellationToken;

task_local! {
    static ACTIVE_CANCELLATION: CancellationToken;
}

/// Run `fut` with `token` visible to every operation inside it.
pub async fn with_cancellation<F, T>(token: CancellationToken, fut: F) -> T
where
    F: Future<Output = T>,
{
    ACTIVE_CANCELLATION.scope(token, fut).await
}

/// The currently scoped token, if any.
pub fn current_cancellation() -> Option<CancellationToken> {
    ACTIVE_CANCELLATION.try_with(|token| token.clone()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scoped_token_is_visible_and_cleared() {
        assert!(current_cancellation().is_none());
        let token = CancellationToken::new();
        with_cancellation(token.clone(), async move {
            let current = current_cancellation().expect("token should be scoped");
            assert!(!current.is_cancelled());
            token.cancel();
            assert!(current.is_cancelled());
        })
        .await;
        assert!(current_cancellation().is_none());
    }
}
