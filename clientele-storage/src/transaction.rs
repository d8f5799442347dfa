//! Scoped transaction helper.

use crate::repository::{ClientRepository, IdentityStore};
use clientele_core::ClienteleResult;
use futures_util::future::BoxFuture;

/// Run `work` inside a transaction on `store`.
///
/// Commits when `work` returns `Ok`, rolls back when it returns `Err`. If
/// `work` panics the transaction is dropped unfinished, which rolls it back.
/// A failed rollback is logged; the error from `work` is what the caller sees.
///
/// ```ignore
/// let rows = do_in_transaction(&*store, |repo| {
///     Box::pin(async move {
///         repo.upsert(&inputs).await?;
///         repo.find_by_filter(&filter, true).await
///     })
/// })
/// .await?;
/// ```
pub async fn do_in_transaction<T, F>(store: &dyn IdentityStore, work: F) -> ClienteleResult<T>
where
    T: Send,
    F: for<'tx> FnOnce(&'tx dyn ClientRepository) -> BoxFuture<'tx, ClienteleResult<T>> + Send,
{
    let tx = store.begin().await?;

    let outcome = work(tx.repository()).await;

    match outcome {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = tx.rollback().await {
                tracing::warn!(error = %rollback_err, "Rollback failed after transaction error");
            }
            Err(err)
        }
    }
}
