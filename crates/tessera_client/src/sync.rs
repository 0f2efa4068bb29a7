//! The long-poll sync loop.
//!
//! One loop runs per client as an independent tokio task. Each iteration
//! issues a long-poll sync request with the last persisted cursor, applies
//! the response and persists the new cursor in a single storage transaction,
//! then immediately starts the next iteration (the long-poll itself paces
//! the loop). Failed iterations are reported through the sync error handler
//! and retried with bounded backoff; the loop only exits when stopped.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use serde_json::Value;
use tokio::task::JoinHandle;
use url::Url;

use tessera_storage::Storage;

use crate::client::SyncErrorHandler;
use crate::config::SyncOptions;
use crate::error::{ClientError, ClientResult, ResponseBody};
use crate::http::HttpClient;
use crate::request::{Method, Request};

/// Extra headroom on the HTTP timeout so the client never cuts off a
/// long-poll the server is still allowed to hold open.
const HTTP_TIMEOUT_GRACE: Duration = Duration::from_secs(10);

/// Everything one sync iteration needs, cloned out of the client so the
/// loop task does not borrow it.
pub(crate) struct SyncContext {
    pub(crate) user_id: String,
    pub(crate) device_id: String,
    pub(crate) access_token: String,
    pub(crate) homeserver: Url,
    pub(crate) storage: Arc<dyn Storage>,
    pub(crate) http: Arc<dyn HttpClient>,
    pub(crate) options: SyncOptions,
    pub(crate) handler: Arc<RwLock<Option<SyncErrorHandler>>>,
    pub(crate) running: Arc<AtomicBool>,
}

/// Handle to a running sync loop.
pub(crate) struct SyncTask {
    pub(crate) running: Arc<AtomicBool>,
    pub(crate) task: JoinHandle<()>,
}

/// Runs sync iterations until the running flag is cleared.
///
/// The flag is only observed at iteration boundaries: an iteration that has
/// already started completes (and applies its result) before the loop exits.
pub(crate) async fn run_sync_loop(ctx: SyncContext) {
    let mut failures: u32 = 0;

    while ctx.running.load(Ordering::SeqCst) {
        match sync_once(&ctx).await {
            Ok(cursor) => {
                failures = 0;
                tracing::debug!(%cursor, "sync iteration applied");
            }
            Err(err) => {
                failures = failures.saturating_add(1);
                tracing::warn!(error = %err, failures, "sync iteration failed");

                let handler = ctx.handler.read().clone();
                if let Some(handler) = handler {
                    handler(err);
                }

                let delay = ctx.options.retry.delay_for_attempt(failures);
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    tracing::debug!("sync loop stopped");
}

/// One iteration: long-poll with the persisted cursor, then apply and
/// persist atomically. Returns the new cursor.
async fn sync_once(ctx: &SyncContext) -> ClientResult<String> {
    let since = ctx.storage.next_batch(&ctx.device_id)?;

    let mut request = Request::new(Method::Get, &["_matrix", "client", "r0", "sync"])
        .with_access_token(ctx.access_token.as_str())
        .with_query("timeout", ctx.options.timeout.as_millis().to_string())
        .with_timeout(ctx.options.timeout + HTTP_TIMEOUT_GRACE);
    if let Some(since) = &since {
        request = request.with_query("since", since.as_str());
    }

    let response = request.perform(ctx.http.as_ref(), &ctx.homeserver).await?;
    apply_sync_response(
        ctx.storage.as_ref(),
        &ctx.user_id,
        &ctx.device_id,
        &response.body,
    )
}

/// Applies a sync response: membership changes for this user plus the new
/// cursor, in one transaction. Re-applying the same response is idempotent,
/// so a crash between apply and commit is safe to retry with the old cursor.
pub(crate) fn apply_sync_response(
    storage: &dyn Storage,
    user_id: &str,
    device_id: &str,
    body: &ResponseBody,
) -> ClientResult<String> {
    let next_batch = body
        .get("next_batch")
        .and_then(Value::as_str)
        .ok_or_else(|| {
            ClientError::MalformedResponse("sync response is missing next_batch".into())
        })?;

    let joined = membership_rooms(body, "join");
    let left = membership_rooms(body, "leave");

    storage.transaction(&mut |txn| {
        for room_id in &joined {
            txn.add_joined_room(room_id, user_id)?;
        }
        for room_id in &left {
            txn.remove_joined_room(room_id, user_id)?;
        }
        txn.set_next_batch(next_batch, device_id)?;
        Ok(true)
    })?;

    Ok(next_batch.to_string())
}

/// Room ids under `rooms.<section>` of a sync response.
fn membership_rooms(body: &ResponseBody, section: &str) -> Vec<String> {
    body.get("rooms")
        .and_then(Value::as_object)
        .and_then(|rooms| rooms.get(section))
        .and_then(Value::as_object)
        .map(|entries| entries.keys().cloned().collect())
        .unwrap_or_default()
}
