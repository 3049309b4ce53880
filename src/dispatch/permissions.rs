//! Permission request dispatch.
//!
//! The engine asks before running shell commands, writing files, fetching
//! URLs and so on. The session's [`PermissionHandler`] decides. A request is
//! always answered: with no handler, or when the handler fails or panics, the
//! decision is a denial.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use super::tools::HandlerError;
use crate::protocol::{PermissionRequest, PermissionRequestResult};

/// Context handed to a permission handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionInvocation {
    pub session_id: String,
}

/// Boxed future returned by a [`PermissionHandler`].
pub type PermissionFuture =
    Pin<Box<dyn Future<Output = Result<PermissionRequestResult, HandlerError>> + Send>>;

/// Async permission decision callback.
pub type PermissionHandler =
    Arc<dyn Fn(PermissionRequest, PermissionInvocation) -> PermissionFuture + Send + Sync>;

/// Wrap an async closure as a [`PermissionHandler`].
pub fn permission_handler<F, Fut, E>(f: F) -> PermissionHandler
where
    F: Fn(PermissionRequest, PermissionInvocation) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<PermissionRequestResult, E>> + Send + 'static,
    E: Into<HandlerError>,
{
    Arc::new(
        move |request: PermissionRequest, invocation: PermissionInvocation| -> PermissionFuture {
            let fut = f(request, invocation);
            Box::pin(async move {
                let outcome: Result<PermissionRequestResult, HandlerError> = match fut.await {
                    Ok(decision) => Ok(decision),
                    Err(err) => Err(err.into()),
                };
                outcome
            })
        },
    )
}

/// A handler that approves every request.
pub fn approve_all() -> PermissionHandler {
    permission_handler(|_request, _invocation| async {
        Ok::<_, HandlerError>(PermissionRequestResult::approved())
    })
}

/// Decide one permission request.
pub async fn decide_permission(
    handler: Option<PermissionHandler>,
    request: PermissionRequest,
    invocation: PermissionInvocation,
) -> PermissionRequestResult {
    let Some(handler) = handler else {
        log::info!(
            "Permission: no handler for session {}; denying '{}'",
            invocation.session_id,
            request.kind
        );
        return PermissionRequestResult::denied_by_default();
    };

    let kind = request.kind.clone();
    let session_id = invocation.session_id.clone();
    match tokio::spawn(handler(request, invocation)).await {
        Ok(Ok(decision)) => {
            log::debug!("Permission: '{kind}' in session {session_id} -> {}", decision.kind);
            decision
        }
        Ok(Err(err)) => {
            log::warn!("Permission: handler failed for '{kind}' in session {session_id}: {err}");
            PermissionRequestResult::denied_by_default()
        }
        Err(join_err) => {
            log::error!("Permission: handler panicked for '{kind}' in session {session_id}: {join_err}");
            PermissionRequestResult::denied_by_default()
        }
    }
}
