//! Write scope guard.
//!
//! # Responsibility
//! - Open a write window on construction and close it exactly once.
//! - On close: commit if the scope is still open, then always end it.
//!
//! # Invariants
//! - `close`, `close_async`, `cancel` and `Drop` are mutually exclusive;
//!   whichever runs first marks the scope finished.
//! - `Drop` never panics; commit failures there are logged.

use super::{ContextResult, PersistenceContext};
use crate::model::Entity;
use crate::registry::ScopeId;
use log::{error, warn};

/// One logical transaction boundary held by the caller.
///
/// Nested scopes over the same session share one flat transaction:
/// only the outermost scope's close saves anything.
pub struct WriteScope<'ctx, T: Entity> {
    context: &'ctx PersistenceContext<T>,
    id: ScopeId,
    is_async: bool,
    finished: bool,
}

impl<'ctx, T: Entity> WriteScope<'ctx, T> {
    pub(crate) fn open(context: &'ctx PersistenceContext<T>, is_async: bool) -> Self {
        let id = ScopeId::next();
        context.begin_write(id);
        Self {
            context,
            id,
            is_async,
            finished: false,
        }
    }

    pub fn id(&self) -> ScopeId {
        self.id
    }

    pub fn is_async(&self) -> bool {
        self.is_async
    }

    pub fn context(&self) -> &'ctx PersistenceContext<T> {
        self.context
    }

    /// Closes the scope, committing when it is the outermost one.
    pub fn close(mut self) -> ContextResult<()> {
        self.finished = true;
        self.context.release(self.id)
    }

    /// Closes the scope on the blocking pool.
    ///
    /// The scope is ended even if the returned future is dropped early.
    pub async fn close_async(mut self) -> ContextResult<()> {
        self.finished = true;
        self.context.release_async(self.id).await
    }

    /// Discards every pending change on the session, for all open scopes.
    pub fn cancel(mut self) {
        self.finished = true;
        self.context.cancel_write();
    }
}

impl<T: Entity> Drop for WriteScope<'_, T> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        if self.is_async {
            warn!(
                "event=write_scope_drop module=context context={} scope={} reason=async_scope_not_awaited",
                self.context.id(),
                self.id
            );
        }
        if let Err(err) = self.context.release(self.id) {
            error!(
                "event=write_scope_drop module=context status=error context={} scope={} error={}",
                self.context.id(),
                self.id,
                err
            );
        }
    }
}
