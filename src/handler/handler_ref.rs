//! Counted indirection between a handler and its deferred wake-ups.
//!
//! A wait task fires on a timer thread and must not touch a handler that
//! already reached its terminal state. The cell holds a weak handle; the
//! handler invalidates it when it completes, and a stale upgrade fails
//! anyway once the owning reference is gone. Cloning the surrounding `Arc`
//! is the counted reference each pending task holds.

use std::{
    sync::{Arc, Mutex, Weak},
    time::Instant,
};

use super::RequestHandler;
use crate::postmaster::SharedHandler;

/// Shared cell through which deferred tasks reach their handler.
#[derive(Default)]
pub struct HandlerRef {
    cell: Mutex<Option<Weak<Mutex<RequestHandler>>>>,
}

impl HandlerRef {
    /// An unbound cell; [`bind`](Self::bind) attaches the handler once it
    /// is wrapped for sharing.
    #[must_use]
    pub fn new() -> Arc<Self> { Arc::new(Self::default()) }

    /// Attach the live handler.
    pub fn bind(&self, handler: &Arc<Mutex<RequestHandler>>) {
        *self.cell.lock().expect("handler ref poisoned") = Some(Arc::downgrade(handler));
    }

    /// Detach the handler; subsequent wake-ups become no-ops.
    pub fn invalidate(&self) {
        self.cell.lock().expect("handler ref poisoned").take();
    }

    /// The shared handle the connection layer dispatches through, if the
    /// handler is still live.
    #[must_use]
    pub fn shared_handler(&self) -> Option<SharedHandler> {
        let cell = self.cell.lock().expect("handler ref poisoned");
        cell.as_ref()
            .and_then(Weak::upgrade)
            .map(|handler| -> SharedHandler { handler })
    }

    /// Deliver a wait wake-up to the handler, if it is still live.
    ///
    /// The handler lock is taken only after the cell lock is released, so
    /// a handler invalidating the cell from inside one of its own methods
    /// cannot deadlock with a concurrently firing task.
    pub fn wait_done(&self, now: Instant) -> bool {
        let upgraded = {
            let cell = self.cell.lock().expect("handler ref poisoned");
            cell.as_ref().and_then(Weak::upgrade)
        };
        match upgraded {
            Some(handler) => {
                handler.lock().expect("handler poisoned").wait_done(now);
                true
            }
            None => false,
        }
    }
}
