//! Unhandled promise rejections
//!
//! Fed by the engine's rejection tracker, drained after every job drain.
//! Entries are keyed by promise identity: a "became handled" event removes
//! the entry of that promise, not whichever entry is oldest.

use crate::bridge::Bridge;
use crate::exception;
use crate::registry::{Handle, handle_of};
use crate::JsError;
use rquickjs::{Ctx, Persistent, Runtime, Value};
use std::collections::VecDeque;
use std::rc::{Rc, Weak};

pub(crate) struct Rejection {
    promise: Handle,
    // retained so the key cannot be reused while queued
    _promise_ref: Persistent<Value<'static>>,
    reason: Persistent<Value<'static>>,
}

#[derive(Default)]
pub(crate) struct RejectionQueue {
    pending: VecDeque<Rejection>,
}

impl RejectionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push<'js>(&mut self, ctx: &Ctx<'js>, promise: Value<'js>, reason: Value<'js>) {
        let handle = handle_of(&promise);
        self.pending.push_back(Rejection {
            promise: handle,
            _promise_ref: Persistent::save(ctx, promise),
            reason: Persistent::save(ctx, reason),
        });
    }

    /// Remove the entry of a promise that gained a handler
    #[must_use]
    pub fn handled(&mut self, promise: Handle) -> Option<Rejection> {
        let index = self.pending.iter().position(|r| r.promise == promise)?;
        self.pending.remove(index)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn drain(&mut self) -> Vec<Rejection> {
        self.pending.drain(..).collect()
    }
}

/// Hook the rejection tracker of `runtime` up to `bridge`
pub(crate) fn install_tracker(runtime: &Runtime, bridge: &Rc<Bridge>) {
    let bridge = Rc::downgrade(bridge);
    let tracker: Box<dyn for<'js> Fn(Ctx<'js>, Value<'js>, Value<'js>, bool)> =
        Box::new(move |ctx, promise, reason, is_handled| {
            track(&bridge, ctx, promise, reason, is_handled);
        });
    runtime.set_host_promise_rejection_tracker(Some(tracker));
}

fn track<'js>(bridge: &Weak<Bridge>, ctx: Ctx<'js>, promise: Value<'js>, reason: Value<'js>, is_handled: bool) {
    let Some(bridge) = bridge.upgrade().filter(|b| b.is_alive()) else {
        return;
    };
    if !promise.is_object() {
        return;
    }

    if is_handled {
        let entry = bridge.rejections.borrow_mut().handled(handle_of(&promise));
        if entry.is_some() {
            tracing::debug!("rejected promise gained a handler");
        }
        drop(entry);
    } else {
        tracing::debug!("tracking unhandled promise rejection");
        bridge.rejections.borrow_mut().push(&ctx, promise, reason);
    }
}

/// Raise every queued rejection as one aggregate error, emptying the queue
pub(crate) fn raise_unhandled<'js>(ctx: &Ctx<'js>, bridge: &Bridge) -> Result<(), JsError> {
    let pending = bridge.rejections.borrow_mut().drain();
    if pending.is_empty() {
        return Ok(());
    }

    let mut message = String::new();
    for rejection in pending {
        let reason = rejection.reason.restore(ctx)?;
        message.push_str(&exception::describe(ctx, &reason).to_string());
        message.push('\n');
    }
    tracing::warn!("unhandled promise rejection: {}", message.trim_end());
    Err(JsError::UnhandledRejection(message))
}
