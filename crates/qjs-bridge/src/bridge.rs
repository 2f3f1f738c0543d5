//! Per-context bridge state
//!
//! Owned by one [`JsContext`](crate::JsContext) and shared by reference
//! with scopes; engine-side closures only keep a `Weak` to it.

use crate::callback::CallbackTable;
use crate::console::Console;
use crate::context::LeakListener;
use crate::loader::LoaderBinding;
use crate::registry::{HandleRegistry, HoldTable};
use crate::rejection::RejectionQueue;
use crate::value::ContextId;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) struct Bridge {
    pub id: ContextId,
    pub registry: RefCell<HandleRegistry>,
    pub holds: RefCell<HoldTable>,
    pub callbacks: RefCell<CallbackTable>,
    pub rejections: RefCell<RejectionQueue>,
    pub loader: LoaderBinding,
    pub console: RefCell<Option<Rc<dyn Console>>>,
    pub leak_listener: RefCell<Option<Rc<dyn LeakListener>>>,
    alive: Cell<bool>,
}

impl Bridge {
    pub fn new() -> Rc<Self> {
        let id = ContextId(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed));
        Rc::new(Self {
            id,
            registry: RefCell::new(HandleRegistry::new()),
            holds: RefCell::new(HoldTable::new()),
            callbacks: RefCell::new(CallbackTable::default()),
            rejections: RefCell::new(RejectionQueue::new()),
            loader: LoaderBinding::default(),
            console: RefCell::new(None),
            leak_listener: RefCell::new(None),
            alive: Cell::new(true),
        })
    }

    pub fn is_alive(&self) -> bool {
        self.alive.get()
    }

    /// Release every engine reference the bridge holds.
    ///
    /// Must run before the engine context and runtime are freed. Engine
    /// finalizers that fire afterwards see a dead bridge and do nothing.
    pub fn shutdown(&self) {
        self.alive.set(false);

        let entries = self.registry.borrow_mut().drain();
        let holds = self.holds.borrow_mut().drain();
        let rejections = self.rejections.borrow_mut().drain();
        tracing::debug!(
            context = %self.id,
            handles = entries.len(),
            holds = holds.len(),
            rejections = rejections.len(),
            "releasing bridge references"
        );
        drop(entries);
        drop(holds);
        drop(rejections);

        let callbacks = self.callbacks.borrow_mut().clear();
        drop(callbacks);
        self.loader.clear();
    }
}
