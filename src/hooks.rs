//! Handler registry with per-handler failure isolation.
//!
//! Components register handlers; dispatch calls every handler in registration
//! order. A handler that returns an error or panics is logged and skipped, and
//! the remaining handlers still run.

use anyhow::Result;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};

type Handler<E> = Arc<dyn Fn(&E) -> Result<()> + Send + Sync>;

/// Counts from one dispatch round.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub succeeded: usize,
    pub failed: usize,
}

pub struct HandlerSet<E> {
    label: &'static str,
    handlers: RwLock<Vec<(String, Handler<E>)>>,
}

impl<E> HandlerSet<E> {
    /// `label` names the event kind in log lines (e.g. "motion").
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            handlers: RwLock::new(Vec::new()),
        }
    }

    pub fn register<F>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(&E) -> Result<()> + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((name.into(), Arc::new(handler)));
    }

    pub fn len(&self) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dispatch(&self, event: &E) -> DispatchReport {
        // Snapshot so handlers may register more handlers without deadlocking.
        let handlers: Vec<(String, Handler<E>)> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let mut report = DispatchReport::default();
        for (name, handler) in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(Ok(())) => report.succeeded += 1,
                Ok(Err(err)) => {
                    report.failed += 1;
                    log::error!("{} handler '{}' failed: {:#}", self.label, name, err);
                }
                Err(_) => {
                    report.failed += 1;
                    log::error!("{} handler '{}' panicked", self.label, name);
                }
            }
        }
        report
    }
}
