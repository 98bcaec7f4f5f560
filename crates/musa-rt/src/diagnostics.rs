//! Process-wide error channel for failures that have no caller to return to.
//!
//! Device-side failures reported from host callbacks, failed event insertion and
//! failed timing queries end up here. Backends hold an [`ErrorSink`] handle so
//! tests can observe an isolated channel while production code shares the
//! global one.

use std::sync::{Arc, Mutex, OnceLock};

use crate::error::RuntimeError;

#[derive(Debug, Default)]
pub struct ErrorSink {
    errors: Mutex<Vec<RuntimeError>>,
}

impl ErrorSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn global() -> Arc<ErrorSink> {
        static GLOBAL: OnceLock<Arc<ErrorSink>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(ErrorSink::new())))
    }

    pub fn register(&self, err: RuntimeError) {
        log::error!("{err}");
        self.errors.lock().expect("error sink poisoned").push(err);
    }

    pub fn take(&self) -> Vec<RuntimeError> {
        std::mem::take(&mut *self.errors.lock().expect("error sink poisoned"))
    }

    pub fn len(&self) -> usize {
        self.errors.lock().expect("error sink poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub fn register_error(err: RuntimeError) {
    ErrorSink::global().register(err);
}

pub fn take_registered_errors() -> Vec<RuntimeError> {
    ErrorSink::global().take()
}

pub fn registered_error_count() -> usize {
    ErrorSink::global().len()
}
