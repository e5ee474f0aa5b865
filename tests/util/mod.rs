// Not all functions are used by all tests.
#![allow(dead_code)]

use std::cell::Cell;
use std::rc::Rc;
use std::sync::Once;

pub fn init() {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        env_logger::try_init().expect("unable to initialise logger");
    })
}

/// Shared invocation counter for callback assertions.
#[derive(Clone, Default)]
pub struct Counter(Rc<Cell<usize>>);

impl Counter {
    pub fn new() -> Counter {
        Counter::default()
    }

    pub fn inc(&self) {
        self.0.set(self.0.get() + 1);
    }

    pub fn get(&self) -> usize {
        self.0.get()
    }
}

pub fn assert_send<T: Send>() {}
pub fn assert_sync<T: Sync>() {}
