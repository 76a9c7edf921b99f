//! Cancellation signal for the executor.
//!
//! Ctrl-C flips a shared flag. The executor checks it before starting each
//! entry; in-flight provider calls run to completion.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

#[derive(Clone, Debug)]
pub struct InterruptState {
    interrupted: Arc<AtomicBool>,
}

impl InterruptState {
    pub fn new() -> Self {
        Self {
            interrupted: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn set_interrupted(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }
}

impl Default for InterruptState {
    fn default() -> Self {
        Self::new()
    }
}

pub fn set_up_process_interrupt_handler() -> InterruptState {
    let interrupt_state = InterruptState::new();
    let for_handler = interrupt_state.clone();
    ctrlc::set_handler(move || {
        for_handler.set_interrupted();
    })
    .expect("Error setting interrupt handler");
    interrupt_state
}
