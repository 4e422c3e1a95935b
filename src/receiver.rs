//! Byte received interrupt layer.
//!
//! The interrupt handler and the main cycle share exactly one value, the
//! [`FrameSignal`]. The handler fires once per transaction: it looks at the
//! address byte, raises the signal and masks itself, so the remaining bytes
//! of the frame are pulled synchronously by the main cycle.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameState {
    Idle = 0,
    FramePending = 1,
    AddressMismatch = 2,
}

impl From<u8> for FrameState {
    fn from(val: u8) -> Self {
        match val {
            1 => FrameState::FramePending,
            2 => FrameState::AddressMismatch,
            _ => FrameState::Idle,
        }
    }
}

/// Tri-state flag written by the interrupt handler and cleared by the main cycle.
#[derive(Debug, Default)]
pub struct FrameSignal(AtomicU8);

impl FrameSignal {
    pub const fn new() -> Self {
        Self(AtomicU8::new(FrameState::Idle as u8))
    }

    pub fn load(&self) -> FrameState {
        FrameState::from(self.0.load(Ordering::Acquire))
    }

    fn store(&self, state: FrameState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

#[derive(Debug)]
pub struct FrameReceiver {
    slave_address: u8,
    signal: FrameSignal,
    interrupt_enabled: AtomicBool,
}

impl FrameReceiver {
    pub const fn new(slave_address: u8) -> Self {
        Self {
            slave_address,
            signal: FrameSignal::new(),
            interrupt_enabled: AtomicBool::new(false),
        }
    }

    pub fn slave_address(&self) -> u8 {
        self.slave_address
    }

    pub fn state(&self) -> FrameState {
        self.signal.load()
    }

    pub fn interrupt_enabled(&self) -> bool {
        self.interrupt_enabled.load(Ordering::Acquire)
    }

    /// Called by [`crate::hal::BmsHal::set_receive_interrupt`] implementations.
    pub fn set_interrupt_enabled(&self, enable: bool) {
        self.interrupt_enabled.store(enable, Ordering::Release);
    }

    /// Receive interrupt handler. Returns `None` without touching any state
    /// when the interrupt is masked, the byte then stays with the main cycle.
    pub fn on_byte_received(&self, byte: u8) -> Option<FrameState> {
        if !self.interrupt_enabled() {
            return None;
        }
        let state = if byte == self.slave_address {
            FrameState::FramePending
        } else {
            FrameState::AddressMismatch
        };
        self.set_interrupt_enabled(false);
        self.signal.store(state);
        Some(state)
    }

    /// Main cycle side, only after the pending state has been serviced.
    pub(crate) fn clear(&self) {
        self.signal.store(FrameState::Idle);
    }
}
