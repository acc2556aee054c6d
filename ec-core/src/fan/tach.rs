//! Tachometer capture shared between the capture interrupt and the fan task.
//!
//! Each channel has exactly one writer, its capture interrupt, and one
//! reader, the once-per-second fan tick. The only task-side write is
//! [`TachCapture::clear_period`], issued when the health check finds the fan
//! stopped; a capture racing with it simply restores a fresh period.

use portable_atomic::{AtomicBool, AtomicU16, AtomicU32, Ordering};

/// Capture state of one fan channel.
pub struct TachCapture {
    previous: AtomicU16,
    saw_first_edge: AtomicBool,
    period: AtomicU32,
    edges: AtomicU32,
}

impl TachCapture {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            previous: AtomicU16::new(0),
            saw_first_edge: AtomicBool::new(false),
            period: AtomicU32::new(0),
            edges: AtomicU32::new(0),
        }
    }

    /// Records a capture of the free-running counter, which wraps after
    /// `auto_reload`. Called from the capture interrupt.
    pub fn record_capture(&self, counter: u16, auto_reload: u16) {
        self.edges.fetch_add(1, Ordering::Relaxed);
        if !self.saw_first_edge.swap(true, Ordering::Relaxed) {
            self.previous.store(counter, Ordering::Relaxed);
            return;
        }

        let previous = self.previous.swap(counter, Ordering::Relaxed);
        let period = if counter > previous {
            u32::from(counter - previous)
        } else {
            u32::from(auto_reload) + u32::from(counter) + 1 - u32::from(previous)
        };
        self.period.store(period, Ordering::Relaxed);
    }

    /// The capture register was overwritten before it was read; the next edge
    /// starts a new measurement.
    pub fn record_overflow(&self) {
        self.saw_first_edge.store(false, Ordering::Relaxed);
    }

    /// Counter ticks between the last two edges, or zero when unknown.
    #[must_use]
    pub fn period(&self) -> u32 {
        self.period.load(Ordering::Relaxed)
    }

    /// Edges seen since boot, wrapping.
    #[must_use]
    pub fn edges(&self) -> u32 {
        self.edges.load(Ordering::Relaxed)
    }

    /// Forgets the last period so the fan reads as stopped.
    pub fn clear_period(&self) {
        self.period.store(0, Ordering::Relaxed);
    }
}

impl Default for TachCapture {
    fn default() -> Self {
        Self::new()
    }
}
