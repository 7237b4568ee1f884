// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Timer bookkeeping shared by the backends, plus a CPU timer.

use crate::error::{Error, Result};
use crate::graphics::GpuTimer;
use std::cell::Cell;
use std::time::{Duration, Instant};

/// Frames a GPU timer result is allowed to lag behind submission.
pub const GPU_TIMER_LATENCY: usize = 2;

/// Validity of a timer's latest sample.
///
/// A sample becomes valid when `stop` is called and stays valid until a query consumes it.
#[derive(Debug, Default)]
pub struct SampleState {
    valid: Cell<bool>,
}

impl SampleState {
    pub fn begin(&self) -> Result<()> {
        if self.valid.get() {
            return Err(Error::TimerAlreadyStarted);
        }
        Ok(())
    }

    pub fn end(&self) {
        self.valid.set(true);
    }

    pub fn is_valid(&self) -> bool {
        self.valid.get()
    }

    /// Reads the sample with `fetch`. Returns 0 while no sample is available.
    ///
    /// `fetch` returning `None` means the data is not ready. A resetting read drops the
    /// sample either way, so the timer can always be restarted after it.
    pub fn read(&self, reset: bool, fetch: impl FnOnce() -> Option<u64>) -> u64 {
        if !self.valid.get() {
            return 0;
        }
        let value = fetch().unwrap_or(0);
        if reset {
            self.valid.set(false);
        }
        value
    }
}

/// Wall-clock timer for work done on the CPU.
#[derive(Debug, Default)]
pub struct CpuTimer {
    started: Cell<Option<Instant>>,
    elapsed: Cell<Duration>,
    state: SampleState,
}

impl CpuTimer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl GpuTimer for CpuTimer {
    fn start(&self) -> Result<()> {
        self.state.begin()?;
        self.started.set(Some(Instant::now()));
        Ok(())
    }

    fn stop(&self) {
        if let Some(started) = self.started.take() {
            self.elapsed.set(started.elapsed());
            self.state.end();
        }
    }

    fn query(&self, reset: bool) -> u64 {
        self.state
            .read(reset, || Some(self.elapsed.get().as_micros() as u64))
    }
}

/// One timer per in-flight frame, so results can be read a couple of frames late
/// without stalling the GPU.
#[derive(Debug)]
pub struct TimerRing<T> {
    timers: Vec<T>,
}

impl<T: GpuTimer> TimerRing<T> {
    pub fn new(mut create: impl FnMut() -> Result<T>) -> Result<Self> {
        let timers = (0..GPU_TIMER_LATENCY + 1)
            .map(|_| create())
            .collect::<Result<Vec<_>>>()?;
        Ok(TimerRing { timers })
    }

    /// Timer for `frame`. Its previous sample was recorded `len()` frames ago, so reading
    /// it before restarting never waits on the GPU.
    pub fn current(&self, frame: u64) -> &T {
        &self.timers[(frame % self.timers.len() as u64) as usize]
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }
}
