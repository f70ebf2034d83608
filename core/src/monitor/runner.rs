//! Supervisor: the on/off switch around a `DispatchLoop` and the polling
//! run loop that drives it.
//!
//! Ticks never overlap. Between ticks the run loop sleeps, waking early only
//! to execute deferred steps as they fall due.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::info;

use crate::infrastructure::UiBackend;
use crate::monitor::cycle::{DispatchLoop, TickReport};
use crate::types::action::Action;

/// Time source for the run loop.
pub trait Clock {
    fn now_ms(&self) -> u64;
    fn sleep(&mut self, ms: u64);
}

/// Wall clock; `sleep` blocks the thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    fn sleep(&mut self, ms: u64) {
        std::thread::sleep(Duration::from_millis(ms));
    }
}

/// Clock that only moves when told to. `sleep` advances it.
#[derive(Debug, Clone, Copy, Default)]
pub struct ManualClock {
    now_ms: u64,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        ManualClock { now_ms: start_ms }
    }

    pub fn advance(&mut self, ms: u64) {
        self.now_ms += ms;
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now_ms
    }

    fn sleep(&mut self, ms: u64) {
        self.advance(ms);
    }
}

/// Totals from one `Supervisor::run`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub ticks: usize,
    /// Actions from ticks and deferred steps, in order.
    pub actions: Vec<Action>,
}

#[derive(Debug)]
pub struct Supervisor {
    engine: DispatchLoop,
    running: bool,
}

impl Supervisor {
    /// Wrap `engine`. The supervisor starts stopped.
    pub fn new(engine: DispatchLoop) -> Self {
        Supervisor {
            engine,
            running: false,
        }
    }

    pub fn start(&mut self) {
        if !self.running {
            self.running = true;
            info!("keepalive started");
        }
    }

    /// Stop and clear all engine state.
    pub fn stop(&mut self) {
        self.running = false;
        self.engine.reset();
        info!("keepalive stopped");
    }

    /// Flip the switch; returns the new running state.
    pub fn toggle(&mut self) -> bool {
        if self.running {
            self.stop();
        } else {
            self.start();
        }
        self.running
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn engine(&self) -> &DispatchLoop {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut DispatchLoop {
        &mut self.engine
    }

    /// One tick; `None` while stopped.
    pub fn tick<U: UiBackend>(&mut self, ui: &mut U, now_ms: u64) -> Option<TickReport> {
        if !self.running {
            return None;
        }
        Some(self.engine.tick(ui, now_ms))
    }

    pub fn pump_deferred<U: UiBackend>(&mut self, ui: &mut U, now_ms: u64) -> Vec<Action> {
        if !self.running {
            return Vec::new();
        }
        self.engine.pump_deferred(ui, now_ms)
    }

    /// Poll until stopped or `max_ticks` ticks have run. Deferred steps run
    /// between ticks as they fall due.
    pub fn run<U: UiBackend, C: Clock>(
        &mut self,
        ui: &mut U,
        clock: &mut C,
        max_ticks: Option<usize>,
    ) -> RunSummary {
        let mut summary = RunSummary::default();
        let interval = self.engine.settings().poll_interval_ms.max(1);

        while self.running && max_ticks.map_or(true, |max| summary.ticks < max) {
            let now = clock.now_ms();
            summary.actions.extend(self.pump_deferred(ui, now));
            if let Some(report) = self.tick(ui, now) {
                summary.ticks += 1;
                summary.actions.extend(report.action);
            }

            let next_tick = now + interval;
            loop {
                let now = clock.now_ms();
                if now >= next_tick {
                    break;
                }
                let wake = self
                    .engine
                    .deferred()
                    .next_due()
                    .map_or(next_tick, |due| due.clamp(now, next_tick));
                if wake > now {
                    clock.sleep(wake - now);
                }
                let now = clock.now_ms();
                if now >= next_tick {
                    break;
                }
                summary.actions.extend(self.pump_deferred(ui, now));
            }
        }
        summary
    }
}
