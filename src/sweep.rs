//! Stepped pressure sweep.
//!
//! A sweep walks the setpoint from a starting pressure in 1 mBar steps, one
//! step per tick, at `rate` steps per second. The numeric contract lives in
//! the pure [`SweepState`]; [`SweepHandle`] runs it on a timer against a
//! [`SetpointWriter`].
//!
//! Cancellation is cooperative: [`SweepHandle::stop`] clears a flag that the
//! task checks at the start of each tick, so a write already in flight
//! completes and the following tick reports `Finished`.

use crate::capabilities::SetpointWriter;
use crate::config::SweepConfig;
use crate::error::{ControlError, ControlResult};
use ereg_driver::ERegError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Direction of travel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SweepDirection {
    /// Pressure increases each step
    LowToHigh,
    /// Pressure decreases each step
    HighToLow,
}

impl SweepDirection {
    /// `"H2L"` or `"high-to-low"` (any case) is downward, anything else upward.
    pub fn parse(text: &str) -> Self {
        let text = text.trim();
        if text.eq_ignore_ascii_case("H2L") || text.eq_ignore_ascii_case("high-to-low") {
            SweepDirection::HighToLow
        } else {
            SweepDirection::LowToHigh
        }
    }

    /// `-1` for high-to-low, `+1` otherwise.
    pub fn sign(self) -> i32 {
        match self {
            SweepDirection::LowToHigh => 1,
            SweepDirection::HighToLow => -1,
        }
    }
}

impl fmt::Display for SweepDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SweepDirection::LowToHigh => write!(f, "L2H"),
            SweepDirection::HighToLow => write!(f, "H2L"),
        }
    }
}

/// Sweep request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepParams {
    /// First pressure written (mBar)
    pub start_mbar: i32,
    /// Number of 1 mBar steps
    pub span: i32,
    /// Steps per second (at least 1)
    pub rate: u32,
    /// Direction of travel
    pub direction: SweepDirection,
}

impl SweepParams {
    /// Build a request. A rate below 1 is raised to 1.
    pub fn new(start_mbar: i32, span: i32, rate: u32, direction: SweepDirection) -> Self {
        Self {
            start_mbar,
            span,
            rate: rate.max(1),
            direction,
        }
    }

    /// Time between steps: `1000 / rate` ms.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(u64::from((1000 / self.rate.max(1)).max(1)))
    }

    /// Pressure the sweep ends on.
    pub fn target_mbar(&self) -> i32 {
        self.start_mbar + self.direction.sign() * self.span
    }

    /// Check the request against the configured pressure range.
    pub fn validate(&self, limits: &SweepConfig) -> ControlResult<()> {
        let max = limits.max_pressure_mbar;
        if !(0..=max).contains(&self.start_mbar) {
            return Err(ControlError::Validation(format!(
                "Starting pressure {} mBar must be between 0 and {} mBar",
                self.start_mbar, max
            )));
        }
        if self.span < 1 {
            return Err(ControlError::Validation(format!(
                "Span {} mBar must be at least 1 mBar",
                self.span
            )));
        }

        let target = self.target_mbar();
        if target < 0 {
            return Err(ControlError::Validation(format!(
                "A span of {} mBar will attempt to set the gas line pressure below 0 mBar which is not allowed.",
                self.span
            )));
        }
        if target > max {
            return Err(ControlError::Validation(format!(
                "A span of {} mBar will attempt to set the gas line pressure above {} mBar which is not allowed.",
                self.span, max
            )));
        }
        if target < limits.low_pressure_warning_mbar {
            tracing::warn!(
                "A span of {} mBar will take the gas line pressure below {} mBar",
                self.span,
                limits.low_pressure_warning_mbar
            );
        }
        Ok(())
    }
}

/// What the next tick should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepStep {
    /// Write this pressure (mBar), then call [`SweepState::advance`].
    Write(i32),
    /// Stop ticking and report completion.
    Finish {
        /// Steps completed
        steps_taken: i32,
        /// Pressure after the last step (mBar)
        current_pressure: i32,
        /// Ended by a stop request or a failure
        cancelled: bool,
    },
}

/// Result of a successful extension request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extension {
    /// Total span after the extension
    pub span: i32,
    /// The request was truncated at the pressure boundary; further
    /// extension is refused.
    pub clamped: bool,
}

/// Numeric state of one sweep.
#[derive(Debug, Clone)]
pub struct SweepState {
    start: i32,
    current: i32,
    steps_taken: i32,
    target_steps: i32,
    sign: i32,
    max_pressure: i32,
    running: bool,
    cancelled: bool,
    finished: bool,
    extension_blocked: bool,
}

impl SweepState {
    /// Fresh state for `params`, bounded by `max_pressure` mBar.
    pub fn new(params: &SweepParams, max_pressure: i32) -> Self {
        Self {
            start: params.start_mbar,
            current: params.start_mbar,
            steps_taken: 0,
            target_steps: params.span,
            sign: params.direction.sign(),
            max_pressure,
            running: true,
            cancelled: false,
            finished: false,
            extension_blocked: false,
        }
    }

    /// Steps completed so far.
    pub fn steps_taken(&self) -> i32 {
        self.steps_taken
    }

    /// Steps the sweep will take in total.
    pub fn target_steps(&self) -> i32 {
        self.target_steps
    }

    /// Pressure the next step writes (mBar).
    pub fn current_pressure(&self) -> i32 {
        self.current
    }

    /// Whether the sweep has not finished yet.
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Whether extension has hit the pressure boundary.
    pub fn extension_blocked(&self) -> bool {
        self.extension_blocked
    }

    /// Decide the next tick's action.
    ///
    /// Returns [`SweepStep::Finish`] once the target is reached or after
    /// [`SweepState::cancel`]; the state is finished from then on.
    pub fn next_step(&mut self) -> SweepStep {
        if self.running && self.steps_taken < self.target_steps {
            return SweepStep::Write(self.current);
        }
        self.running = false;
        self.finished = true;
        SweepStep::Finish {
            steps_taken: self.steps_taken,
            current_pressure: self.current,
            cancelled: self.cancelled,
        }
    }

    /// Record a completed write. Returns `(steps_taken, current_pressure)`.
    pub fn advance(&mut self) -> (i32, i32) {
        self.current += self.sign;
        self.steps_taken += 1;
        (self.steps_taken, self.current)
    }

    /// Request an early finish; the next [`SweepState::next_step`] finishes.
    pub fn cancel(&mut self) {
        if self.running {
            self.running = false;
            self.cancelled = true;
        }
    }

    /// Add `delta` steps to the span, truncating at the pressure boundary.
    pub fn extend(&mut self, delta: i32) -> ControlResult<Extension> {
        if self.finished || !self.running {
            return Err(ControlError::Validation("No sweep is running".to_string()));
        }
        if delta < 1 {
            return Err(ControlError::Validation(format!(
                "Extension {} mBar must be at least 1 mBar",
                delta
            )));
        }
        if self.extension_blocked {
            return Err(ControlError::Validation(format!(
                "Sweep already extended to the {} mBar limit",
                self.boundary()
            )));
        }

        let max_span = (self.boundary() - self.start) * self.sign;
        let requested = self.target_steps.saturating_add(delta);
        let clamped = requested > max_span;
        self.target_steps = requested.min(max_span);
        if clamped {
            self.extension_blocked = true;
            tracing::warn!(
                "Sweep extension truncated at {} mBar (span {})",
                self.boundary(),
                self.target_steps
            );
        }
        Ok(Extension {
            span: self.target_steps,
            clamped,
        })
    }

    fn boundary(&self) -> i32 {
        if self.sign < 0 {
            0
        } else {
            self.max_pressure
        }
    }
}

/// Output of a running sweep.
#[derive(Debug, Clone, PartialEq)]
pub enum SweepEvent {
    /// The task started ticking.
    Started {
        /// Initial span
        target_steps: i32,
    },
    /// One step was written.
    Progress {
        /// Steps completed
        steps_taken: i32,
        /// Pressure after this step (mBar)
        current_pressure: i32,
    },
    /// A setpoint write failed. `Finished` follows.
    Failed(ERegError),
    /// The sweep ended. Sent exactly once.
    Finished {
        /// Steps completed
        steps_taken: i32,
        /// Pressure after the last step (mBar)
        current_pressure: i32,
        /// Ended by a stop request or a failure
        cancelled: bool,
    },
}

/// Handle to a running sweep task.
pub struct SweepHandle {
    params: SweepParams,
    state: Arc<Mutex<SweepState>>,
    running: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl SweepHandle {
    /// Spawn the sweep. The first step is written one interval after start.
    pub fn spawn<W, F>(writer: Arc<W>, params: SweepParams, max_pressure: i32, report: F) -> Self
    where
        W: SetpointWriter + ?Sized + 'static,
        F: Fn(SweepEvent) + Send + Sync + 'static,
    {
        let state = Arc::new(Mutex::new(SweepState::new(&params, max_pressure)));
        let running = Arc::new(AtomicBool::new(true));

        let task_state = Arc::clone(&state);
        let task_running = Arc::clone(&running);
        let period = params.interval();

        let task = tokio::spawn(async move {
            tracing::info!(
                "Sweep started: {} mBar, span {}, {} steps/s, {}",
                params.start_mbar,
                params.span,
                params.rate,
                params.direction
            );
            report(SweepEvent::Started {
                target_steps: params.span,
            });

            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;

                let step = {
                    let mut state = task_state.lock();
                    if !task_running.load(Ordering::Acquire) {
                        state.cancel();
                    }
                    state.next_step()
                };

                match step {
                    SweepStep::Write(mbar) => {
                        if let Err(e) = writer.write_setpoint_mbar(f64::from(mbar)).await {
                            tracing::error!("Sweep setpoint write failed at {} mBar: {}", mbar, e);
                            report(SweepEvent::Failed(e));
                            let mut state = task_state.lock();
                            state.cancel();
                            if let SweepStep::Finish {
                                steps_taken,
                                current_pressure,
                                cancelled,
                            } = state.next_step()
                            {
                                report(SweepEvent::Finished {
                                    steps_taken,
                                    current_pressure,
                                    cancelled,
                                });
                            }
                            break;
                        }
                        let (steps_taken, current_pressure) = task_state.lock().advance();
                        report(SweepEvent::Progress {
                            steps_taken,
                            current_pressure,
                        });
                    }
                    SweepStep::Finish {
                        steps_taken,
                        current_pressure,
                        cancelled,
                    } => {
                        tracing::info!(
                            "Sweep finished after {} steps at {} mBar{}",
                            steps_taken,
                            current_pressure,
                            if cancelled { " (stopped)" } else { "" }
                        );
                        report(SweepEvent::Finished {
                            steps_taken,
                            current_pressure,
                            cancelled,
                        });
                        break;
                    }
                }
            }
            task_running.store(false, Ordering::Release);
        });

        Self {
            params,
            state,
            running,
            task,
        }
    }

    /// Parameters the sweep was started with.
    pub fn params(&self) -> SweepParams {
        self.params
    }

    /// Whether the sweep is still ticking.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire) && !self.task.is_finished()
    }

    /// Ask the sweep to stop at its next tick. Safe to call repeatedly.
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            tracing::info!("Sweep stop requested");
        }
    }

    /// Extend the span of the running sweep.
    pub fn extend(&self, delta: i32) -> ControlResult<Extension> {
        if !self.running.load(Ordering::Acquire) {
            return Err(ControlError::Validation("No sweep is running".to_string()));
        }
        self.state.lock().extend(delta)
    }

    /// `(steps_taken, target_steps, current_pressure)` right now.
    pub fn progress(&self) -> (i32, i32, i32) {
        let state = self.state.lock();
        (state.steps_taken(), state.target_steps(), state.current_pressure())
    }

    /// Stop and wait for the task to report `Finished`.
    pub async fn cancel_and_join(self) {
        self.stop();
        self.join().await;
    }

    /// Wait for the task to exit.
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            tracing::warn!("Sweep task ended abnormally: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use ereg_driver::ERegResult;
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct RecordingWriter {
        writes: Mutex<Vec<f64>>,
        fail_at: Option<usize>,
    }

    #[async_trait]
    impl SetpointWriter for RecordingWriter {
        async fn write_setpoint_mbar(&self, mbar: f64) -> ERegResult<()> {
            let mut writes = self.writes.lock();
            if self.fail_at == Some(writes.len()) {
                return Err(ERegError::Connection("Connection closed by device".into()));
            }
            writes.push(mbar);
            Ok(())
        }
    }

    fn h2l(start: i32, span: i32, rate: u32) -> SweepParams {
        SweepParams::new(start, span, rate, SweepDirection::HighToLow)
    }

    fn collect(rx: &mut mpsc::UnboundedReceiver<SweepEvent>) -> Vec<SweepEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn finished_count(events: &[SweepEvent]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, SweepEvent::Finished { .. }))
            .count()
    }

    #[test]
    fn test_direction_parse() {
        assert_eq!(SweepDirection::parse("H2L"), SweepDirection::HighToLow);
        assert_eq!(SweepDirection::parse("high-to-low"), SweepDirection::HighToLow);
        assert_eq!(SweepDirection::parse("L2H"), SweepDirection::LowToHigh);
        assert_eq!(SweepDirection::parse("sideways"), SweepDirection::LowToHigh);
        assert_eq!(SweepDirection::HighToLow.sign(), -1);
    }

    #[test]
    fn test_interval_from_rate() {
        assert_eq!(h2l(1000, 400, 2).interval(), Duration::from_millis(500));
        assert_eq!(h2l(1000, 400, 3).interval(), Duration::from_millis(333));
        assert_eq!(h2l(1000, 400, 0).interval(), Duration::from_secs(1));
        assert_eq!(h2l(1000, 400, 5000).interval(), Duration::from_millis(1));
    }

    #[test]
    fn test_validate_bounds() {
        let limits = SweepConfig::default();
        assert!(h2l(1000, 400, 2).validate(&limits).is_ok());
        assert!(h2l(1000, 1001, 2).validate(&limits).is_err());
        assert!(h2l(1000, 0, 2).validate(&limits).is_err());
        assert!(h2l(4000, 10, 2).validate(&limits).is_err());
        let up = SweepParams::new(3000, 34, 2, SweepDirection::LowToHigh);
        assert!(up.validate(&limits).is_err());
        let up = SweepParams::new(3000, 33, 2, SweepDirection::LowToHigh);
        assert!(up.validate(&limits).is_ok());
    }

    #[test]
    fn test_state_runs_to_target() {
        let mut state = SweepState::new(&h2l(1000, 400, 2), 3033);
        let mut writes = Vec::new();
        while let SweepStep::Write(mbar) = state.next_step() {
            writes.push(mbar);
            state.advance();
        }
        assert_eq!(writes.len(), 400);
        assert_eq!(writes[0], 1000);
        assert_eq!(writes[399], 601);
        assert_eq!(state.steps_taken(), 400);
        assert_eq!(state.target_steps(), 400);
        assert_eq!(state.current_pressure(), 600);
        assert!(!state.is_running());
    }

    #[test]
    fn test_extend_then_clamp() {
        let mut state = SweepState::new(&h2l(1000, 400, 2), 3033);
        assert_eq!(
            state.extend(50).unwrap(),
            Extension {
                span: 450,
                clamped: false
            }
        );
        assert_eq!(
            state.extend(600).unwrap(),
            Extension {
                span: 1000,
                clamped: true
            }
        );
        assert!(state.extension_blocked());
        assert!(state.extend(1).is_err());
        assert_eq!(state.target_steps(), 1000);
    }

    #[test]
    fn test_extend_upward_clamps_at_max() {
        let params = SweepParams::new(3000, 20, 1, SweepDirection::LowToHigh);
        let mut state = SweepState::new(&params, 3033);
        state.next_step();
        state.advance();
        let ext = state.extend(50).unwrap();
        assert_eq!(ext, Extension { span: 33, clamped: true });
        assert_eq!(state.steps_taken(), 1);
    }

    #[test]
    fn test_extend_rejects_non_positive_and_finished() {
        let mut state = SweepState::new(&h2l(1000, 1, 1), 3033);
        assert!(state.extend(0).is_err());
        assert!(state.extend(-5).is_err());
        state.next_step();
        state.advance();
        assert!(matches!(state.next_step(), SweepStep::Finish { cancelled: false, .. }));
        assert!(state.extend(10).is_err());
    }

    #[test]
    fn test_cancel_finishes_on_next_step() {
        let mut state = SweepState::new(&h2l(1000, 400, 2), 3033);
        state.next_step();
        state.advance();
        state.cancel();
        assert_eq!(
            state.next_step(),
            SweepStep::Finish {
                steps_taken: 1,
                current_pressure: 999,
                cancelled: true
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_sweep_timing_and_single_finish() {
        let writer = Arc::new(RecordingWriter::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let started = Instant::now();
        let handle = SweepHandle::spawn(writer.clone(), h2l(1000, 400, 2), 3033, move |e| {
            let _ = tx.send(e);
        });
        handle.join().await;

        // 400 writes plus the tick that observes completion
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(500 * 401), "{:?}", elapsed);
        assert!(elapsed < Duration::from_millis(500 * 402), "{:?}", elapsed);

        let writes = writer.writes.lock().clone();
        assert_eq!(writes.len(), 400);
        assert_eq!(writes[0], 1000.0);
        assert_eq!(writes[399], 601.0);

        let events = collect(&mut rx);
        assert_eq!(events[0], SweepEvent::Started { target_steps: 400 });
        assert_eq!(finished_count(&events), 1);
        assert_eq!(
            events.last(),
            Some(&SweepEvent::Finished {
                steps_taken: 400,
                current_pressure: 600,
                cancelled: false
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_mid_run() {
        let writer = Arc::new(RecordingWriter::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = SweepHandle::spawn(writer.clone(), h2l(1000, 400, 2), 3033, move |e| {
            let _ = tx.send(e);
        });

        tokio::time::sleep(Duration::from_millis(500 * 10 + 100)).await;
        assert!(handle.is_running());
        handle.stop();
        handle.stop();
        handle.join().await;

        let events = collect(&mut rx);
        assert_eq!(finished_count(&events), 1);
        assert_eq!(
            events.last(),
            Some(&SweepEvent::Finished {
                steps_taken: 10,
                current_pressure: 990,
                cancelled: true
            })
        );
        assert_eq!(writer.writes.lock().len(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_live_extension_changes_length() {
        let writer = Arc::new(RecordingWriter::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = SweepHandle::spawn(writer.clone(), h2l(1000, 10, 10), 3033, move |e| {
            let _ = tx.send(e);
        });

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(handle.extend(5).unwrap().span, 15);
        handle.join().await;

        assert_eq!(writer.writes.lock().len(), 15);
        let events = collect(&mut rx);
        assert!(matches!(
            events.last(),
            Some(SweepEvent::Finished {
                steps_taken: 15,
                current_pressure: 985,
                cancelled: false
            })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_failure_reports_then_finishes() {
        let writer = Arc::new(RecordingWriter {
            fail_at: Some(3),
            ..Default::default()
        });
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = SweepHandle::spawn(writer.clone(), h2l(1000, 400, 2), 3033, move |e| {
            let _ = tx.send(e);
        });
        handle.join().await;

        let events = collect(&mut rx);
        let n = events.len();
        assert!(matches!(events[n - 2], SweepEvent::Failed(ref e) if e.is_connection()));
        assert_eq!(
            events[n - 1],
            SweepEvent::Finished {
                steps_taken: 3,
                current_pressure: 997,
                cancelled: true
            }
        );
        assert_eq!(finished_count(&events), 1);
    }
}
