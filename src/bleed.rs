//! Supply-line bleed: periodic dip-and-restore blips.
//!
//! At `rate` blips per hour the scheduler checks the panel. When the
//! regulator is operating in pressurize mode it dispatches an independent
//! blip task that writes `setpoint - dip`, waits the dwell time and writes
//! the setpoint back. Blips never block the schedule. At most
//! `max_in_flight` run at once; a tick that finds the pool full is skipped.

use crate::capabilities::SetpointWriter;
use crate::config::BleedConfig;
use crate::error::{ControlError, ControlResult};
use crate::panel::PanelState;
use ereg_driver::{ERegError, ERegResult};
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Accepted blip rates, in blips per hour.
pub const RATE_RANGE: RangeInclusive<u32> = 1..=60;

const MS_PER_HOUR: u64 = 3_600_000;

/// Time between blips for `rate` blips per hour.
pub fn blip_interval(rate: u32) -> ControlResult<Duration> {
    if !RATE_RANGE.contains(&rate) {
        return Err(ControlError::Validation(format!(
            "Invalid bleed rate: {} blips/hour. Must be between {} and {}.",
            rate,
            RATE_RANGE.start(),
            RATE_RANGE.end()
        )));
    }
    Ok(Duration::from_millis(MS_PER_HOUR / u64::from(rate)))
}

/// One dip-and-restore, in mBar.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlipRequest {
    /// Pressure written first
    pub dip_mbar: f64,
    /// Pressure written after the dwell
    pub restore_mbar: f64,
}

impl BlipRequest {
    /// Dip `depth` below `setpoint`, never below 0.
    pub fn new(setpoint_mbar: f64, depth_mbar: i32) -> Self {
        Self {
            dip_mbar: (setpoint_mbar - f64::from(depth_mbar)).max(0.0),
            restore_mbar: setpoint_mbar,
        }
    }
}

/// Execute one blip.
pub async fn run_blip<W>(writer: &W, request: BlipRequest, dwell: Duration) -> ERegResult<()>
where
    W: SetpointWriter + ?Sized,
{
    writer.write_setpoint_mbar(request.dip_mbar).await?;
    tokio::time::sleep(dwell).await;
    writer.write_setpoint_mbar(request.restore_mbar).await
}

/// Reported by the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub enum BleedEvent {
    /// A blip completed.
    Blipped(BlipRequest),
    /// A blip's write failed.
    BlipFailed(ERegError),
}

type Reporter = Arc<dyn Fn(BleedEvent) + Send + Sync>;

struct Schedule {
    rate: u32,
    shutdown_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Owns the blip timer.
pub struct BleedScheduler<W: ?Sized> {
    writer: Arc<W>,
    config: BleedConfig,
    panel: watch::Receiver<PanelState>,
    pool: Arc<Semaphore>,
    schedule: Option<Schedule>,
}

impl<W: SetpointWriter + ?Sized + 'static> BleedScheduler<W> {
    /// Scheduler gated on `panel`.
    pub fn new(writer: Arc<W>, config: BleedConfig, panel: watch::Receiver<PanelState>) -> Self {
        let permits = config.max_in_flight.max(1);
        Self {
            writer,
            config,
            panel,
            pool: Arc::new(Semaphore::new(permits)),
            schedule: None,
        }
    }

    /// Rate of the running schedule.
    pub fn rate(&self) -> Option<u32> {
        self.schedule
            .as_ref()
            .filter(|s| !s.task.is_finished())
            .map(|s| s.rate)
    }

    /// Whether a schedule is running.
    pub fn is_running(&self) -> bool {
        self.rate().is_some()
    }

    /// Start blipping at `rate` per hour, replacing any running schedule.
    /// The first blip fires one interval from now.
    pub async fn start<F>(&mut self, rate: u32, report: F) -> ControlResult<Duration>
    where
        F: Fn(BleedEvent) + Send + Sync + 'static,
    {
        let period = blip_interval(rate)?;
        if let Some(previous) = self.schedule.take() {
            tracing::info!("Replacing bleed schedule ({} blips/hour)", previous.rate);
            stop_schedule(previous).await;
        }

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let writer = Arc::clone(&self.writer);
        let pool = Arc::clone(&self.pool);
        let panel = self.panel.clone();
        let depth = self.config.dip_mbar;
        let dwell = Duration::from_millis(self.config.dwell_ms);
        let report: Reporter = Arc::new(report);

        let task = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let snapshot = *panel.borrow();
                        if !snapshot.is_pressurizing() {
                            tracing::debug!("Bleed tick skipped: not pressurizing");
                            continue;
                        }
                        let permit = match Arc::clone(&pool).try_acquire_owned() {
                            Ok(permit) => permit,
                            Err(_) => {
                                tracing::warn!("Bleed tick skipped: previous blips still running");
                                continue;
                            }
                        };

                        let request = BlipRequest::new(snapshot.setpoint_mbar, depth);
                        let writer = Arc::clone(&writer);
                        let report = Arc::clone(&report);
                        tokio::spawn(async move {
                            let _permit = permit;
                            tracing::debug!(
                                "Blip {} -> {} mBar",
                                request.dip_mbar,
                                request.restore_mbar
                            );
                            match run_blip(writer.as_ref(), request, dwell).await {
                                Ok(()) => report(BleedEvent::Blipped(request)),
                                Err(e) => {
                                    tracing::error!("Blip failed: {}", e);
                                    report(BleedEvent::BlipFailed(e));
                                }
                            }
                        });
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        tracing::info!(
            "Bleed started: {} blips/hour (every {} s)",
            rate,
            period.as_secs_f64()
        );
        self.schedule = Some(Schedule {
            rate,
            shutdown_tx,
            task,
        });
        Ok(period)
    }

    /// Stop the schedule and wait for blips in flight. Returns whether a
    /// schedule was running.
    pub async fn stop(&mut self) -> bool {
        let Some(schedule) = self.schedule.take() else {
            return false;
        };
        stop_schedule(schedule).await;

        let permits = u32::try_from(self.config.max_in_flight.max(1)).unwrap_or(u32::MAX);
        match self.pool.acquire_many(permits).await {
            Ok(all) => drop(all),
            Err(e) => tracing::warn!("Bleed pool closed: {}", e),
        }
        tracing::info!("Bleed stopped");
        true
    }
}

async fn stop_schedule(schedule: Schedule) {
    let _ = schedule.shutdown_tx.send(());
    if let Err(e) = schedule.task.await {
        tracing::warn!("Bleed task ended abnormally: {}", e);
    }
}
