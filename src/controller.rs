//! Orchestration of the regulator and its workers.
//!
//! [`Controller`] owns one [`EReg`] client and every timer-driven worker that
//! talks through it:
//!
//! - **Polling** starts on connect and reports the median pressure of each
//!   batch.
//! - **Sweep** ramps the setpoint; at most one runs at a time.
//! - **Bleed** blips the setpoint while the panel is pressurizing.
//!
//! Workers report through one channel to a router task, which decides the
//! shutdown scope of each failure:
//!
//! | failure | effect |
//! |---|---|
//! | connection | polling stopped, sweep cancelled, bleed stopped, `ConnectionLost` once |
//! | any other error from polling | polling stopped, error surfaced |
//! | any other error from sweep/bleed | error surfaced, other workers unaffected |
//!
//! Reconnection is always an explicit [`Controller::connect`] call.
//!
//! # Example
//!
//! ```rust,ignore
//! let controller = Controller::new(Settings::load()?);
//! let mut events = controller.subscribe();
//! controller.connect_default().await?;
//! controller.set_setpoint_mbar(1000.0).await?;
//! controller.set_operate(true).await?;
//! controller.start_sweep(400, 2, SweepDirection::HighToLow).await?;
//! while let Ok(event) = events.recv().await {
//!     println!("{:?}", event);
//! }
//! ```

use crate::bleed::{BleedEvent, BleedScheduler};
use crate::capabilities::SetpointWriter;
use crate::config::Settings;
use crate::error::{ControlError, ControlResult};
use crate::history::SweepHistory;
use crate::panel::{OperateMode, PanelState};
use crate::polling::{PollEvent, PollingEngine, PollingHandle};
use crate::sweep::{Extension, SweepDirection, SweepEvent, SweepHandle, SweepParams};
use ereg_driver::{EReg, ERegError, ErrorKind};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

const EVENT_CAPACITY: usize = 1024;

/// Connection lifecycle as seen by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// No connection, or explicitly disconnected
    Disconnected,
    /// Connected and initialised
    Connected,
    /// A worker hit a connection error; waiting for an explicit reconnect
    Lost,
}

/// Events published to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum ControllerEvent {
    /// Connection opened and initialised
    Connected {
        /// `host:port`
        peer: String,
        /// Cached full-scale pressure (psi)
        calibration_psi: f64,
    },
    /// Connection closed on request
    Disconnected,
    /// Median pressure of a batch (psi)
    PressureUpdate(f64),
    /// A worker lost the connection
    ConnectionLost(String),
    /// Malformed response or other unexpected failure
    UnexpectedError(String),
    /// The regulator rejected a command
    DeviceRejected(String),
    /// A sweep started
    SweepStarted {
        /// Initial span in steps
        target_steps: i32,
    },
    /// A sweep step was written
    SweepProgress {
        /// Steps completed
        steps_taken: i32,
        /// Pressure after the step (mBar)
        current_pressure: i32,
    },
    /// A sweep ended
    SweepFinished {
        /// Steps completed
        steps_taken: i32,
        /// Final pressure (mBar)
        current_pressure: i32,
        /// Ended by a stop request, connection loss or failure
        cancelled: bool,
    },
    /// Bleed schedule started
    BleedStarted {
        /// Blips per hour
        rate: u32,
    },
    /// Bleed schedule stopped
    BleedStopped,
}

#[derive(Debug)]
enum WorkerReport {
    Poll { generation: u64, event: PollEvent },
    Sweep { generation: u64, sweep_id: u64, event: SweepEvent },
    Bleed { generation: u64, event: BleedEvent },
}

#[derive(Debug)]
struct Link {
    state: LinkState,
    generation: u64,
}

struct ActiveSweep {
    id: u64,
    handle: SweepHandle,
}

struct Workers {
    polling: Option<PollingHandle>,
    sweep: Option<ActiveSweep>,
    next_sweep_id: u64,
    bleed: BleedScheduler<EReg>,
}

struct ControllerInner {
    settings: Settings,
    ereg: Arc<EReg>,
    events: broadcast::Sender<ControllerEvent>,
    panel: watch::Sender<PanelState>,
    link: Mutex<Link>,
    workers: tokio::sync::Mutex<Workers>,
    reports: mpsc::UnboundedSender<WorkerReport>,
    history: SweepHistory,
}

struct Router {
    shutdown_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Regulator controller. Must be created inside a Tokio runtime.
pub struct Controller {
    inner: Arc<ControllerInner>,
    router: Mutex<Option<Router>>,
}

impl Controller {
    /// Controller with a fresh, disconnected client.
    pub fn new(settings: Settings) -> Self {
        Self::with_client(settings, Arc::new(EReg::new()))
    }

    /// Controller around an existing client.
    pub fn with_client(settings: Settings, ereg: Arc<EReg>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (panel, panel_rx) = watch::channel(PanelState::default());
        let (reports, reports_rx) = mpsc::unbounded_channel();
        let history = SweepHistory::new(settings.history.path.clone(), settings.history.keep);
        let bleed = BleedScheduler::new(Arc::clone(&ereg), settings.bleed.clone(), panel_rx);

        let inner = Arc::new(ControllerInner {
            settings,
            ereg,
            events,
            panel,
            link: Mutex::new(Link {
                state: LinkState::Disconnected,
                generation: 0,
            }),
            workers: tokio::sync::Mutex::new(Workers {
                polling: None,
                sweep: None,
                next_sweep_id: 0,
                bleed,
            }),
            reports,
            history,
        });

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(route_reports(Arc::downgrade(&inner), reports_rx, shutdown_rx));

        Self {
            inner,
            router: Mutex::new(Some(Router { shutdown_tx, task })),
        }
    }

    /// Subscribe to controller events.
    pub fn subscribe(&self) -> broadcast::Receiver<ControllerEvent> {
        self.inner.events.subscribe()
    }

    /// Watch the panel state.
    pub fn watch_panel(&self) -> watch::Receiver<PanelState> {
        self.inner.panel.subscribe()
    }

    /// Current panel state.
    pub fn panel(&self) -> PanelState {
        *self.inner.panel.borrow()
    }

    /// Current link state.
    pub fn link_state(&self) -> LinkState {
        self.inner.link.lock().state
    }

    /// Settings the controller was built with.
    pub fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    /// The protocol client.
    pub fn client(&self) -> &Arc<EReg> {
        &self.inner.ereg
    }

    /// Sweep history sink.
    pub fn history(&self) -> &SweepHistory {
        &self.inner.history
    }

    // --- Connection ---

    /// Connect to the configured address when
    /// `instrument.connect_on_startup` is set. Returns whether a connection
    /// was made; a failed attempt is logged and returned as is.
    pub async fn start_up(&self) -> ControlResult<bool> {
        if !self.inner.settings.instrument.connect_on_startup {
            tracing::info!("Connect on startup disabled");
            return Ok(false);
        }
        match self.connect_default().await {
            Ok(()) => Ok(true),
            Err(e) => {
                tracing::error!("Could not connect on startup: {}", e);
                Err(e)
            }
        }
    }

    /// Connect to the configured address.
    pub async fn connect_default(&self) -> ControlResult<()> {
        let instrument = &self.inner.settings.instrument;
        self.connect(&instrument.host.clone(), instrument.port).await
    }

    /// Connect, cache the calibration pressure, force the valves off and
    /// start polling. An existing connection is closed first.
    pub async fn connect(&self, host: &str, port: u16) -> ControlResult<()> {
        if self.link_state() != LinkState::Disconnected {
            self.disconnect().await;
        }

        let inner = &self.inner;
        inner
            .ereg
            .open_connection(host, port, inner.settings.instrument.timeout())
            .await?;

        let calibration = match inner.initialise_connection().await {
            Ok(calibration) => calibration,
            Err(e) => {
                tracing::error!("Initialisation after connect failed: {}", e);
                inner.ereg.close_connection().await;
                return Err(e.into());
            }
        };

        let generation = {
            let mut link = inner.link.lock();
            link.generation += 1;
            link.state = LinkState::Connected;
            link.generation
        };
        inner.panel.send_modify(|panel| panel.operating = false);

        {
            let polling = &inner.settings.polling;
            let engine = PollingEngine::new(
                Arc::clone(&inner.ereg),
                polling.sample_rate,
                polling.batch_size,
            );
            let reports = inner.reports.clone();
            let handle = PollingHandle::spawn(
                engine,
                Duration::from_millis(polling.interval_ms),
                move |event| {
                    let _ = reports.send(WorkerReport::Poll { generation, event });
                },
            );
            inner.workers.lock().await.polling = Some(handle);
        }

        let peer = format!("{}:{}", host, port);
        tracing::info!("Connected to e-Reg at {} (calibration {} psi)", peer, calibration);
        inner.emit(ControllerEvent::Connected {
            peer,
            calibration_psi: calibration,
        });
        Ok(())
    }

    /// Stop every worker and close the socket. Safe to call repeatedly.
    pub async fn disconnect(&self) {
        let inner = &self.inner;
        let bleed_stopped = {
            let mut workers = inner.workers.lock().await;
            if let Some(polling) = workers.polling.take() {
                polling.stop().await;
            }
            if let Some(active) = workers.sweep.take() {
                active.handle.cancel_and_join().await;
            }
            workers.bleed.stop().await
        };
        if bleed_stopped {
            inner.emit(ControllerEvent::BleedStopped);
        }

        let closed = inner.ereg.close_connection().await;
        let was_open = {
            let mut link = inner.link.lock();
            let was_open = link.state != LinkState::Disconnected;
            link.state = LinkState::Disconnected;
            was_open
        };
        inner.panel.send_modify(|panel| panel.operating = false);

        if closed || was_open {
            tracing::info!("Disconnected from e-Reg");
            inner.emit(ControllerEvent::Disconnected);
        }
    }

    /// Disconnect and stop the report router. Safe to call repeatedly.
    pub async fn shutdown(&self) {
        self.disconnect().await;
        let router = self.router.lock().take();
        if let Some(router) = router {
            let _ = router.shutdown_tx.send(());
            if let Err(e) = router.task.await {
                tracing::warn!("Report router ended abnormally: {}", e);
            }
            tracing::info!("Controller shut down");
        }
    }

    // --- Panel ---

    /// Enable (apply the current mode) or disable the valves.
    pub async fn set_operate(&self, on: bool) -> ControlResult<()> {
        let inner = &self.inner;
        inner.require_connected()?;
        if on {
            inner.checked(inner.ereg.valves_on().await).await?;
            inner.panel.send_modify(|panel| panel.operating = true);
            inner.apply_mode().await?;
            tracing::info!("Valves active ({})", self.panel().mode);
        } else {
            inner.stop_sweep().await;
            inner.checked(inner.ereg.valves_off().await).await?;
            inner.panel.send_modify(|panel| panel.operating = false);
            tracing::info!("Valves disabled");
        }
        Ok(())
    }

    /// Select the output mode; applied immediately while operating.
    pub async fn set_mode(&self, mode: OperateMode) -> ControlResult<()> {
        let inner = &self.inner;
        if mode != OperateMode::Pressurize {
            inner.stop_sweep().await;
        }
        inner.panel.send_modify(|panel| panel.mode = mode);
        if self.panel().operating {
            inner.require_connected()?;
            inner.apply_mode().await?;
        }
        Ok(())
    }

    /// Accept a new setpoint (0 to the configured maximum, mBar). It is
    /// written only while operating in pressurize mode. A rejected value
    /// leaves the previous setpoint in place.
    pub async fn set_setpoint_mbar(&self, mbar: f64) -> ControlResult<()> {
        let inner = &self.inner;
        let max = f64::from(inner.settings.sweep.max_pressure_mbar);
        if !mbar.is_finite() || !(0.0..=max).contains(&mbar) {
            return Err(ControlError::Validation(format!(
                "Invalid Pressure: {} mBar. Please enter a value between 0 and {}.",
                mbar, max
            )));
        }
        if inner.sweep_running().await {
            return Err(ControlError::Busy(
                "The setpoint is driven by a running sweep".to_string(),
            ));
        }

        if self.panel().is_pressurizing() {
            inner.require_connected()?;
            inner
                .checked(inner.ereg.write_setpoint_mbar(mbar).await)
                .await?;
        }
        inner.panel.send_modify(|panel| panel.setpoint_mbar = mbar);
        Ok(())
    }

    // --- Sweep ---

    /// Start a sweep from the current setpoint.
    pub async fn start_sweep(
        &self,
        span: i32,
        rate: u32,
        direction: SweepDirection,
    ) -> ControlResult<SweepParams> {
        let inner = &self.inner;
        let generation = inner.require_connected()?;
        let panel = self.panel();
        if !panel.is_pressurizing() {
            return Err(ControlError::Validation(
                "Sweeps require the valves to be operating in pressurize mode".to_string(),
            ));
        }

        let mut workers = inner.workers.lock().await;
        if workers
            .sweep
            .as_ref()
            .is_some_and(|active| active.handle.is_running())
        {
            return Err(ControlError::Busy("A sweep is already running".to_string()));
        }

        let params = SweepParams::new(panel.setpoint_mbar.round() as i32, span, rate, direction);
        params.validate(&inner.settings.sweep)?;

        if let Some(previous) = workers.sweep.take() {
            previous.handle.join().await;
        }

        inner.history.record_start(&params).await;

        workers.next_sweep_id += 1;
        let sweep_id = workers.next_sweep_id;
        let reports = inner.reports.clone();
        let handle = SweepHandle::spawn(
            Arc::clone(&inner.ereg),
            params,
            inner.settings.sweep.max_pressure_mbar,
            move |event| {
                let _ = reports.send(WorkerReport::Sweep {
                    generation,
                    sweep_id,
                    event,
                });
            },
        );
        workers.sweep = Some(ActiveSweep {
            id: sweep_id,
            handle,
        });
        drop(workers);
        Ok(params)
    }

    /// Ask the running sweep to stop at its next tick. Returns whether a
    /// sweep was running.
    pub async fn stop_sweep(&self) -> bool {
        self.inner.stop_sweep().await
    }

    /// Extend the running sweep by `delta` steps.
    pub async fn extend_sweep(&self, delta: i32) -> ControlResult<Extension> {
        let workers = self.inner.workers.lock().await;
        match workers.sweep.as_ref() {
            Some(active) => active.handle.extend(delta),
            None => Err(ControlError::Validation("No sweep is running".to_string())),
        }
    }

    /// Whether a sweep is ticking.
    pub async fn sweep_running(&self) -> bool {
        self.inner.sweep_running().await
    }

    // --- Bleed ---

    /// Start blipping at `rate` per hour, replacing any running schedule.
    pub async fn start_bleed(&self, rate: u32) -> ControlResult<Duration> {
        let inner = &self.inner;
        let generation = inner.link.lock().generation;
        let reports = inner.reports.clone();
        let period = inner
            .workers
            .lock()
            .await
            .bleed
            .start(rate, move |event| {
                let _ = reports.send(WorkerReport::Bleed { generation, event });
            })
            .await?;
        inner.emit(ControllerEvent::BleedStarted { rate });
        Ok(period)
    }

    /// Stop blipping. Returns whether a schedule was running.
    pub async fn stop_bleed(&self) -> bool {
        let stopped = self.inner.workers.lock().await.bleed.stop().await;
        if stopped {
            self.inner.emit(ControllerEvent::BleedStopped);
        }
        stopped
    }

    /// Rate of the running bleed schedule.
    pub async fn bleed_rate(&self) -> Option<u32> {
        self.inner.workers.lock().await.bleed.rate()
    }

    /// Whether the polling loop is running.
    pub async fn polling_active(&self) -> bool {
        self.inner
            .workers
            .lock()
            .await
            .polling
            .as_ref()
            .is_some_and(|polling| !polling.is_finished())
    }
}

impl ControllerInner {
    fn emit(&self, event: ControllerEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn require_connected(&self) -> ControlResult<u64> {
        let link = self.link.lock();
        match link.state {
            LinkState::Connected => Ok(link.generation),
            _ => Err(ControlError::NotConnected),
        }
    }

    async fn initialise_connection(&self) -> Result<f64, ERegError> {
        let calibration = self.ereg.refresh_calibration().await?;
        self.ereg.valves_off().await?;
        Ok(calibration)
    }

    /// Route connection failures from direct commands the same way as
    /// worker failures.
    async fn checked<T>(&self, result: Result<T, ERegError>) -> ControlResult<T> {
        if let Err(e) = &result {
            if e.is_connection() {
                self.connection_lost(e.to_string()).await;
            }
        }
        Ok(result?)
    }

    async fn apply_mode(&self) -> ControlResult<()> {
        let panel = *self.panel.borrow();
        let result = match panel.mode {
            OperateMode::Pressurize => self.ereg.write_setpoint_mbar(panel.setpoint_mbar).await,
            OperateMode::Vent => self.ereg.set_pressure(0.0).await,
            OperateMode::Bypass => match self.ereg.cached_calibration() {
                Some(calibration) => self.ereg.set_pressure(calibration).await,
                None => match self.ereg.refresh_calibration().await {
                    Ok(calibration) => self.ereg.set_pressure(calibration).await,
                    Err(e) => Err(e),
                },
            },
        };
        self.checked(result).await
    }

    async fn sweep_running(&self) -> bool {
        self.workers
            .lock()
            .await
            .sweep
            .as_ref()
            .is_some_and(|active| active.handle.is_running())
    }

    async fn stop_sweep(&self) -> bool {
        match self.workers.lock().await.sweep.as_ref() {
            Some(active) if active.handle.is_running() => {
                active.handle.stop();
                true
            }
            _ => false,
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        let link = self.link.lock();
        link.generation == generation && link.state == LinkState::Connected
    }

    fn surface(&self, err: &ERegError) {
        match err.kind() {
            ErrorKind::NegativeAcknowledgement => {
                self.emit(ControllerEvent::DeviceRejected(err.to_string()))
            }
            _ => self.emit(ControllerEvent::UnexpectedError(err.to_string())),
        }
    }

    /// Tear down workers after a connection error. Only the first report
    /// per connection has any effect.
    async fn connection_lost(&self, message: String) {
        {
            let mut link = self.link.lock();
            if link.state != LinkState::Connected {
                return;
            }
            link.state = LinkState::Lost;
        }
        tracing::error!("Connection lost: {}", message);

        let bleed_stopped = {
            let mut workers = self.workers.lock().await;
            if let Some(polling) = workers.polling.take() {
                polling.stop().await;
            }
            if let Some(active) = workers.sweep.as_ref() {
                active.handle.stop();
            }
            workers.bleed.stop().await
        };
        self.ereg.close_connection().await;
        self.panel.send_modify(|panel| panel.operating = false);

        if bleed_stopped {
            self.emit(ControllerEvent::BleedStopped);
        }
        self.emit(ControllerEvent::ConnectionLost(message));
    }

    async fn handle_report(&self, report: WorkerReport) {
        match report {
            WorkerReport::Poll { generation, event } => match event {
                PollEvent::Pressure(psi) => {
                    if self.is_current(generation) {
                        self.emit(ControllerEvent::PressureUpdate(psi));
                    }
                }
                PollEvent::Failed(err) => {
                    if !self.is_current(generation) {
                        return;
                    }
                    if err.is_connection() {
                        self.connection_lost(err.to_string()).await;
                    } else {
                        if let Some(polling) = self.workers.lock().await.polling.take() {
                            polling.stop().await;
                        }
                        tracing::error!("Polling halted: {}", err);
                        self.surface(&err);
                    }
                }
            },
            WorkerReport::Sweep {
                generation,
                sweep_id,
                event,
            } => match event {
                SweepEvent::Started { target_steps } => {
                    self.emit(ControllerEvent::SweepStarted { target_steps });
                }
                SweepEvent::Progress {
                    steps_taken,
                    current_pressure,
                } => {
                    self.panel
                        .send_modify(|panel| panel.setpoint_mbar = f64::from(current_pressure));
                    self.emit(ControllerEvent::SweepProgress {
                        steps_taken,
                        current_pressure,
                    });
                }
                SweepEvent::Failed(err) => {
                    if err.is_connection() {
                        if self.is_current(generation) {
                            self.connection_lost(err.to_string()).await;
                        }
                    } else {
                        self.surface(&err);
                    }
                }
                SweepEvent::Finished {
                    steps_taken,
                    current_pressure,
                    cancelled,
                } => {
                    let finished = {
                        let mut workers = self.workers.lock().await;
                        match workers.sweep.as_ref() {
                            Some(active) if active.id == sweep_id => workers.sweep.take(),
                            _ => None,
                        }
                    };
                    if let Some(active) = finished {
                        active.handle.join().await;
                    }
                    self.history.record_stop().await;
                    self.emit(ControllerEvent::SweepFinished {
                        steps_taken,
                        current_pressure,
                        cancelled,
                    });
                }
            },
            WorkerReport::Bleed { generation, event } => match event {
                BleedEvent::Blipped(request) => {
                    tracing::debug!("Blip to {} mBar complete", request.dip_mbar);
                }
                BleedEvent::BlipFailed(err) => {
                    if err.is_connection() {
                        if self.is_current(generation) {
                            self.connection_lost(err.to_string()).await;
                        }
                    } else {
                        self.surface(&err);
                    }
                }
            },
        }
    }
}

async fn route_reports(
    inner: Weak<ControllerInner>,
    mut reports: mpsc::UnboundedReceiver<WorkerReport>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            report = reports.recv() => {
                let Some(report) = report else { break };
                let Some(inner) = inner.upgrade() else { break };
                inner.handle_report(report).await;
            }
            _ = &mut shutdown_rx => {
                // Deliver what the workers reported before shutdown
                while let Ok(report) = reports.try_recv() {
                    let Some(inner) = inner.upgrade() else { break };
                    inner.handle_report(report).await;
                }
                break;
            }
        }
    }
    tracing::debug!("Report router stopped");
}
