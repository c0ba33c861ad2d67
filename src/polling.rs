//! Periodic pressure polling.
//!
//! Every tick drives one step of a sample-and-retrieve cycle:
//!
//! ```text
//!   Idle ──start batch──▶ Sampling ──buffer ready──▶ Idle (emit median)
//!                           │  ▲
//!                           └──┘ buffer not ready (next tick reads again)
//! ```
//!
//! While a cycle is in [`PollPhase::Sampling`] no new batch is started; the
//! next tick only retries the buffer read. Any error returns the engine to
//! [`PollPhase::Idle`] and ends the polling task after reporting it once.

use crate::capabilities::BatchSampler;
use ereg_driver::{ERegError, SampleBuffer};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

/// Phase of the sampling cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollPhase {
    /// No batch outstanding; the next tick starts one.
    Idle,
    /// A batch was started and its buffer has not been read back yet.
    Sampling,
}

/// Output of the polling task.
#[derive(Debug, Clone, PartialEq)]
pub enum PollEvent {
    /// Median of a completed batch, in device units (psi).
    Pressure(f64),
    /// The cycle failed. Polling has stopped.
    Failed(ERegError),
}

/// Median of a batch. Even-length batches average the two middle values.
pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}

/// Sample-and-retrieve state machine.
pub struct PollingEngine<S: ?Sized> {
    sampler: Arc<S>,
    phase: PollPhase,
    sample_rate: u32,
    batch_size: u32,
}

impl<S: BatchSampler + ?Sized> PollingEngine<S> {
    /// Engine starting batches of `batch_size` samples at `sample_rate`.
    pub fn new(sampler: Arc<S>, sample_rate: u32, batch_size: u32) -> Self {
        Self {
            sampler,
            phase: PollPhase::Idle,
            sample_rate,
            batch_size,
        }
    }

    /// Current phase.
    pub fn phase(&self) -> PollPhase {
        self.phase
    }

    /// Run one tick.
    ///
    /// Returns `Ok(Some(median))` when a batch completed, `Ok(None)` while
    /// the device is still filling the buffer.
    pub async fn tick(&mut self) -> Result<Option<f64>, ERegError> {
        if self.phase == PollPhase::Idle {
            self.sampler
                .start_batch(self.sample_rate, self.batch_size)
                .await?;
            self.phase = PollPhase::Sampling;
        }

        let buffer = match self.sampler.fetch_batch().await {
            Ok(buffer) => buffer,
            Err(e) => {
                self.phase = PollPhase::Idle;
                return Err(e);
            }
        };

        match buffer {
            SampleBuffer::NotReady(token) => {
                tracing::trace!("Sample buffer not ready ({:?})", token);
                Ok(None)
            }
            SampleBuffer::Samples(values) => {
                self.phase = PollPhase::Idle;
                Ok(median(&values))
            }
        }
    }
}

/// Handle to a running polling task.
pub struct PollingHandle {
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl PollingHandle {
    /// Spawn the polling loop. `report` receives every [`PollEvent`].
    pub fn spawn<S, F>(mut engine: PollingEngine<S>, period: Duration, report: F) -> Self
    where
        S: BatchSampler + ?Sized + 'static,
        F: Fn(PollEvent) + Send + Sync + 'static,
    {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let task = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tracing::info!("Polling started ({} ms)", period.as_millis());

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match engine.tick().await {
                            Ok(Some(pressure)) => report(PollEvent::Pressure(pressure)),
                            Ok(None) => {}
                            Err(e) => {
                                tracing::error!("Polling stopped: {}", e);
                                report(PollEvent::Failed(e));
                                break;
                            }
                        }
                    }
                    _ = &mut shutdown_rx => {
                        tracing::info!("Polling shutdown requested");
                        break;
                    }
                }
            }
        });

        Self {
            shutdown_tx: Some(shutdown_tx),
            task,
        }
    }

    /// Whether the loop has exited (stopped or failed).
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop the loop and wait for it to exit. Safe if it already exited.
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Err(e) = self.task.await {
            tracing::warn!("Polling task ended abnormally: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use ereg_driver::ERegResult;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct ScriptedSampler {
        starts: Mutex<Vec<(u32, u32)>>,
        start_results: Mutex<VecDeque<ERegResult<()>>>,
        buffers: Mutex<VecDeque<ERegResult<SampleBuffer>>>,
    }

    impl ScriptedSampler {
        fn with_buffers(buffers: Vec<ERegResult<SampleBuffer>>) -> Arc<Self> {
            Arc::new(Self {
                buffers: Mutex::new(buffers.into()),
                ..Default::default()
            })
        }

        fn start_count(&self) -> usize {
            self.starts.lock().len()
        }
    }

    #[async_trait]
    impl BatchSampler for ScriptedSampler {
        async fn start_batch(&self, sample_rate: u32, batch_size: u32) -> ERegResult<()> {
            self.starts.lock().push((sample_rate, batch_size));
            self.start_results.lock().pop_front().unwrap_or(Ok(()))
        }

        async fn fetch_batch(&self) -> ERegResult<SampleBuffer> {
            self.buffers
                .lock()
                .pop_front()
                .unwrap_or_else(|| Ok(SampleBuffer::NotReady("sbe".into())))
        }
    }

    fn not_ready() -> ERegResult<SampleBuffer> {
        Ok(SampleBuffer::NotReady("sbe".into()))
    }

    #[test]
    fn test_median() {
        assert_eq!(median(&[10.0, 12.0, 11.0]), Some(11.0));
        assert_eq!(median(&[4.0, 1.0, 3.0, 2.0]), Some(2.5));
        assert_eq!(median(&[7.25]), Some(7.25));
        assert_eq!(median(&[]), None);
    }

    #[tokio::test]
    async fn test_batch_reduced_to_median() {
        let sampler =
            ScriptedSampler::with_buffers(vec![Ok(SampleBuffer::Samples(vec![10.0, 12.0, 11.0]))]);
        let mut engine = PollingEngine::new(sampler.clone(), 10, 21);

        assert_eq!(engine.tick().await.unwrap(), Some(11.0));
        assert_eq!(engine.phase(), PollPhase::Idle);
        assert_eq!(*sampler.starts.lock(), vec![(10, 21)]);
    }

    #[tokio::test]
    async fn test_no_second_start_while_sampling() {
        let sampler = ScriptedSampler::with_buffers(vec![
            not_ready(),
            not_ready(),
            Ok(SampleBuffer::Samples(vec![1.0, 2.0, 3.0])),
            not_ready(),
        ]);
        let mut engine = PollingEngine::new(sampler.clone(), 10, 3);

        assert_eq!(engine.tick().await.unwrap(), None);
        assert_eq!(engine.phase(), PollPhase::Sampling);
        assert_eq!(engine.tick().await.unwrap(), None);
        assert_eq!(sampler.start_count(), 1);

        assert_eq!(engine.tick().await.unwrap(), Some(2.0));
        assert_eq!(engine.phase(), PollPhase::Idle);

        // Next cycle starts a fresh batch
        assert_eq!(engine.tick().await.unwrap(), None);
        assert_eq!(sampler.start_count(), 2);
    }

    #[tokio::test]
    async fn test_start_failure_stays_idle() {
        let sampler = Arc::new(ScriptedSampler {
            start_results: Mutex::new(
                vec![Err(ERegError::Connection("Socket is not connected".into()))].into(),
            ),
            ..Default::default()
        });
        let mut engine = PollingEngine::new(sampler.clone(), 10, 21);

        let err = engine.tick().await.unwrap_err();
        assert!(err.is_connection());
        assert_eq!(engine.phase(), PollPhase::Idle);
    }

    #[tokio::test]
    async fn test_fetch_failure_returns_to_idle() {
        let sampler = ScriptedSampler::with_buffers(vec![
            not_ready(),
            Err(ERegError::Unexpected("Could not parse sample value \"1..2\"".into())),
        ]);
        let mut engine = PollingEngine::new(sampler.clone(), 10, 21);

        assert_eq!(engine.tick().await.unwrap(), None);
        assert!(matches!(engine.tick().await, Err(ERegError::Unexpected(_))));
        assert_eq!(engine.phase(), PollPhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_reports_pressure_then_stops_cleanly() {
        let sampler = ScriptedSampler::with_buffers(vec![
            not_ready(),
            Ok(SampleBuffer::Samples(vec![14.5, 14.6, 14.4])),
        ]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = PollingHandle::spawn(
            PollingEngine::new(sampler.clone(), 10, 3),
            Duration::from_millis(250),
            move |event| {
                let _ = tx.send(event);
            },
        );

        assert_eq!(rx.recv().await, Some(PollEvent::Pressure(14.5)));
        assert!(!handle.is_finished());
        handle.stop().await;
        assert_eq!(sampler.start_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_halts_after_error() {
        let sampler = ScriptedSampler::with_buffers(vec![Err(ERegError::Connection(
            "Connection closed by device".into(),
        ))]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = PollingHandle::spawn(
            PollingEngine::new(sampler.clone(), 10, 21),
            Duration::from_millis(250),
            move |event| {
                let _ = tx.send(event);
            },
        );

        match rx.recv().await {
            Some(PollEvent::Failed(err)) => assert!(err.is_connection()),
            other => panic!("expected failure, got {:?}", other),
        }
        // The sender is dropped with the task; nothing else arrives.
        assert_eq!(rx.recv().await, None);
        assert!(handle.is_finished());
        handle.stop().await;
        assert_eq!(sampler.start_count(), 1);
    }
}
