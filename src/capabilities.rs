//! Capability traits the workers depend on.
//!
//! Workers never see the whole protocol client. Each asks for the one thing
//! it needs:
//!
//! - the sweep stepper and the bleed scheduler need a [`SetpointWriter`]
//! - the polling engine needs a [`BatchSampler`]
//!
//! [`EReg`] implements both. Tests substitute small in-memory fakes so timer
//! logic can run on a paused clock without sockets.

use async_trait::async_trait;
use ereg_driver::units::mbar_to_psi;
use ereg_driver::{EReg, ERegResult, SampleBuffer};

/// Writes an output pressure setpoint given in display units (mBar).
#[async_trait]
pub trait SetpointWriter: Send + Sync {
    /// Convert to device units and write the setpoint.
    async fn write_setpoint_mbar(&self, mbar: f64) -> ERegResult<()>;
}

/// Starts a sampling batch and fetches its buffer.
#[async_trait]
pub trait BatchSampler: Send + Sync {
    /// Set the device sample rate and start a batch of `batch_size` samples.
    async fn start_batch(&self, sample_rate: u32, batch_size: u32) -> ERegResult<()>;

    /// Read the sample buffer.
    async fn fetch_batch(&self) -> ERegResult<SampleBuffer>;
}

#[async_trait]
impl SetpointWriter for EReg {
    async fn write_setpoint_mbar(&self, mbar: f64) -> ERegResult<()> {
        self.set_pressure(mbar_to_psi(mbar)).await
    }
}

#[async_trait]
impl BatchSampler for EReg {
    async fn start_batch(&self, sample_rate: u32, batch_size: u32) -> ERegResult<()> {
        self.set_sample_rate(sample_rate).await?;
        self.start_sampling(Some(batch_size)).await
    }

    async fn fetch_batch(&self) -> ERegResult<SampleBuffer> {
        self.send_buffer().await
    }
}
