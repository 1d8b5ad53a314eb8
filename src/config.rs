//! Pipeline configuration, loadable from TOML.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::backoff::Backoff;
use crate::error::{Error, Result};

/// Which lock guards a piece of shared state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockKind {
    /// [`crate::QueueLock`].
    #[default]
    Queue,
    /// [`crate::SpinLock`].
    Spin,
}

/// Where [`crate::SlotAllocator::alloc`] looks first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocOrder {
    /// Reuse reclaimed blocks before carving fresh ones.
    #[default]
    FreeListFirst,
    /// Carve the whole pool once before reusing reclaimed blocks.
    BumpFirst,
}

/// Acknowledgment simulation and poll thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WindowConfig {
    /// Blocks reclaimed per simulated cumulative acknowledgment.
    pub ack_batch: usize,
    /// Sent-queue length at which an acknowledgment is simulated.
    pub ack_trigger: usize,
    /// PDUs sent without a poll before the next transfer carries one.
    pub poll_pdu: u32,
    /// Bytes sent without a poll before the next transfer carries one.
    pub poll_byte: usize,
}

impl Default for WindowConfig {
    fn default() -> Self {
        WindowConfig {
            ack_batch: 2,
            ack_trigger: 6,
            poll_pdu: 32,
            poll_byte: 25_000,
        }
    }
}

/// Everything needed to build a [`crate::Pipeline`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    /// Producer workers. Worker 0 is the consumer, producers are `1..=producers`.
    pub producers: usize,
    /// Queue-lock binding slots per worker.
    pub binding_slots: usize,
    /// Blocks in the slot pool.
    pub pool_capacity: usize,
    /// Job indices handed out by the dispenser.
    pub job_count: u32,
    /// Allocation order of the slot pool.
    pub alloc_order: AllocOrder,
    /// Lock guarding the to-send and sent queues.
    pub queue_lock: LockKind,
    /// Wait strategy of queue locks and queue spinlocks.
    pub lock_backoff: Backoff,
    /// Wait strategy of the dispenser and allocator spinlocks.
    pub dispenser_backoff: Backoff,
    /// Pause taken by a producer after the pool ran dry.
    pub alloc_retry_backoff: Backoff,
    /// Window tracker settings.
    pub window: WindowConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            producers: 4,
            binding_slots: 4,
            pool_capacity: 400,
            job_count: 400,
            alloc_order: AllocOrder::default(),
            queue_lock: LockKind::default(),
            lock_backoff: Backoff::default(),
            dispenser_backoff: Backoff::Delay { iterations: 100 },
            alloc_retry_backoff: Backoff::Delay { iterations: 200 },
            window: WindowConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Parse and validate a TOML document. Missing keys take their defaults.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: PipelineConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Total workers: the consumer plus every producer.
    pub fn workers(&self) -> usize {
        self.producers + 1
    }

    /// Reject settings under which the pipeline cannot make progress.
    pub fn validate(&self) -> Result<()> {
        if self.producers == 0 {
            return Err(invalid("producers", "at least one producer is required"));
        }
        if self.binding_slots == 0 {
            return Err(invalid("binding_slots", "must be non-zero"));
        }
        if self.pool_capacity == 0 {
            return Err(invalid("pool_capacity", "must be non-zero"));
        }
        if self.pool_capacity >= u32::MAX as usize {
            return Err(invalid("pool_capacity", "must fit a 32-bit block handle"));
        }
        let w = &self.window;
        if w.ack_batch == 0 {
            return Err(invalid("window.ack_batch", "must be non-zero"));
        }
        if w.ack_batch > w.ack_trigger {
            return Err(invalid(
                "window.ack_batch",
                format!("{} exceeds ack_trigger {}", w.ack_batch, w.ack_trigger),
            ));
        }
        if self.pool_capacity < w.ack_trigger {
            return Err(invalid(
                "pool_capacity",
                format!(
                    "{} is below ack_trigger {}; reclamation would never start",
                    self.pool_capacity, w.ack_trigger
                ),
            ));
        }
        if w.poll_pdu == 0 {
            return Err(invalid("window.poll_pdu", "must be non-zero"));
        }
        Ok(())
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> Error {
    Error::InvalidConfig {
        field,
        reason: reason.into(),
    }
}
