use crate::{
    clock::{Cadence, Millis},
    types::HeapSample,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapVerdict {
    /// Not sampled this tick.
    Idle,
    Healthy(HeapSample),
    Exhausted(HeapSample),
}

#[derive(Debug, Clone)]
pub struct HeapWatchdog {
    cadence: Cadence,
    low_water_bytes: u32,
    last_sample: Option<HeapSample>,
}

impl HeapWatchdog {
    pub fn new(check_interval_ms: u32, low_water_bytes: u32) -> Self {
        Self {
            cadence: Cadence::new(check_interval_ms),
            low_water_bytes,
            last_sample: None,
        }
    }

    pub fn low_water_bytes(&self) -> u32 {
        self.low_water_bytes
    }

    pub fn last_sample(&self) -> Option<HeapSample> {
        self.last_sample
    }

    /// `read_free` is only invoked when a sample is due.
    pub fn supervise(&mut self, now_ms: Millis, read_free: impl FnOnce() -> u32) -> HeapVerdict {
        if !self.cadence.due(now_ms) {
            return HeapVerdict::Idle;
        }

        let sample = HeapSample {
            free_bytes: read_free(),
            sampled_at: now_ms,
        };
        self.last_sample = Some(sample);

        if sample.free_bytes < self.low_water_bytes {
            log::error!(
                "free heap {} bytes below low-water mark {}",
                sample.free_bytes,
                self.low_water_bytes
            );
            HeapVerdict::Exhausted(sample)
        } else {
            HeapVerdict::Healthy(sample)
        }
    }
}
