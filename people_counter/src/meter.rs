//! Throughput and latency statistics, logged periodically.
//!
use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

use tokio::{task::JoinHandle, time::interval};

pub static METER: Meter = Meter::new();

/// Counters shared between the capture thread and the inference loop.
#[derive(Default)]
pub struct Meter {
    captured: AtomicU64,
    inferred: AtomicU64,
    inference_micros: AtomicU64,
}

/// Counts accumulated since the previous [`Meter::take`].
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Window {
    pub captured: u64,
    pub inferred: u64,
    pub inference_time: Duration,
}

impl Window {
    /// Mean network latency per inferred frame.
    pub fn mean_latency(&self) -> Option<Duration> {
        let frames = u32::try_from(self.inferred).ok().filter(|n| *n > 0)?;
        Some(self.inference_time / frames)
    }

    fn log(&self, elapsed: Duration) {
        let secs = elapsed.as_secs_f64();
        if self.captured > 0 {
            log::info!("Captured {:.2} fps", self.captured as f64 / secs);
        }
        if let Some(latency) = self.mean_latency() {
            log::info!(
                "Inferred {:.2} fps, {:.3}ms per frame",
                self.inferred as f64 / secs,
                latency.as_secs_f64() * 1000.0
            );
        }
    }
}

impl Meter {
    pub const fn new() -> Meter {
        Meter {
            captured: AtomicU64::new(0),
            inferred: AtomicU64::new(0),
            inference_micros: AtomicU64::new(0),
        }
    }

    pub fn tick_captured(&self) {
        self.captured.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one inferred frame and the time the network spent on it.
    pub fn record_inference(&self, inference_time: Duration) {
        self.inferred.fetch_add(1, Ordering::Relaxed);
        let micros = u64::try_from(inference_time.as_micros()).unwrap_or(u64::MAX);
        self.inference_micros.fetch_add(micros, Ordering::Relaxed);
    }

    /// Read and reset all counters.
    pub fn take(&self) -> Window {
        Window {
            captured: self.captured.swap(0, Ordering::Relaxed),
            inferred: self.inferred.swap(0, Ordering::Relaxed),
            inference_time: Duration::from_micros(self.inference_micros.swap(0, Ordering::Relaxed)),
        }
    }
}

/// Log the statistics of [`METER`] every `period`.
pub fn spawn_meter_logger(period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.tick().await;
        let mut last = Instant::now();

        loop {
            ticker.tick().await;
            let now = Instant::now();
            METER.take().log(now - last);
            last = now;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_resets_window() {
        let meter = Meter::new();
        meter.tick_captured();
        meter.tick_captured();
        meter.record_inference(Duration::from_millis(30));
        meter.record_inference(Duration::from_millis(10));

        let window = meter.take();
        assert_eq!(window.captured, 2);
        assert_eq!(window.inferred, 2);
        assert_eq!(window.mean_latency(), Some(Duration::from_millis(20)));

        assert_eq!(meter.take(), Window::default());
    }

    #[test]
    fn test_no_latency_without_inference() {
        let window = Window {
            captured: 5,
            ..Default::default()
        };
        assert_eq!(window.mean_latency(), None);
    }
}
