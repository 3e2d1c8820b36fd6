//! [`HealthMonitor`] – periodic sampling of the kernel's health.
//!
//! The monitor is a tokio task that calls [`Kernel::update_system_stats`]
//! once per interval.  The call takes blocking locks, so it runs on the
//! blocking pool.  Stopping is explicit: [`MonitorHandle::stop`] signals the
//! task through a watch channel and waits for it to finish.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use espos_hal::Platform;
//! use espos_kernel::{HealthMonitor, Kernel, KernelConfig};
//!
//! # async fn run() {
//! let kernel = Arc::new(Kernel::init(KernelConfig::default(), Platform::simulated(64 * 1024)).unwrap());
//! let monitor = HealthMonitor::spawn(kernel.clone(), Duration::from_secs(5));
//! // ... serve ...
//! monitor.stop().await;
//! # }
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use espos_types::KernelError;

use crate::kernel_monitor::Kernel;

/// Shortest accepted sampling interval.
pub const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Spawns the periodic health task.
pub struct HealthMonitor;

impl HealthMonitor {
    /// Start sampling `kernel` every `interval`.  The first sample is taken
    /// immediately.  Intervals below [`MIN_INTERVAL`] are raised to it.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(kernel: Arc<Kernel>, interval: Duration) -> MonitorHandle {
        if interval < MIN_INTERVAL {
            warn!(requested_ms = interval.as_millis() as u64, "health monitor interval raised to minimum");
        }
        let interval = interval.max(MIN_INTERVAL);
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let samples = Arc::new(AtomicU64::new(0));
        let counter = samples.clone();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_ms = interval.as_millis() as u64, "health monitor started");

            loop {
                tokio::select! {
                    changed = stop_rx.changed() => {
                        // A dropped sender also means stop.
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        let kernel = kernel.clone();
                        match tokio::task::spawn_blocking(move || kernel.update_system_stats()).await {
                            Ok(Ok(healthy)) => {
                                counter.fetch_add(1, Ordering::Relaxed);
                                debug!(healthy, "health sample");
                            }
                            Ok(Err(KernelError::ShutDown)) => {
                                info!("kernel shut down, health monitor exiting");
                                break;
                            }
                            Ok(Err(e)) => warn!(error = %e, "health sample failed"),
                            Err(e) => warn!(error = %e, "health sample task panicked"),
                        }
                    }
                }
            }

            info!(samples = counter.load(Ordering::Relaxed), "health monitor stopped");
        });

        MonitorHandle {
            stop_tx,
            task,
            samples,
        }
    }
}

/// Owner of a running health monitor.
pub struct MonitorHandle {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
    samples: Arc<AtomicU64>,
}

impl MonitorHandle {
    /// Successful samples taken so far.
    pub fn samples(&self) -> u64 {
        self.samples.load(Ordering::Relaxed)
    }

    /// Whether the monitor task has exited on its own.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Signal the monitor to stop and wait for it.
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "health monitor task ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::KernelConfig;
    use espos_hal::{ManualClock, Platform, SimHeap, SimScheduler};

    fn kernel_with_heap(heap: Arc<SimHeap>) -> Arc<Kernel> {
        let config = KernelConfig {
            heap_size: heap.capacity(),
            ..KernelConfig::default()
        };
        let platform = Platform::new(
            Arc::new(SimScheduler::bookkeeping_only()),
            heap,
            Arc::new(ManualClock::new()),
        );
        Arc::new(Kernel::init(config, platform).unwrap())
    }

    #[tokio::test]
    async fn samples_periodically_until_stopped() {
        let kernel = kernel_with_heap(Arc::new(SimHeap::new(64 * 1024)));
        let monitor = HealthMonitor::spawn(kernel.clone(), Duration::from_millis(10));

        tokio::time::sleep(Duration::from_millis(80)).await;
        let taken = monitor.samples();
        assert!(taken >= 2, "expected several samples, got {taken}");

        tokio::time::timeout(Duration::from_secs(1), monitor.stop())
            .await
            .expect("monitor must stop promptly");
    }

    #[tokio::test]
    async fn zero_interval_is_raised_to_minimum() {
        let kernel = kernel_with_heap(Arc::new(SimHeap::new(64 * 1024)));
        let monitor = HealthMonitor::spawn(kernel.clone(), Duration::ZERO);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!monitor.is_finished(), "monitor task must still be running");
        assert!(monitor.samples() >= 1);
        monitor.stop().await;
    }

    #[tokio::test]
    async fn detects_low_memory_between_samples() {
        let heap = Arc::new(SimHeap::new(32 * 1024));
        let kernel = kernel_with_heap(heap.clone());
        let monitor = HealthMonitor::spawn(kernel.clone(), Duration::from_millis(10));

        heap.reserve_external(30 * 1024);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!kernel.is_healthy());

        heap.release_external(30 * 1024);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(kernel.is_healthy());

        monitor.stop().await;
    }

    #[tokio::test]
    async fn exits_on_its_own_after_kernel_shutdown() {
        let kernel = kernel_with_heap(Arc::new(SimHeap::new(64 * 1024)));
        let monitor = HealthMonitor::spawn(kernel.clone(), Duration::from_millis(10));
        kernel.shutdown().unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(monitor.is_finished());
        monitor.stop().await;
    }
}
