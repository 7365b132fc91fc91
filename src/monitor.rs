//! Passive resource monitoring.
//!
//! Samples OS and process CPU plus memory on a fixed interval, keeping a
//! ring buffer of recent samples and resettable peaks. The latest sample is
//! surfaced through the control plane; an hourly summary line goes to the
//! log, and an optional watermark check warns on excessive process memory.

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{Pid, System};
use tokio::task::JoinHandle;
use tokio::time::interval;

/// Ring buffer depth.
pub const HISTORY_DEPTH: usize = 1000;

/// Watermark for the `--memorycheck` warning.
const MEMORY_WATERMARK_BYTES: u64 = 1024 * 1024 * 1024;

const SUMMARY_EVERY: Duration = Duration::from_secs(3600);

/// One measurement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSample {
    pub timestamp: DateTime<Utc>,
    pub os_cpu_percent: f32,
    pub process_cpu_percent: f32,
    pub rss_bytes: u64,
    pub virtual_bytes: u64,
    pub system_used_bytes: u64,
    pub system_total_bytes: u64,
}

/// Peak values since start or the last reset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourcePeaks {
    pub os_cpu_percent: f32,
    pub process_cpu_percent: f32,
    pub rss_bytes: u64,
}

struct MonitorState {
    history: Mutex<VecDeque<ResourceSample>>,
    peaks: Mutex<ResourcePeaks>,
    capacity: usize,
    memory_check: bool,
}

impl MonitorState {
    fn record(&self, sample: ResourceSample) {
        {
            let mut peaks = self.peaks.lock();
            peaks.os_cpu_percent = peaks.os_cpu_percent.max(sample.os_cpu_percent);
            peaks.process_cpu_percent =
                peaks.process_cpu_percent.max(sample.process_cpu_percent);
            peaks.rss_bytes = peaks.rss_bytes.max(sample.rss_bytes);
        }
        if self.memory_check && sample.rss_bytes > MEMORY_WATERMARK_BYTES {
            warn!(
                "[Monitor] Process memory {} MB exceeds watermark",
                sample.rss_bytes / (1024 * 1024)
            );
        }
        let mut history = self.history.lock();
        if history.len() >= self.capacity {
            history.pop_front();
        }
        history.push_back(sample);
    }
}

/// Periodic CPU/memory sampler. Strictly passive.
pub struct ResourceMonitor {
    state: Arc<MonitorState>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ResourceMonitor {
    /// Start sampling every `sample_interval` with the default history
    /// depth.
    pub fn start(sample_interval: Duration, memory_check: bool) -> Self {
        Self::with_capacity(sample_interval, HISTORY_DEPTH, memory_check)
    }

    pub fn with_capacity(
        sample_interval: Duration,
        capacity: usize,
        memory_check: bool,
    ) -> Self {
        let state = Arc::new(MonitorState {
            history: Mutex::new(VecDeque::new()),
            peaks: Mutex::new(ResourcePeaks::default()),
            capacity,
            memory_check,
        });

        let task_state = state.clone();
        let task = tokio::spawn(async move {
            let mut system = System::new_all();
            let pid = Pid::from_u32(std::process::id());
            let mut ticker = interval(sample_interval);
            let mut last_summary = tokio::time::Instant::now();

            loop {
                ticker.tick().await;
                system.refresh_cpu();
                system.refresh_memory();
                system.refresh_processes();

                let process = system.process(pid);
                let sample = ResourceSample {
                    timestamp: Utc::now(),
                    os_cpu_percent: system.global_cpu_info().cpu_usage(),
                    process_cpu_percent: process.map(|p| p.cpu_usage()).unwrap_or(0.0),
                    rss_bytes: process.map(|p| p.memory()).unwrap_or(0),
                    virtual_bytes: process.map(|p| p.virtual_memory()).unwrap_or(0),
                    system_used_bytes: system.used_memory(),
                    system_total_bytes: system.total_memory(),
                };
                debug!(
                    "[Monitor] cpu {:.1}% rss {} MB",
                    sample.process_cpu_percent,
                    sample.rss_bytes / (1024 * 1024)
                );
                task_state.record(sample);

                if last_summary.elapsed() >= SUMMARY_EVERY {
                    last_summary = tokio::time::Instant::now();
                    let peaks = *task_state.peaks.lock();
                    info!(
                        "[Monitor] Hourly peaks: os cpu {:.1}%, process cpu {:.1}%, rss {} MB",
                        peaks.os_cpu_percent,
                        peaks.process_cpu_percent,
                        peaks.rss_bytes / (1024 * 1024)
                    );
                }
            }
        });

        Self {
            state,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn latest(&self) -> Option<ResourceSample> {
        self.state.history.lock().back().cloned()
    }

    pub fn history(&self) -> Vec<ResourceSample> {
        self.state.history.lock().iter().cloned().collect()
    }

    pub fn peaks(&self) -> ResourcePeaks {
        *self.state.peaks.lock()
    }

    pub fn reset_peaks(&self) {
        *self.state.peaks.lock() = ResourcePeaks::default();
    }

    pub fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

impl Drop for ResourceMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_samples_accumulate() {
        let monitor = ResourceMonitor::with_capacity(Duration::from_millis(20), 16, false);
        tokio::time::sleep(Duration::from_millis(120)).await;
        monitor.stop();

        let history = monitor.history();
        assert!(history.len() >= 2);
        let latest = monitor.latest().unwrap();
        assert!(latest.system_total_bytes > 0);
    }

    #[tokio::test]
    async fn test_ring_buffer_is_bounded() {
        let monitor = ResourceMonitor::with_capacity(Duration::from_millis(5), 3, false);
        tokio::time::sleep(Duration::from_millis(120)).await;
        monitor.stop();
        assert!(monitor.history().len() <= 3);
    }

    #[tokio::test]
    async fn test_peaks_track_and_reset() {
        let monitor = ResourceMonitor::with_capacity(Duration::from_millis(20), 16, false);
        tokio::time::sleep(Duration::from_millis(80)).await;
        monitor.stop();

        let peaks = monitor.peaks();
        let latest = monitor.latest().unwrap();
        assert!(peaks.rss_bytes >= latest.rss_bytes);

        monitor.reset_peaks();
        assert_eq!(monitor.peaks(), ResourcePeaks::default());
    }
}
