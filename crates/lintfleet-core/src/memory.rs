//! Memory sampling for the current process.
//!
//! Reads current RSS and heap footprint from `/proc/self/statm` on Linux,
//! with a `getrusage` high-water fallback elsewhere. The [`MemorySampler`]
//! installs a periodic tokio tick that appends to an in-memory timeline and
//! optionally forwards each sample over a channel (workers turn forwarded
//! samples into `memory` IPC messages).
//!
//! Sampling never blocks the sampled computation beyond the cost of one
//! metrics read; samples within a process are totally ordered by timestamp.

use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};

/// One self-observation of the current process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sample {
    pub rss_bytes: u64,
    pub heap_used_bytes: u64,
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Current resident set size in bytes, best effort (0 if unavailable).
pub fn current_rss_bytes() -> u64 {
    match statm() {
        Some((rss, _)) => rss,
        None => peak_rss_bytes(),
    }
}

/// Current data-segment footprint in bytes, used as the heap estimate.
pub fn current_heap_bytes() -> u64 {
    statm().map(|(_, data)| data).unwrap_or(0)
}

/// Peak RSS since process start, from `getrusage(RUSAGE_SELF)`.
///
/// This is a high-water mark: it only ever stays flat or grows.
#[cfg(unix)]
pub fn peak_rss_bytes() -> u64 {
    // SAFETY: a zeroed rusage is a valid out-parameter and the error
    // return is checked.
    unsafe {
        let mut ru: libc::rusage = std::mem::zeroed();
        if libc::getrusage(libc::RUSAGE_SELF, &mut ru) != 0 {
            return 0;
        }
        maxrss_to_bytes(ru.ru_maxrss)
    }
}

#[cfg(not(unix))]
pub fn peak_rss_bytes() -> u64 {
    0
}

/// `ru_maxrss` units differ per platform: KiB on Linux and the BSDs,
/// bytes on macOS.
#[cfg(unix)]
fn maxrss_to_bytes(ru_maxrss: libc::c_long) -> u64 {
    let raw = if ru_maxrss <= 0 { 0 } else { ru_maxrss as u64 };
    #[cfg(target_os = "macos")]
    {
        raw
    }
    #[cfg(not(target_os = "macos"))]
    {
        raw.saturating_mul(1024)
    }
}

/// Read (resident, data) in bytes from `/proc/self/statm`.
///
/// statm reports pages: `size resident shared text lib data dirty`.
#[cfg(target_os = "linux")]
fn statm() -> Option<(u64, u64)> {
    let raw = std::fs::read_to_string("/proc/self/statm").ok()?;
    let mut fields = raw.split_whitespace();
    let _size = fields.next()?;
    let resident: u64 = fields.next()?.parse().ok()?;
    let _shared = fields.next()?;
    let _text = fields.next()?;
    let _lib = fields.next()?;
    let data: u64 = fields.next()?.parse().ok()?;

    // SAFETY: sysconf with a valid name has no preconditions.
    let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    let page = if page > 0 { page as u64 } else { 4096 };
    Some((resident * page, data * page))
}

#[cfg(not(target_os = "linux"))]
fn statm() -> Option<(u64, u64)> {
    None
}

/// Take one sample of the current process.
pub fn take_sample(label: Option<String>) -> Sample {
    Sample {
        rss_bytes: current_rss_bytes(),
        heap_used_bytes: current_heap_bytes(),
        timestamp_ms: now_ms(),
        label,
    }
}

/// Periodic self-sampler with an in-memory timeline.
///
/// `start` installs the tick; `stop` is idempotent and may be called any
/// number of times (including before `start`). Dropping the sampler stops
/// the tick as well.
pub struct MemorySampler {
    timeline: Arc<Mutex<Vec<Sample>>>,
    stop_tx: Option<watch::Sender<bool>>,
}

impl MemorySampler {
    pub fn new() -> Self {
        Self {
            timeline: Arc::new(Mutex::new(Vec::new())),
            stop_tx: None,
        }
    }

    /// Begin periodic sampling at `interval`.
    ///
    /// Each tick appends an unlabeled sample to the timeline and, when
    /// `forward` is given, sends a copy down the channel. The channel is
    /// unbounded so a slow consumer can never stall the tick.
    pub fn start(&mut self, interval: Duration, forward: Option<mpsc::UnboundedSender<Sample>>) {
        if self.stop_tx.is_some() {
            return;
        }
        let (stop_tx, mut stop_rx) = watch::channel(false);
        self.stop_tx = Some(stop_tx);

        let timeline = Arc::clone(&self.timeline);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick of a tokio interval fires immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let sample = take_sample(None);
                        if let Ok(mut tl) = timeline.lock() {
                            tl.push(sample.clone());
                        }
                        if let Some(tx) = &forward {
                            if tx.send(sample).is_err() {
                                break;
                            }
                        }
                    }
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });
    }

    /// Cancel the periodic tick. Safe to call repeatedly.
    pub fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(true);
        }
    }

    /// Take an immediate labeled sample and append it to the timeline.
    pub fn sample(&self, label: impl Into<String>) -> Sample {
        let sample = take_sample(Some(label.into()));
        if let Ok(mut tl) = self.timeline.lock() {
            tl.push(sample.clone());
        }
        sample
    }

    /// Highest RSS ever observed on the timeline; 0 when empty.
    pub fn peak(&self) -> u64 {
        self.timeline
            .lock()
            .map(|tl| tl.iter().map(|s| s.rss_bytes).max().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Snapshot of the timeline so far.
    pub fn timeline(&self) -> Vec<Sample> {
        self.timeline.lock().map(|tl| tl.clone()).unwrap_or_default()
    }
}

impl Default for MemorySampler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MemorySampler {
    fn drop(&mut self) {
        self.stop();
    }
}
