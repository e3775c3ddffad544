//! # Bandwidth
//!
//! Throttling and measurement of blob transfers.
//!
//! - [`TokenBucket`]: smooth rate limiting with a one second burst
//! - [`BandwidthManager`]: node-wide upload and download limits plus totals
//! - [`BandwidthMonitor`]: speed of one transfer, current and average
//!
//! ```rust,no_run
//! use slymesh::bandwidth::BandwidthManager;
//!
//! async fn send_slice(manager: &BandwidthManager, slice: &[u8]) {
//!     manager.request_upload_quota(slice.len() as u64).await;
//!     // write the slice to the connection
//! }
//! ```

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, info};

/// Window over which [`BandwidthMonitor::current_speed`] is measured.
pub const SPEED_WINDOW: Duration = Duration::from_secs(2);

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket rate limiter
#[derive(Debug)]
pub struct TokenBucket {
    capacity: u64,
    refill_rate: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(rate_bytes_per_sec: u64) -> Self {
        let capacity = rate_bytes_per_sec.max(1024);
        Self {
            capacity,
            refill_rate: rate_bytes_per_sec.max(1) as f64,
            state: Mutex::new(BucketState {
                tokens: capacity as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Wait until `bytes` tokens are available and take them. Requests
    /// larger than the bucket are paid off in capacity-sized installments.
    pub async fn consume(&self, bytes: u64) {
        let mut owed = bytes;
        while owed > 0 {
            let step = owed.min(self.capacity);
            let wait = {
                let mut state = self.state.lock();
                self.refill(&mut state);
                if state.tokens >= step as f64 {
                    state.tokens -= step as f64;
                    owed -= step;
                    continue;
                }
                Duration::from_secs_f64((step as f64 - state.tokens) / self.refill_rate)
            };
            debug!("Waiting {:?} for {} bytes of bandwidth", wait, step);
            sleep(wait.min(Duration::from_millis(100))).await;
        }
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill);
        if elapsed >= Duration::from_millis(10) {
            state.tokens =
                (state.tokens + elapsed.as_secs_f64() * self.refill_rate).min(self.capacity as f64);
            state.last_refill = now;
        }
    }

    pub fn available_tokens(&self) -> u64 {
        let mut state = self.state.lock();
        self.refill(&mut state);
        state.tokens as u64
    }
}

/// Speed of a single transfer.
#[derive(Debug, Default, Clone)]
pub struct BandwidthMonitor {
    started: Option<Instant>,
    stopped: Option<Instant>,
    total: u64,
    period_start: Option<Instant>,
    period_bytes: u64,
    period_speed: u64,
}

impl BandwidthMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start measuring; later calls keep the original start.
    pub fn start(&mut self) {
        if self.started.is_none() {
            let now = Instant::now();
            self.started = Some(now);
            self.period_start = Some(now);
        }
    }

    pub fn stop(&mut self) {
        self.stopped = Some(Instant::now());
    }

    pub fn update(&mut self, bytes: u64) {
        let now = Instant::now();
        self.start();
        self.total += bytes;
        self.period_bytes += bytes;

        let period_start = *self.period_start.get_or_insert(now);
        let elapsed = now.duration_since(period_start);
        if elapsed > SPEED_WINDOW {
            self.period_speed = (self.period_bytes as f64 / elapsed.as_secs_f64()) as u64;
            self.period_bytes = 0;
            self.period_start = Some(now);
        }
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    /// Bytes per second over the last completed window.
    pub fn current_speed(&self) -> u64 {
        self.period_speed
    }

    /// Bytes per second since start, up to the stop time if stopped.
    pub fn average_speed(&self) -> u64 {
        let Some(started) = self.started else { return 0 };
        let end = self.stopped.unwrap_or_else(Instant::now);
        let secs = end.duration_since(started).as_secs_f64();
        if secs <= 0.0 {
            return 0;
        }
        (self.total as f64 / secs) as u64
    }
}

/// Bandwidth usage statistics
#[derive(Debug, Clone)]
pub struct BandwidthStats {
    pub bytes_uploaded: u64,
    pub bytes_downloaded: u64,
    pub upload_rate_current: u64,
    pub download_rate_current: u64,
    pub upload_rate_average: u64,
    pub download_rate_average: u64,
}

#[derive(Debug, Default)]
struct Totals {
    upload: BandwidthMonitor,
    download: BandwidthMonitor,
}

/// Node-wide limits and totals. Limits of `None` disable throttling for
/// that direction.
#[derive(Debug)]
pub struct BandwidthManager {
    upload_bucket: Option<TokenBucket>,
    download_bucket: Option<TokenBucket>,
    totals: Arc<Mutex<Totals>>,
}

impl BandwidthManager {
    pub fn new(upload_limit: Option<u64>, download_limit: Option<u64>) -> Self {
        if let Some(limit) = upload_limit {
            info!("Upload limited to {} bytes/sec", limit);
        }
        if let Some(limit) = download_limit {
            info!("Download limited to {} bytes/sec", limit);
        }
        Self {
            upload_bucket: upload_limit.filter(|l| *l > 0).map(TokenBucket::new),
            download_bucket: download_limit.filter(|l| *l > 0).map(TokenBucket::new),
            totals: Arc::new(Mutex::new(Totals::default())),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(None, None)
    }

    pub async fn request_upload_quota(&self, bytes: u64) {
        if let Some(bucket) = &self.upload_bucket {
            bucket.consume(bytes).await;
        }
        self.totals.lock().upload.update(bytes);
    }

    pub async fn request_download_quota(&self, bytes: u64) {
        if let Some(bucket) = &self.download_bucket {
            bucket.consume(bytes).await;
        }
        self.totals.lock().download.update(bytes);
    }

    pub fn stats(&self) -> BandwidthStats {
        let totals = self.totals.lock();
        BandwidthStats {
            bytes_uploaded: totals.upload.total(),
            bytes_downloaded: totals.download.total(),
            upload_rate_current: totals.upload.current_speed(),
            download_rate_current: totals.download.current_speed(),
            upload_rate_average: totals.upload.average_speed(),
            download_rate_average: totals.download.average_speed(),
        }
    }

    pub fn upload_available(&self) -> u64 {
        self.upload_bucket
            .as_ref()
            .map(TokenBucket::available_tokens)
            .unwrap_or(u64::MAX)
    }

    pub fn download_available(&self) -> u64 {
        self.download_bucket
            .as_ref()
            .map(TokenBucket::available_tokens)
            .unwrap_or(u64::MAX)
    }

    /// Log transfer totals every `period` until the handle is aborted.
    pub fn start_stats_reporter(&self, period: Duration) -> tokio::task::JoinHandle<()> {
        let totals = self.totals.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let (up, down, up_total, down_total) = {
                    let t = totals.lock();
                    (
                        t.upload.current_speed(),
                        t.download.current_speed(),
                        t.upload.total(),
                        t.download.total(),
                    )
                };
                if up_total == 0 && down_total == 0 {
                    continue;
                }
                info!(
                    "Bandwidth - up: {:.2} KB/s ({:.2} MB total), down: {:.2} KB/s ({:.2} MB total)",
                    up as f64 / 1024.0,
                    up_total as f64 / 1_048_576.0,
                    down as f64 / 1024.0,
                    down_total as f64 / 1_048_576.0
                );
            }
        })
    }
}
