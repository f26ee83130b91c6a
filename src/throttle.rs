//! Per-user minimum interval between requests.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::debug;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

/// Entries idle for this many intervals are dropped by `cleanup`.
const RETAIN_INTERVALS: u32 = 10;

#[derive(Debug, Clone)]
pub struct Throttle {
    interval: Duration,
    last_seen: Arc<RwLock<HashMap<String, Instant>>>,
}

impl Throttle {
    /// A zero interval lets every request through.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_seen: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Records the request and returns whether it came at least one
    /// interval after the user's previous allowed request.
    pub async fn allow(&self, user_id: &str) -> bool {
        if self.interval.is_zero() {
            return true;
        }

        let now = Instant::now();
        let mut last_seen = self.last_seen.write().await;
        if let Some(last) = last_seen.get(user_id) {
            if now.duration_since(*last) < self.interval {
                return false;
            }
        }
        last_seen.insert(user_id.to_string(), now);
        true
    }

    /// Forgets users who have not been seen for a while.
    pub async fn cleanup(&self) -> usize {
        let horizon = self.interval * RETAIN_INTERVALS;
        let now = Instant::now();
        let mut last_seen = self.last_seen.write().await;
        let before = last_seen.len();
        last_seen.retain(|_, last| now.duration_since(*last) < horizon);
        before - last_seen.len()
    }

    pub async fn tracked(&self) -> usize {
        self.last_seen.read().await.len()
    }

    pub fn spawn_cleanup(&self, every: Duration) -> JoinHandle<()> {
        let throttle = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                let removed = throttle.cleanup().await;
                if removed > 0 {
                    debug!("Throttle cleanup dropped {} idle users", removed);
                }
            }
        })
    }
}
