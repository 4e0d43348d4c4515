//! Track synchronizer
//!
//! Each conversion track reports its last-emitted timestamp; no track may
//! run more than five seconds ahead of the slowest active track. A track
//! that gets ahead awaits a wake-up that fires when the slow track catches
//! up or finishes.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::Notify;

use crate::error::{Error, Result};

/// Maximum lead of any track over the slowest active track, seconds
const MAX_LEAD: f64 = 5.0;

#[derive(Default)]
struct SyncState {
  /// Last reported timestamp per active track
  timestamps: HashMap<u32, f64>,
  canceled: bool,
}

/// Coordinates multiple per-track conversion loops
#[derive(Default)]
pub struct TrackSynchronizer {
  state: Mutex<SyncState>,
  advanced: Notify,
}

impl TrackSynchronizer {
  pub fn new() -> Self {
    Self::default()
  }

  /// Announce a track before its loop starts
  pub fn register(&self, track_id: u32) {
    let mut state = self.state.lock().expect("synchronizer lock");
    state.timestamps.insert(track_id, 0.0);
  }

  /// Report progress for a track, suspending while it is more than the
  /// allowed lead ahead of the slowest active track
  pub async fn report(&self, track_id: u32, timestamp: f64) -> Result<()> {
    loop {
      let wakeup = self.advanced.notified();
      {
        let mut state = self.state.lock().expect("synchronizer lock");
        if state.canceled {
          return Err(Error::Canceled);
        }
        state.timestamps.insert(track_id, timestamp);
        let slowest = state
          .timestamps
          .values()
          .fold(f64::INFINITY, |acc, &v| acc.min(v));
        if timestamp - slowest <= MAX_LEAD {
          drop(state);
          self.advanced.notify_waiters();
          return Ok(());
        }
      }
      wakeup.await;
    }
  }

  /// Remove a finished track so it no longer holds others back
  pub fn finish(&self, track_id: u32) {
    let mut state = self.state.lock().expect("synchronizer lock");
    state.timestamps.remove(&track_id);
    drop(state);
    self.advanced.notify_waiters();
  }

  /// Unblock every waiter with a cancellation error
  pub fn cancel(&self) {
    let mut state = self.state.lock().expect("synchronizer lock");
    state.canceled = true;
    drop(state);
    self.advanced.notify_waiters();
  }

  /// Average progress across active tracks, in `[0, 1]`
  pub fn progress(&self, total_duration: f64) -> f64 {
    if total_duration <= 0.0 {
      return 0.0;
    }
    let state = self.state.lock().expect("synchronizer lock");
    if state.timestamps.is_empty() {
      return 1.0;
    }
    let sum: f64 = state
      .timestamps
      .values()
      .map(|&t| (t / total_duration).min(1.0))
      .sum();
    sum / state.timestamps.len() as f64
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Arc;
  use std::time::Duration;

  #[tokio::test]
  async fn test_fast_track_waits_for_slow() {
    let sync = Arc::new(TrackSynchronizer::new());
    sync.register(1);
    sync.register(2);

    // Track 1 runs ahead to 10 s; must block until track 2 passes 5 s
    let fast = {
      let sync = sync.clone();
      tokio::spawn(async move { sync.report(1, 10.0).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!fast.is_finished());

    sync.report(2, 4.0).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!fast.is_finished());

    sync.report(2, 5.5).await.unwrap();
    fast.await.unwrap().unwrap();
  }

  #[tokio::test]
  async fn test_finish_releases_waiters() {
    let sync = Arc::new(TrackSynchronizer::new());
    sync.register(1);
    sync.register(2);
    let fast = {
      let sync = sync.clone();
      tokio::spawn(async move { sync.report(1, 20.0).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    sync.finish(2);
    fast.await.unwrap().unwrap();
  }

  #[tokio::test]
  async fn test_cancel_errors_waiters() {
    let sync = Arc::new(TrackSynchronizer::new());
    sync.register(1);
    sync.register(2);
    let fast = {
      let sync = sync.clone();
      tokio::spawn(async move { sync.report(1, 20.0).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    sync.cancel();
    assert!(matches!(fast.await.unwrap(), Err(Error::Canceled)));
  }

  #[tokio::test]
  async fn test_progress_averages() {
    let sync = TrackSynchronizer::new();
    sync.register(1);
    sync.register(2);
    sync.report(1, 5.0).await.unwrap();
    sync.report(2, 10.0).await.unwrap();
    assert!((sync.progress(10.0) - 0.75).abs() < 1e-9);
  }
}
