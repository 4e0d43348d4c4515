//! Packet sink: a cold async iterator over a track's packets
//!
//! A pump task preloads packets ahead of the consumer, bounded by a queue
//! whose capacity adapts to the consumption rate over the last second
//! (minimum 2). When the queue is full the pump suspends on a dequeue
//! signal. Errors raised inside the pump are captured out-of-band and
//! re-raised at the next iterator step.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::Notify;

use crate::demux::PacketRetrievalOptions;
use crate::error::{Error, Result};
use crate::packet::EncodedPacket;
use crate::sink::SharedDemuxer;

const MIN_QUEUE_CAPACITY: usize = 2;
const RATE_WINDOW: Duration = Duration::from_secs(1);

/// Packet source for one track of a shared demuxer
pub struct PacketSink {
  demuxer: SharedDemuxer,
  track_id: u32,
}

struct PumpState {
  queue: VecDeque<EncodedPacket>,
  capacity: usize,
  /// Dequeue instants within the rate window, for adaptive capacity
  recent_dequeues: VecDeque<Instant>,
  done: bool,
  closed: bool,
  error: Option<Error>,
}

struct Shared {
  state: Mutex<PumpState>,
  not_empty: Notify,
  dequeued: Notify,
}

impl PacketSink {
  pub fn new(demuxer: SharedDemuxer, track_id: u32) -> Self {
    Self { demuxer, track_id }
  }

  pub fn track_id(&self) -> u32 {
    self.track_id
  }

  /// Start a cold iterator yielding packets in decode order.
  ///
  /// Iteration begins at the last key packet at or before `start` (or the
  /// track's first packet) so the stream is decodable from the first yield,
  /// and stops at the first key packet whose timestamp is at or past `end`.
  pub fn packets(
    &self,
    start: Option<f64>,
    end: Option<f64>,
    options: PacketRetrievalOptions,
  ) -> PacketIter {
    let shared = Arc::new(Shared {
      state: Mutex::new(PumpState {
        queue: VecDeque::new(),
        capacity: MIN_QUEUE_CAPACITY,
        recent_dequeues: VecDeque::new(),
        done: false,
        closed: false,
        error: None,
      }),
      not_empty: Notify::new(),
      dequeued: Notify::new(),
    });

    let pump_shared = shared.clone();
    let demuxer = self.demuxer.clone();
    let track_id = self.track_id;
    let handle = tokio::spawn(async move {
      let result = pump(demuxer, track_id, start, end, options, &pump_shared).await;
      let mut state = pump_shared.state.lock().expect("pump state lock");
      if let Err(err) = result {
        if !err.is_canceled() {
          state.error = Some(err);
        }
      }
      state.done = true;
      drop(state);
      pump_shared.not_empty.notify_one();
    });

    PacketIter {
      shared,
      handle: Some(handle),
    }
  }
}

/// The pump coroutine: reads decode-order packets and fills the queue
async fn pump(
  demuxer: SharedDemuxer,
  track_id: u32,
  start: Option<f64>,
  end: Option<f64>,
  options: PacketRetrievalOptions,
  shared: &Shared,
) -> Result<()> {
  let mut current = {
    let mut demuxer = demuxer.lock().await;
    match start {
      Some(t) => match demuxer.key_packet_at(track_id, t, options).await? {
        Some(packet) => Some(packet),
        None => demuxer.first_packet(track_id, options).await?,
      },
      None => demuxer.first_packet(track_id, options).await?,
    }
  };

  while let Some(packet) = current.take() {
    if let Some(end) = end {
      if packet.is_key() && packet.timestamp >= end {
        break;
      }
    }

    // Back-pressure: suspend until the consumer dequeues
    loop {
      {
        let mut state = shared.state.lock().expect("pump state lock");
        if state.closed {
          return Err(Error::Canceled);
        }
        if state.queue.len() < state.capacity {
          state.queue.push_back(packet.clone());
          break;
        }
      }
      shared.not_empty.notify_one();
      shared.dequeued.notified().await;
    }
    shared.not_empty.notify_one();

    current = {
      let mut demuxer = demuxer.lock().await;
      demuxer.next_packet(track_id, &packet, options).await?
    };
  }
  Ok(())
}

/// Cold async iterator over a track's packets
pub struct PacketIter {
  shared: Arc<Shared>,
  handle: Option<tokio::task::JoinHandle<()>>,
}

impl PacketIter {
  /// Next packet in decode order. Pump errors surface here, once.
  pub async fn next(&mut self) -> Result<Option<EncodedPacket>> {
    loop {
      {
        let mut state = self.shared.state.lock().expect("pump state lock");
        if let Some(packet) = state.queue.pop_front() {
          let now = Instant::now();
          state.recent_dequeues.push_back(now);
          while state
            .recent_dequeues
            .front()
            .is_some_and(|&t| now.duration_since(t) > RATE_WINDOW)
          {
            state.recent_dequeues.pop_front();
          }
          state.capacity = state.recent_dequeues.len().max(MIN_QUEUE_CAPACITY);
          drop(state);
          self.shared.dequeued.notify_one();
          return Ok(Some(packet));
        }
        if let Some(error) = state.error.take() {
          return Err(error);
        }
        if state.done || state.closed {
          return Ok(None);
        }
      }
      self.shared.not_empty.notified().await;
    }
  }

  /// Stop the pump and drop queued packets
  pub fn close(&mut self) {
    {
      let mut state = self.shared.state.lock().expect("pump state lock");
      state.closed = true;
      state.queue.clear();
    }
    self.shared.dequeued.notify_one();
    if let Some(handle) = self.handle.take() {
      handle.abort();
    }
  }
}

impl Drop for PacketIter {
  fn drop(&mut self) {
    self.close();
  }
}
