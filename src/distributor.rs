//! Per-camera fan-out of captured frames.
//!
//! Each subscriber gets its own outlet with its own backpressure:
//!
//! - [`Delivery::Reliable`]: bounded queue; `publish` waits up to `max_wait`
//!   for room before dropping the frame (used for recording).
//! - [`Delivery::LatestWins`]: depth-1 slot; a new frame replaces an unread
//!   one and `publish` never waits (used for preview).
//!
//! Frames share their payload, so fan-out never copies pixel data.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender};

use crate::camera::Frame;

/// Backpressure policy of one subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Reliable { capacity: usize, max_wait: Duration },
    LatestWins,
}

#[derive(Debug, thiserror::Error)]
pub enum DistributorError {
    #[error("{camera}: subscriber '{label}' went away")]
    SubscriberClosed { camera: String, label: String },
}

/// Counters for one outlet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutletStats {
    pub label: String,
    pub delivered: u64,
    /// Reliable outlets: frames dropped after the bounded wait expired
    pub dropped: u64,
    /// Latest-wins outlets: unread frames replaced by a newer one
    pub overwritten: u64,
}

/// Depth-1 latest-wins buffer shared between a distributor and one reader.
#[derive(Debug, Default)]
pub struct LatestSlot {
    frame: Mutex<Option<Frame>>,
    overwritten: AtomicU64,
    closed: AtomicBool,
}

impl LatestSlot {
    /// Store `frame`, returning `true` if an unread frame was replaced.
    fn replace(&self, frame: Frame) -> bool {
        let mut slot = self.frame.lock().unwrap_or_else(|e| e.into_inner());
        let replaced = slot.replace(frame).is_some();
        if replaced {
            self.overwritten.fetch_add(1, Ordering::Relaxed);
        }
        replaced
    }

    /// Take the most recent unread frame, if any.
    pub fn take(&self) -> Option<Frame> {
        self.frame
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    /// Whether the producing distributor is gone.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn overwritten(&self) -> u64 {
        self.overwritten.load(Ordering::Relaxed)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Result of waiting on a [`Subscription`].
#[derive(Debug)]
pub enum Next {
    Frame(Frame),
    /// Nothing arrived in time
    Empty,
    /// The distributor is gone and everything it sent has been consumed
    Closed,
}

/// Reading end of an outlet.
#[derive(Debug)]
pub enum Subscription {
    Queue(Receiver<Frame>),
    Latest(Arc<LatestSlot>),
}

impl Subscription {
    /// Wait up to `timeout` for the next frame.
    ///
    /// Latest-wins subscriptions never wait: they return whatever is in the
    /// slot right now.
    pub fn recv_timeout(&self, timeout: Duration) -> Next {
        match self {
            Subscription::Queue(rx) => match rx.recv_timeout(timeout) {
                Ok(frame) => Next::Frame(frame),
                Err(RecvTimeoutError::Timeout) => Next::Empty,
                Err(RecvTimeoutError::Disconnected) => Next::Closed,
            },
            Subscription::Latest(slot) => match slot.take() {
                Some(frame) => Next::Frame(frame),
                None if slot.is_closed() => Next::Closed,
                None => Next::Empty,
            },
        }
    }
}

#[derive(Debug)]
enum Sink {
    Queue { tx: Sender<Frame>, max_wait: Duration },
    Latest(Arc<LatestSlot>),
}

#[derive(Debug)]
struct Outlet {
    label: String,
    sink: Sink,
    delivered: u64,
    dropped: u64,
}

/// Fan-out point for one camera's frames.
///
/// Owned by the capture worker, the single producer.
#[derive(Debug)]
pub struct FrameDistributor {
    camera: String,
    outlets: Vec<Outlet>,
}

impl FrameDistributor {
    pub fn new(camera: impl Into<String>) -> Self {
        Self {
            camera: camera.into(),
            outlets: Vec::new(),
        }
    }

    pub fn subscribe(&mut self, label: impl Into<String>, delivery: Delivery) -> Subscription {
        let (sink, subscription) = match delivery {
            Delivery::Reliable { capacity, max_wait } => {
                let (tx, rx) = bounded(capacity.max(1));
                (Sink::Queue { tx, max_wait }, Subscription::Queue(rx))
            }
            Delivery::LatestWins => {
                let slot = Arc::new(LatestSlot::default());
                (
                    Sink::Latest(Arc::clone(&slot)),
                    Subscription::Latest(slot),
                )
            }
        };
        self.outlets.push(Outlet {
            label: label.into(),
            sink,
            delivered: 0,
            dropped: 0,
        });
        subscription
    }

    /// Hand `frame` to every subscriber.
    ///
    /// Latest-wins outlets are served first so a reliable outlet's bounded
    /// wait never delays the preview. Fails when a reliable subscriber has
    /// hung up.
    pub fn publish(&mut self, frame: Frame) -> Result<(), DistributorError> {
        for outlet in self.outlets.iter_mut() {
            if let Sink::Latest(slot) = &outlet.sink {
                slot.replace(frame.clone());
                outlet.delivered += 1;
            }
        }

        for outlet in self.outlets.iter_mut() {
            let Sink::Queue { tx, max_wait } = &outlet.sink else {
                continue;
            };
            match tx.send_timeout(frame.clone(), *max_wait) {
                Ok(()) => outlet.delivered += 1,
                Err(SendTimeoutError::Timeout(dropped)) => {
                    outlet.dropped += 1;
                    log::warn!(
                        "{}: {} queue full for {:?}, dropped frame {}",
                        self.camera,
                        outlet.label,
                        max_wait,
                        dropped.sequence_number
                    );
                }
                Err(SendTimeoutError::Disconnected(_)) => {
                    return Err(DistributorError::SubscriberClosed {
                        camera: self.camera.clone(),
                        label: outlet.label.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Frames dropped by reliable outlets so far.
    pub fn dropped(&self) -> u64 {
        self.outlets.iter().map(|o| o.dropped).sum()
    }

    pub fn stats(&self) -> Vec<OutletStats> {
        self.outlets
            .iter()
            .map(|o| OutletStats {
                label: o.label.clone(),
                delivered: o.delivered,
                dropped: o.dropped,
                overwritten: match &o.sink {
                    Sink::Latest(slot) => slot.overwritten(),
                    Sink::Queue { .. } => 0,
                },
            })
            .collect()
    }
}

impl Drop for FrameDistributor {
    fn drop(&mut self) {
        for outlet in &self.outlets {
            if let Sink::Latest(slot) = &outlet.sink {
                slot.close();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::StreamFormat;
    use std::time::Instant;

    fn frame(seq: u64) -> Frame {
        Frame::new(
            Arc::from("cam"),
            seq,
            Instant::now(),
            StreamFormat::default(),
            vec![seq as u8; 4],
        )
    }

    fn seq(next: Next) -> Option<u64> {
        match next {
            Next::Frame(f) => Some(f.sequence_number),
            _ => None,
        }
    }

    #[test]
    fn test_latest_wins_keeps_only_newest() {
        let mut dist = FrameDistributor::new("cam");
        let preview = dist.subscribe("preview", Delivery::LatestWins);
        for i in 0..5 {
            dist.publish(frame(i)).unwrap();
        }
        assert_eq!(seq(preview.recv_timeout(Duration::ZERO)), Some(4));
        assert!(matches!(preview.recv_timeout(Duration::ZERO), Next::Empty));
        assert_eq!(dist.stats()[0].overwritten, 4);
        assert_eq!(dist.stats()[0].delivered, 5);
    }

    #[test]
    fn test_reliable_preserves_order() {
        let mut dist = FrameDistributor::new("cam");
        let rec = dist.subscribe(
            "recording",
            Delivery::Reliable {
                capacity: 16,
                max_wait: Duration::from_millis(10),
            },
        );
        for i in 0..10 {
            dist.publish(frame(i)).unwrap();
        }
        drop(dist);
        let mut got = Vec::new();
        while let Next::Frame(f) = rec.recv_timeout(Duration::from_millis(10)) {
            got.push(f.sequence_number);
        }
        assert_eq!(got, (0..10).collect::<Vec<_>>());
        assert!(matches!(
            rec.recv_timeout(Duration::from_millis(1)),
            Next::Closed
        ));
    }

    #[test]
    fn test_reliable_drops_after_bounded_wait() {
        let mut dist = FrameDistributor::new("cam");
        let _rec = dist.subscribe(
            "recording",
            Delivery::Reliable {
                capacity: 2,
                max_wait: Duration::from_millis(5),
            },
        );
        let start = Instant::now();
        for i in 0..4 {
            dist.publish(frame(i)).unwrap();
        }
        assert_eq!(dist.dropped(), 2);
        assert!(start.elapsed() >= Duration::from_millis(10));
    }

    #[test]
    fn test_full_reliable_queue_does_not_starve_preview() {
        let mut dist = FrameDistributor::new("cam");
        let _rec = dist.subscribe(
            "recording",
            Delivery::Reliable {
                capacity: 1,
                max_wait: Duration::from_millis(1),
            },
        );
        let preview = dist.subscribe("preview", Delivery::LatestWins);
        for i in 0..3 {
            dist.publish(frame(i)).unwrap();
        }
        assert_eq!(seq(preview.recv_timeout(Duration::ZERO)), Some(2));
    }

    #[test]
    fn test_closed_reliable_subscriber_is_an_error() {
        let mut dist = FrameDistributor::new("cam");
        let rec = dist.subscribe(
            "recording",
            Delivery::Reliable {
                capacity: 4,
                max_wait: Duration::from_millis(5),
            },
        );
        drop(rec);
        let err = dist.publish(frame(0)).unwrap_err();
        assert!(err.to_string().contains("recording"));
    }

    #[test]
    fn test_dropped_preview_subscription_is_ignored() {
        let mut dist = FrameDistributor::new("cam");
        let preview = dist.subscribe("preview", Delivery::LatestWins);
        drop(preview);
        assert!(dist.publish(frame(0)).is_ok());
    }

    #[test]
    fn test_dropping_distributor_closes_latest_slot() {
        let mut dist = FrameDistributor::new("cam");
        let preview = dist.subscribe("preview", Delivery::LatestWins);
        dist.publish(frame(7)).unwrap();
        drop(dist);
        assert_eq!(seq(preview.recv_timeout(Duration::ZERO)), Some(7));
        assert!(matches!(preview.recv_timeout(Duration::ZERO), Next::Closed));
    }
}
