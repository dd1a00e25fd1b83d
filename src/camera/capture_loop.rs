//! The blocking read loop of a capture worker.

use std::sync::Arc;
use std::time::Instant;

use super::capture::{StatusCell, WorkerOptions};
use super::device::{CaptureDevice, ReadOutcome};
use super::errors::CaptureError;
use super::types::Frame;
use crate::cancel::CancelToken;
use crate::distributor::FrameDistributor;

/// Why the capture loop returned.
#[derive(Debug)]
pub enum LoopExit {
    /// Stop was requested
    Cancelled,
    /// The recording subscriber hung up
    RecordingClosed,
    Failed(CaptureError),
}

/// Read buffers from `device` and publish them until cancelled or failed.
///
/// Every buffer the driver reports as lost or corrupt still consumes a
/// sequence number, so gaps in the recorded sequence always match a logged
/// skip. A read error after cancellation is a clean stop.
pub fn run_capture_loop(
    camera: &str,
    device: &mut dyn CaptureDevice,
    distributor: &mut FrameDistributor,
    status: &StatusCell,
    token: &CancelToken,
    options: &WorkerOptions,
) -> LoopExit {
    let name: Arc<str> = Arc::from(camera);
    let format = device.format().format;
    let mut next_sequence = 0u64;
    let mut consecutive_errors = 0u32;

    loop {
        if token.is_cancelled() {
            return LoopExit::Cancelled;
        }

        let outcome = match device.read() {
            Ok(outcome) => outcome,
            Err(e) => {
                if token.is_cancelled() {
                    log::debug!("{}: read interrupted by stop: {}", camera, e);
                    return LoopExit::Cancelled;
                }
                consecutive_errors += 1;
                if consecutive_errors >= options.max_consecutive_errors {
                    return LoopExit::Failed(CaptureError::TransientIo {
                        attempts: consecutive_errors,
                        message: e.to_string(),
                    });
                }
                log::warn!(
                    "{}: read failed ({}/{}): {}, retrying",
                    camera,
                    consecutive_errors,
                    options.max_consecutive_errors,
                    e
                );
                token.wait_timeout(options.retry_delay);
                continue;
            }
        };

        match outcome {
            ReadOutcome::TimedOut => continue,
            ReadOutcome::Corrupt {
                reason,
                dropped_before,
            } => {
                consecutive_errors = 0;
                skip_dropped(camera, &mut next_sequence, dropped_before, status);
                log::warn!(
                    "{}: skipped corrupt buffer at sequence {}: {}",
                    camera,
                    next_sequence,
                    reason
                );
                next_sequence += 1;
                status.update_stats(|s| s.frames_skipped += 1);
            }
            ReadOutcome::Buffer {
                data,
                dropped_before,
            } => {
                consecutive_errors = 0;
                skip_dropped(camera, &mut next_sequence, dropped_before, status);

                let sequence = next_sequence;
                let frame =
                    Frame::new(Arc::clone(&name), sequence, Instant::now(), format, data);
                next_sequence += 1;

                if let Err(e) = distributor.publish(frame) {
                    log::error!("{}: {}", camera, e);
                    return LoopExit::RecordingClosed;
                }
                let dropped = distributor.dropped();
                status.update_stats(|s| {
                    s.last_sequence = Some(sequence);
                    s.frames_captured += 1;
                    s.recording_dropped = dropped;
                });
            }
        }
    }
}

fn skip_dropped(camera: &str, next_sequence: &mut u64, dropped: u32, status: &StatusCell) {
    if dropped == 0 {
        return;
    }
    let first = *next_sequence;
    let last = first + u64::from(dropped) - 1;
    log::warn!(
        "{}: driver dropped {} buffer(s), skipping sequence {}..={}",
        camera,
        dropped,
        first,
        last
    );
    *next_sequence = last + 1;
    status.update_stats(|s| s.frames_skipped += u64::from(dropped));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::format::NegotiatedFormat;
    use crate::camera::types::{PixelFormat, Resolution, StreamFormat};
    use crate::distributor::{Delivery, Next};
    use std::collections::VecDeque;
    use std::io;
    use std::time::Duration;

    struct Scripted {
        steps: VecDeque<io::Result<ReadOutcome>>,
        token: CancelToken,
        cancel_when_empty: bool,
    }

    impl CaptureDevice for Scripted {
        fn format(&self) -> NegotiatedFormat {
            NegotiatedFormat::exact(StreamFormat::new(Resolution::VGA, 30, PixelFormat::Mjpeg))
        }

        fn read(&mut self) -> io::Result<ReadOutcome> {
            match self.steps.pop_front() {
                Some(step) => step,
                None => {
                    if self.cancel_when_empty {
                        self.token.cancel();
                    }
                    Ok(ReadOutcome::TimedOut)
                }
            }
        }
    }

    fn buffer(dropped_before: u32) -> io::Result<ReadOutcome> {
        Ok(ReadOutcome::Buffer {
            data: vec![1, 2, 3],
            dropped_before,
        })
    }

    fn io_error() -> io::Result<ReadOutcome> {
        Err(io::Error::new(io::ErrorKind::Other, "No such device"))
    }

    fn options() -> WorkerOptions {
        WorkerOptions {
            retry_delay: Duration::from_millis(1),
            ..WorkerOptions::default()
        }
    }

    fn run(steps: Vec<io::Result<ReadOutcome>>, cancel_when_empty: bool) -> (LoopExit, Vec<u64>, StatusCell) {
        let token = CancelToken::new();
        let mut device = Scripted {
            steps: steps.into(),
            token: token.clone(),
            cancel_when_empty,
        };
        let mut dist = FrameDistributor::new("cam");
        let sub = dist.subscribe(
            "recording",
            Delivery::Reliable {
                capacity: 64,
                max_wait: Duration::from_millis(10),
            },
        );
        let status = StatusCell::default();
        let exit = run_capture_loop("cam", &mut device, &mut dist, &status, &token, &options());
        drop(dist);
        let mut seqs = Vec::new();
        while let Next::Frame(f) = sub.recv_timeout(Duration::from_millis(1)) {
            seqs.push(f.sequence_number);
        }
        (exit, seqs, status)
    }

    #[test]
    fn test_sequence_gaps_follow_driver_drops() {
        let steps = vec![
            buffer(0),
            buffer(0),
            buffer(2),
            Ok(ReadOutcome::Corrupt {
                reason: "bytesused=0".to_string(),
                dropped_before: 0,
            }),
            buffer(0),
        ];
        let (exit, seqs, status) = run(steps, true);
        assert!(matches!(exit, LoopExit::Cancelled));
        assert_eq!(seqs, vec![0, 1, 4, 6]);
        let (_, stats) = status.snapshot();
        assert_eq!(stats.frames_captured, 4);
        assert_eq!(stats.frames_skipped, 3);
        assert_eq!(stats.last_sequence, Some(6));
    }

    #[test]
    fn test_isolated_errors_are_retried() {
        let steps = vec![buffer(0), io_error(), io_error(), buffer(0)];
        let (exit, seqs, _) = run(steps, true);
        assert!(matches!(exit, LoopExit::Cancelled));
        assert_eq!(seqs, vec![0, 1]);
    }

    #[test]
    fn test_persistent_errors_fail_the_loop() {
        let steps = vec![buffer(0), io_error(), io_error(), io_error()];
        let (exit, seqs, status) = run(steps, false);
        match exit {
            LoopExit::Failed(CaptureError::TransientIo { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected TransientIo, got {:?}", other),
        }
        assert_eq!(seqs, vec![0]);
        assert_eq!(status.snapshot().1.last_sequence, Some(0));
    }
}
