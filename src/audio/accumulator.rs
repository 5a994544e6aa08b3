//! Frame accumulator
//!
//! Reassembles arbitrarily sized deliveries into fixed-size analysis
//! frames. Reaching the target size flips the frame to ready and posts
//! exactly one notification on a single-slot channel; the next fill cycle
//! starts after `pop`.

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::error::BufferError;

/// Result of a push
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushOutcome {
    /// Bytes copied into the frame
    pub accepted: usize,
    /// True if this push completed the frame
    pub became_ready: bool,
}

/// Fixed-size frame assembler
pub struct FrameAccumulator {
    frame: Vec<u8>,
    cursor: usize,
    ready: bool,
    ready_tx: Sender<()>,
    ready_rx: Receiver<()>,
}

impl FrameAccumulator {
    /// Create an accumulator for frames of `target_frame_bytes`
    pub fn new(target_frame_bytes: usize) -> Result<Self, BufferError> {
        if target_frame_bytes == 0 {
            return Err(BufferError::ZeroCapacity);
        }
        let (ready_tx, ready_rx) = bounded(1);
        Ok(Self {
            frame: vec![0; target_frame_bytes],
            cursor: 0,
            ready: false,
            ready_tx,
            ready_rx,
        })
    }

    /// Append `bytes` at the cursor
    ///
    /// Without `allow_partial_final_frame`, a push that would run past the
    /// target size is rejected and nothing is copied. With it, the bytes
    /// that fit are copied and the rest are left to the caller.
    pub fn push(
        &mut self,
        bytes: &[u8],
        allow_partial_final_frame: bool,
    ) -> Result<PushOutcome, BufferError> {
        let remaining = self.remaining();
        let accepted = if bytes.len() <= remaining {
            bytes.len()
        } else if allow_partial_final_frame {
            remaining
        } else {
            return Err(BufferError::FrameOverflow {
                len: bytes.len(),
                remaining,
                target: self.target_size(),
            });
        };

        self.frame[self.cursor..self.cursor + accepted].copy_from_slice(&bytes[..accepted]);
        self.cursor += accepted;

        let became_ready = !self.ready && self.cursor == self.frame.len();
        if became_ready {
            self.ready = true;
            // Slot may still hold an unobserved signal from a popped cycle
            let _ = self.ready_tx.try_send(());
        }

        Ok(PushOutcome {
            accepted,
            became_ready,
        })
    }

    /// Take the completed frame and start a new cycle
    pub fn pop(&mut self) -> Result<Vec<u8>, BufferError> {
        if !self.ready {
            return Err(BufferError::NotReady);
        }
        let target = self.target_size();
        let frame = std::mem::replace(&mut self.frame, vec![0; target]);
        self.cursor = 0;
        self.ready = false;
        // Drop a signal nobody waited for so the next cycle fires afresh
        let _ = self.ready_rx.try_recv();
        Ok(frame)
    }

    /// Take `size` bytes from the front regardless of readiness
    ///
    /// The remaining accumulated bytes shift to the front.
    pub fn pop_front(&mut self, size: usize) -> Result<Vec<u8>, BufferError> {
        if size > self.cursor {
            return Err(BufferError::InsufficientData {
                requested: size,
                available: self.cursor,
            });
        }
        let out = self.frame[..size].to_vec();
        self.frame.copy_within(size..self.cursor, 0);
        self.cursor -= size;
        if self.cursor < self.frame.len() && self.ready {
            self.ready = false;
            let _ = self.ready_rx.try_recv();
        }
        Ok(out)
    }

    /// Receiver of the one-shot readiness signal
    pub fn readiness(&self) -> Receiver<()> {
        self.ready_rx.clone()
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Bytes accumulated in the current cycle
    pub fn len(&self) -> usize {
        self.cursor
    }

    pub fn is_empty(&self) -> bool {
        self.cursor == 0
    }

    pub fn remaining(&self) -> usize {
        self.frame.len() - self.cursor
    }

    pub fn target_size(&self) -> usize {
        self.frame.len()
    }

    /// Discard accumulated bytes
    pub fn reset(&mut self) {
        self.cursor = 0;
        self.ready = false;
        let _ = self.ready_rx.try_recv();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_ready_fires_once_per_cycle() {
        let mut acc = FrameAccumulator::new(6).unwrap();
        let signal = acc.readiness();

        assert!(!acc.push(&[1, 2], false).unwrap().became_ready);
        assert!(signal.try_recv().is_err());
        assert!(!acc.push(&[3], false).unwrap().became_ready);
        let outcome = acc.push(&[4, 5, 6], false).unwrap();
        assert!(outcome.became_ready);
        assert_eq!(outcome.accepted, 3);

        assert!(signal.try_recv().is_ok());
        assert!(signal.try_recv().is_err());

        // Full frame rejects further bytes and does not re-fire
        assert!(acc.push(&[7], false).is_err());
        assert_eq!(acc.push(&[7], true).unwrap().accepted, 0);
        assert!(signal.try_recv().is_err());

        let frame = acc.pop().unwrap();
        assert_eq!(frame, vec![1, 2, 3, 4, 5, 6]);
        assert!(acc.is_empty());
        assert!(!acc.is_ready());
    }

    #[test]
    fn test_overflow_rejected_without_copy() {
        let mut acc = FrameAccumulator::new(4).unwrap();
        acc.push(&[1, 2, 3], false).unwrap();
        assert_eq!(
            acc.push(&[4, 5], false),
            Err(BufferError::FrameOverflow {
                len: 2,
                remaining: 1,
                target: 4
            })
        );
        assert_eq!(acc.len(), 3);
    }

    #[test]
    fn test_partial_final_frame() {
        let mut acc = FrameAccumulator::new(4).unwrap();
        acc.push(&[1, 2, 3], false).unwrap();
        let outcome = acc.push(&[4, 5], true).unwrap();
        assert_eq!(outcome.accepted, 1);
        assert!(outcome.became_ready);
        assert_eq!(acc.pop().unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_pop_before_ready_is_error() {
        let mut acc = FrameAccumulator::new(4).unwrap();
        acc.push(&[1], false).unwrap();
        assert_eq!(acc.pop(), Err(BufferError::NotReady));
        assert_eq!(acc.len(), 1);
    }

    #[test]
    fn test_pop_front_shifts_remainder() {
        let mut acc = FrameAccumulator::new(4).unwrap();
        acc.push(&[1, 2, 3, 4], false).unwrap();
        assert!(acc.is_ready());

        assert_eq!(acc.pop_front(3).unwrap(), vec![1, 2, 3]);
        assert_eq!(acc.len(), 1);
        assert!(!acc.is_ready());

        let signal = acc.readiness();
        acc.push(&[5, 6, 7], false).unwrap();
        assert!(signal.try_recv().is_ok());
        assert_eq!(acc.pop().unwrap(), vec![4, 5, 6, 7]);

        assert!(acc.pop_front(1).is_err());
    }

    #[test]
    fn test_unobserved_signal_does_not_leak() {
        let mut acc = FrameAccumulator::new(2).unwrap();
        let signal = acc.readiness();
        acc.push(&[1, 2], false).unwrap();
        acc.pop().unwrap();
        assert!(signal.try_recv().is_err());

        acc.push(&[3, 4], false).unwrap();
        assert!(signal.try_recv().is_ok());
    }

    fn partitioned_frame() -> impl Strategy<Value = (usize, Vec<usize>)> {
        (1usize..256).prop_flat_map(|target| {
            (
                Just(target),
                proptest::collection::vec(0..=target, 0..8),
            )
        })
    }

    proptest! {
        #[test]
        fn test_any_partition_signals_once((target, mut cuts) in partitioned_frame()) {
            cuts.push(0);
            cuts.push(target);
            cuts.sort_unstable();

            let mut acc = FrameAccumulator::new(target).unwrap();
            let signal = acc.readiness();
            let data: Vec<u8> = (0..target).map(|i| (i * 7) as u8).collect();

            let mut signals = 0;
            let mut ready_reports = 0;
            for pair in cuts.windows(2) {
                let outcome = acc.push(&data[pair[0]..pair[1]], false).unwrap();
                prop_assert_eq!(outcome.accepted, pair[1] - pair[0]);
                if outcome.became_ready {
                    ready_reports += 1;
                }
                signals += signal.try_iter().count();
            }

            prop_assert_eq!(ready_reports, 1);
            prop_assert_eq!(signals, 1);
            prop_assert_eq!(acc.pop().unwrap(), data);
        }
    }
}
