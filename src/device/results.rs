//! Ordered dispatch of completed capture results

use std::sync::Mutex;
use std::time::Duration;

use tracing::debug;

use crate::error::{CameraError, Result};
use crate::hal::FrameNumber;
use crate::metadata::CameraMetadata;
use crate::request::ResultExtras;

/// One fully assembled capture result delivered to the caller.
#[derive(Debug, Clone)]
pub struct CaptureResult {
    pub extras: ResultExtras,
    pub metadata: CameraMetadata,
}

/// Publishes results to the caller-facing queue in strictly increasing
/// frame-number order. Reordering happens upstream (per-frame records
/// buffer their pieces until complete); a result arriving behind the last
/// dispatched frame is a contract violation, not something to reorder.
pub(crate) struct ResultDispatcher {
    tx: flume::Sender<CaptureResult>,
    rx: flume::Receiver<CaptureResult>,
    next_expected: Mutex<FrameNumber>,
}

impl ResultDispatcher {
    pub(crate) fn new() -> Self {
        let (tx, rx) = flume::unbounded();
        Self {
            tx,
            rx,
            next_expected: Mutex::new(0),
        }
    }

    /// Queue a result for the caller. Fails fatally on an ordering
    /// violation; the caller escalates to the device error state.
    pub(crate) fn dispatch(&self, result: CaptureResult) -> Result<()> {
        let mut next = self.next_expected.lock().unwrap();
        let frame = result.extras.frame_number;
        if frame < *next {
            return Err(CameraError::Fatal(format!(
                "result for frame {frame} dispatched after frame {}",
                *next
            )));
        }
        *next = frame + 1;
        debug!(frame, "dispatching capture result");
        // The receiver lives as long as the dispatcher; send cannot fail.
        let _ = self.tx.send(result);
        Ok(())
    }

    pub(crate) fn wait_for_next(&self, timeout: Duration) -> Result<CaptureResult> {
        self.rx
            .recv_timeout(timeout)
            .map_err(|_| CameraError::Timeout {
                what: "next capture result",
                after: timeout,
            })
    }

    pub(crate) fn receiver(&self) -> flume::Receiver<CaptureResult> {
        self.rx.clone()
    }

    pub(crate) fn reset(&self) {
        *self.next_expected.lock().unwrap() = 0;
        while self.rx.try_recv().is_ok() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(frame: FrameNumber) -> CaptureResult {
        CaptureResult {
            extras: ResultExtras {
                request_id: 0,
                frame_number: frame,
                burst_id: 0,
            },
            metadata: CameraMetadata::new(),
        }
    }

    #[test]
    fn in_order_dispatch_flows_through() {
        let d = ResultDispatcher::new();
        d.dispatch(result(0)).unwrap();
        d.dispatch(result(1)).unwrap();
        // Gaps are legal (failed frames never dispatch).
        d.dispatch(result(5)).unwrap();
        assert_eq!(d.wait_for_next(Duration::from_millis(10)).unwrap().extras.frame_number, 0);
    }

    #[test]
    fn regression_is_fatal() {
        let d = ResultDispatcher::new();
        d.dispatch(result(3)).unwrap();
        let err = d.dispatch(result(2)).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn wait_times_out_when_queue_empty() {
        let d = ResultDispatcher::new();
        assert!(matches!(
            d.wait_for_next(Duration::from_millis(10)),
            Err(CameraError::Timeout { .. })
        ));
    }
}
