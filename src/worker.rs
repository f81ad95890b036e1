//! Background bounding-box worker.
//!
//! Pixel-extent scans are the one expensive analysis this crate offloads: the
//! buffer is *moved* into a request message (no shared memory with the worker
//! beyond the transfer), the worker scans it on its own thread, and the
//! result comes back tagged with the request's correlation id.  The
//! [`WorkerProxy`] owns the pending-request table and is only ever touched
//! from the main thread — responses are delivered as main-thread callbacks
//! when the engine pumps the channel, never as concurrent writers.

use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::thread::JoinHandle;
use std::time::Instant;

use image::RgbaImage;
use rayon::prelude::*;
use serde_json::json;
use uuid::Uuid;

use crate::state::PixelRect;

// ============================================================================
// WIRE PROTOCOL
// ============================================================================

/// Requests the main thread sends to the worker.  The pixel buffer moves
/// with the message; the caller cannot touch it afterwards.
pub enum WorkerRequest {
    GetBbox {
        id: Uuid,
        buffer: RgbaImage,
        /// Minimum alpha for a pixel to count as content (at least 1).
        alpha_threshold: u8,
    },
    Shutdown,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerLogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl WorkerLogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkerLogLevel::Debug => "DEBUG",
            WorkerLogLevel::Info => "INFO",
            WorkerLogLevel::Warn => "WARN",
            WorkerLogLevel::Error => "ERROR",
        }
    }
}

/// Responses the worker sends back.
pub enum WorkerResponse {
    /// Extent result for a request.  `None` means the buffer had no pixel
    /// above the alpha threshold — a fully empty region, not an error.
    Extents {
        id: Uuid,
        extents: Option<PixelRect>,
    },
    /// The worker's internal log records, relayed into the host logger.
    Log {
        level: WorkerLogLevel,
        message: String,
        context: Option<serde_json::Value>,
    },
}

/// How a pending request was completed.
#[derive(Debug)]
pub enum ExtentOutcome {
    /// The worker answered.  `None` = fully empty region.
    Computed(Option<PixelRect>),
    /// The worker went away before answering; pending requests are failed
    /// rather than left to hang.
    TransportFailed,
}

type ExtentCallback = Box<dyn FnOnce(ExtentOutcome)>;

struct PendingExtentRequest {
    /// Diagnostic label (usually the requesting entity id).
    label: String,
    callback: ExtentCallback,
}

// ============================================================================
// MAIN-THREAD PROXY
// ============================================================================

pub struct WorkerProxy {
    tx: Sender<WorkerRequest>,
    rx: Receiver<WorkerResponse>,
    pending: HashMap<Uuid, PendingExtentRequest>,
    handle: Option<JoinHandle<()>>,
    transport_failed: bool,
}

impl WorkerProxy {
    /// Spawn the worker thread and return the main-thread handle to it.
    pub fn spawn() -> Self {
        let (req_tx, req_rx) = mpsc::channel::<WorkerRequest>();
        let (resp_tx, resp_rx) = mpsc::channel::<WorkerResponse>();
        let handle = std::thread::Builder::new()
            .name("extent-worker".into())
            .spawn(move || worker_loop(req_rx, resp_tx))
            .ok();
        if handle.is_none() {
            crate::log_err!("extent worker thread failed to spawn");
        }
        Self {
            tx: req_tx,
            rx: resp_rx,
            pending: HashMap::new(),
            handle,
            transport_failed: false,
        }
    }

    /// Test seam: a proxy wired to caller-held channels, no thread.
    #[cfg(test)]
    fn with_channels(tx: Sender<WorkerRequest>, rx: Receiver<WorkerResponse>) -> Self {
        Self {
            tx,
            rx,
            pending: HashMap::new(),
            handle: None,
            transport_failed: false,
        }
    }

    /// Issue an extent request.  Generates a fresh correlation id, records
    /// the completion callback, and moves the buffer to the worker.  The
    /// callback fires later, on the main thread, from [`pump`](Self::pump).
    pub fn request_extents(
        &mut self,
        buffer: RgbaImage,
        alpha_threshold: u8,
        label: &str,
        callback: impl FnOnce(ExtentOutcome) + 'static,
    ) -> Uuid {
        let id = Uuid::new_v4();
        if self.transport_failed {
            // Worker already gone: fail fast instead of parking the entry.
            callback(ExtentOutcome::TransportFailed);
            return id;
        }
        self.pending.insert(
            id,
            PendingExtentRequest {
                label: label.to_string(),
                callback: Box::new(callback),
            },
        );
        let send = self.tx.send(WorkerRequest::GetBbox {
            id,
            buffer,
            alpha_threshold,
        });
        if send.is_err() {
            crate::log_err!("extent worker unreachable, failing request {}", id);
            self.fail_all_pending();
        }
        id
    }

    /// Drain all queued responses without blocking, resolving callbacks by
    /// correlation id.  Responses with unknown ids are dropped (a stale
    /// worker may answer after its requests were already failed).
    pub fn pump(&mut self) {
        loop {
            match self.rx.try_recv() {
                Ok(WorkerResponse::Extents { id, extents }) => {
                    match self.pending.remove(&id) {
                        Some(entry) => (entry.callback)(ExtentOutcome::Computed(extents)),
                        None => {
                            crate::log_warn!("dropping extents for unknown request {}", id);
                        }
                    }
                }
                Ok(WorkerResponse::Log {
                    level,
                    message,
                    context,
                }) => match context {
                    Some(ctx) => crate::logger::write_with(level.as_str(), &message, &ctx),
                    None => crate::logger::write(level.as_str(), &message),
                },
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.fail_all_pending();
                    break;
                }
            }
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Ask the worker to exit and wait for it.  Outstanding requests are
    /// failed with [`ExtentOutcome::TransportFailed`].
    pub fn detach(&mut self) {
        let _ = self.tx.send(WorkerRequest::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        self.fail_all_pending();
    }

    fn fail_all_pending(&mut self) {
        if !self.transport_failed && !self.pending.is_empty() {
            crate::log_err!(
                "extent worker transport failed, {} pending request(s) rejected",
                self.pending.len()
            );
        }
        self.transport_failed = true;
        for (id, entry) in self.pending.drain() {
            crate::logger::write_with(
                "WARN",
                "pending extent request failed",
                &json!({ "request": id.to_string(), "label": entry.label }),
            );
            (entry.callback)(ExtentOutcome::TransportFailed);
        }
    }
}

impl Drop for WorkerProxy {
    fn drop(&mut self) {
        self.detach();
    }
}

// ============================================================================
// WORKER SIDE
// ============================================================================

fn worker_loop(rx: Receiver<WorkerRequest>, tx: Sender<WorkerResponse>) {
    while let Ok(request) = rx.recv() {
        match request {
            WorkerRequest::GetBbox {
                id,
                buffer,
                alpha_threshold,
            } => {
                let started = Instant::now();
                let extents = scan_extents(&buffer, alpha_threshold);
                let _ = tx.send(WorkerResponse::Log {
                    level: WorkerLogLevel::Debug,
                    message: "extent scan complete".to_string(),
                    context: Some(json!({
                        "request": id.to_string(),
                        "width": buffer.width(),
                        "height": buffer.height(),
                        "elapsed_ms": started.elapsed().as_millis() as u64,
                    })),
                });
                if tx.send(WorkerResponse::Extents { id, extents }).is_err() {
                    // Proxy gone; nothing left to do.
                    break;
                }
            }
            WorkerRequest::Shutdown => break,
        }
    }
}

/// Smallest rectangle enclosing all pixels with alpha at or above the
/// threshold, or `None` when there are none.  Rows scan in parallel.
fn scan_extents(buffer: &RgbaImage, alpha_threshold: u8) -> Option<PixelRect> {
    let width = buffer.width() as usize;
    if width == 0 || buffer.height() == 0 {
        return None;
    }
    let threshold = alpha_threshold.max(1);
    let stride = width * 4;
    let spans: Vec<(u32, u32, u32)> = buffer
        .as_raw()
        .par_chunks_exact(stride)
        .enumerate()
        .filter_map(|(y, row)| {
            let mut min_x: Option<u32> = None;
            let mut max_x = 0u32;
            for x in 0..width {
                if row[x * 4 + 3] >= threshold {
                    if min_x.is_none() {
                        min_x = Some(x as u32);
                    }
                    max_x = x as u32;
                }
            }
            min_x.map(|mn| (y as u32, mn, max_x))
        })
        .collect();
    let first = spans.first()?;
    let last = spans.last()?;
    let min_y = first.0;
    let max_y = last.0;
    let min_x = spans.iter().map(|s| s.1).min()?;
    let max_x = spans.iter().map(|s| s.2).max()?;
    Some(PixelRect::new(
        min_x as i32,
        min_y as i32,
        max_x - min_x + 1,
        max_y - min_y + 1,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::time::Duration;

    fn buffer_with_dot(w: u32, h: u32, x: u32, y: u32) -> RgbaImage {
        let mut img = RgbaImage::new(w, h);
        img.put_pixel(x, y, Rgba([255, 255, 255, 255]));
        img
    }

    #[test]
    fn scan_finds_single_pixel() {
        let img = buffer_with_dot(32, 32, 5, 9);
        assert_eq!(scan_extents(&img, 1), Some(PixelRect::new(5, 9, 1, 1)));
    }

    #[test]
    fn scan_empty_buffer_is_none() {
        let img = RgbaImage::new(16, 16);
        assert_eq!(scan_extents(&img, 1), None);
    }

    #[test]
    fn scan_spans_multiple_rows() {
        let mut img = RgbaImage::new(32, 32);
        img.put_pixel(2, 3, Rgba([0, 0, 0, 255]));
        img.put_pixel(20, 17, Rgba([0, 0, 0, 255]));
        assert_eq!(scan_extents(&img, 1), Some(PixelRect::new(2, 3, 19, 15)));
    }

    #[test]
    fn scan_respects_alpha_threshold() {
        let mut img = RgbaImage::new(8, 8);
        img.put_pixel(1, 1, Rgba([0, 0, 0, 10]));
        img.put_pixel(4, 4, Rgba([0, 0, 0, 200]));
        assert_eq!(scan_extents(&img, 128), Some(PixelRect::new(4, 4, 1, 1)));
    }

    #[test]
    fn round_trip_through_real_worker() {
        let mut proxy = WorkerProxy::spawn();
        let results: Rc<RefCell<Vec<(usize, Option<PixelRect>)>>> =
            Rc::new(RefCell::new(Vec::new()));
        for i in 0..4u32 {
            let results = Rc::clone(&results);
            let idx = i as usize;
            proxy.request_extents(
                buffer_with_dot(16, 16, i, i),
                1,
                &format!("req-{}", i),
                move |outcome| match outcome {
                    ExtentOutcome::Computed(e) => results.borrow_mut().push((idx, e)),
                    ExtentOutcome::TransportFailed => panic!("worker should be alive"),
                },
            );
        }
        // Poll until the worker has answered everything (bounded wait).
        let deadline = Instant::now() + Duration::from_secs(5);
        while proxy.pending_len() > 0 {
            assert!(Instant::now() < deadline, "worker did not answer in time");
            proxy.pump();
            std::thread::sleep(Duration::from_millis(5));
        }
        let mut got = results.borrow().clone();
        got.sort_by_key(|(idx, _)| *idx);
        assert_eq!(got.len(), 4);
        for (idx, extents) in got {
            assert_eq!(
                extents,
                Some(PixelRect::new(idx as i32, idx as i32, 1, 1)),
                "request {} must resolve with its own payload",
                idx
            );
        }
        assert_eq!(proxy.pending_len(), 0);
    }

    #[test]
    fn reverse_order_responses_resolve_without_cross_talk() {
        let (req_tx, req_rx) = mpsc::channel();
        let (resp_tx, resp_rx) = mpsc::channel();
        let mut proxy = WorkerProxy::with_channels(req_tx, resp_rx);

        let results: Rc<RefCell<Vec<(usize, Option<PixelRect>)>>> =
            Rc::new(RefCell::new(Vec::new()));
        let mut ids = Vec::new();
        for i in 0..5usize {
            let results = Rc::clone(&results);
            let id = proxy.request_extents(
                RgbaImage::new(1, 1),
                1,
                &format!("req-{}", i),
                move |outcome| match outcome {
                    ExtentOutcome::Computed(e) => results.borrow_mut().push((i, e)),
                    ExtentOutcome::TransportFailed => panic!("no transport failure expected"),
                },
            );
            ids.push(id);
        }
        assert_eq!(proxy.pending_len(), 5);
        // Answer in reverse order, each with a payload tied to its index.
        for (i, id) in ids.iter().enumerate().rev() {
            resp_tx
                .send(WorkerResponse::Extents {
                    id: *id,
                    extents: Some(PixelRect::new(i as i32, 0, 1, 1)),
                })
                .unwrap();
        }
        proxy.pump();
        assert_eq!(proxy.pending_len(), 0, "table must drain completely");
        for (i, extents) in results.borrow().iter() {
            assert_eq!(
                *extents,
                Some(PixelRect::new(*i as i32, 0, 1, 1)),
                "callback {} received another request's payload",
                i
            );
        }
        // Keep the request channel alive until the end of the test.
        drop(req_rx);
    }

    #[test]
    fn unknown_response_ids_are_dropped() {
        let (req_tx, req_rx) = mpsc::channel();
        let (resp_tx, resp_rx) = mpsc::channel();
        let mut proxy = WorkerProxy::with_channels(req_tx, resp_rx);
        resp_tx
            .send(WorkerResponse::Extents {
                id: Uuid::new_v4(),
                extents: None,
            })
            .unwrap();
        proxy.pump();
        assert_eq!(proxy.pending_len(), 0);
        drop(req_rx);
    }

    #[test]
    fn transport_failure_fails_all_pending() {
        let (req_tx, req_rx) = mpsc::channel();
        let (resp_tx, resp_rx) = mpsc::channel();
        let mut proxy = WorkerProxy::with_channels(req_tx, resp_rx);
        let failed = Rc::new(RefCell::new(0usize));
        for i in 0..3usize {
            let failed = Rc::clone(&failed);
            proxy.request_extents(
                RgbaImage::new(1, 1),
                1,
                &format!("req-{}", i),
                move |outcome| {
                    assert!(matches!(outcome, ExtentOutcome::TransportFailed));
                    *failed.borrow_mut() += 1;
                },
            );
        }
        drop(resp_tx); // worker dies without answering
        proxy.pump();
        assert_eq!(*failed.borrow(), 3);
        assert_eq!(proxy.pending_len(), 0);
        // Later requests fail immediately instead of parking.
        let failed2 = Rc::clone(&failed);
        proxy.request_extents(RgbaImage::new(1, 1), 1, "late", move |outcome| {
            assert!(matches!(outcome, ExtentOutcome::TransportFailed));
            *failed2.borrow_mut() += 1;
        });
        assert_eq!(*failed.borrow(), 4);
        drop(req_rx);
    }
}
