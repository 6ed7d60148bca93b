//! Tracking of open streaming response bodies.
//!
//! Every streamed query response registers itself here; closing (or
//! dropping) the reader releases the record. Test harnesses enable
//! tracking up front and call [`report_open_responses`] at shutdown to
//! catch readers that were never released. The registry is always
//! compiled in; its cost is one mutex-guarded insert per response.

use std::backtrace::Backtrace;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

static TRACKING_ENABLED: AtomicBool = AtomicBool::new(false);
static NEXT_ID: AtomicU64 = AtomicU64::new(1);
static OPEN_RESPONSES: Mutex<Vec<OpenResponse>> = Mutex::new(Vec::new());

struct OpenResponse {
    id: u64,
    opened_at: String,
}

/// Enables tracking of streamed response bodies.
pub fn enable_response_tracking() {
    TRACKING_ENABLED.store(true, Ordering::SeqCst);
}

/// Logs every response body that is still open and returns `true` when
/// none are outstanding.
pub fn report_open_responses() -> bool {
    let open = OPEN_RESPONSES.lock().expect("leak registry poisoned");
    if open.is_empty() {
        tracing::debug!("no leaked response bodies");

        return true;
    }

    tracing::error!(count = open.len(), "found leaked response bodies");

    for record in open.iter() {
        tracing::error!(id = record.id, "leaked response opened at:\n{}", record.opened_at);
    }

    false
}

/// Handle owned by a streaming response; releasing it (or dropping it)
/// removes the registry record.
#[derive(Debug)]
pub(crate) struct BodyTracker {
    id: Option<u64>,
}

impl BodyTracker {
    pub(crate) fn register() -> BodyTracker {
        if !TRACKING_ENABLED.load(Ordering::SeqCst) {
            return BodyTracker { id: None };
        }

        let id = NEXT_ID.fetch_add(1, Ordering::SeqCst);
        let record = OpenResponse {
            id,
            opened_at: Backtrace::force_capture().to_string(),
        };

        OPEN_RESPONSES
            .lock()
            .expect("leak registry poisoned")
            .push(record);

        BodyTracker { id: Some(id) }
    }

    pub(crate) fn release(&mut self) {
        let Some(id) = self.id.take() else {
            return;
        };

        let mut open = OPEN_RESPONSES.lock().expect("leak registry poisoned");
        if let Some(idx) = open.iter().position(|r| r.id == id) {
            open.remove(idx);
        }
    }
}

impl Drop for BodyTracker {
    fn drop(&mut self) {
        self.release();
    }
}
