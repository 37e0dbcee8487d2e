use std::sync::{Mutex, OnceLock};

/// Direction of a byte transfer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transfer {
    Download,
    Upload,
    Model,
}

type ProgressFn = Box<dyn Fn(Transfer, u64, u64) + Send + 'static>;

static TRANSFER_PROGRESS_CB: OnceLock<Mutex<Option<ProgressFn>>> = OnceLock::new();

pub fn set_transfer_progress_callback(cb: impl Fn(Transfer, u64, u64) + Send + 'static) {
    let slot = TRANSFER_PROGRESS_CB.get_or_init(|| Mutex::new(None));
    if let Ok(mut g) = slot.lock() {
        *g = Some(Box::new(cb));
    }
}

pub fn emit_transfer_progress(kind: Transfer, done: u64, total: u64) {
    tracing::trace!(?kind, done, total, "transfer progress");
    if let Some(m) = TRANSFER_PROGRESS_CB.get() {
        if let Ok(g) = m.lock() {
            if let Some(cb) = &*g {
                cb(kind, done, total);
            }
        }
    }
}
