pub mod bootstrap;
pub mod commands;
pub mod melody_inbox;
pub mod movement_repository;
pub mod sync;
pub mod task_repository;
pub mod tempo;

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub type NowProvider = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_id(prefix: &str) -> String {
    let sequence = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}-{}-{sequence}", Utc::now().timestamp_micros())
}

pub(crate) fn system_now() -> NowProvider {
    Arc::new(Utc::now)
}
