//! Guest conversion monitor
//!
//! Sits between virt-v2v and the pod's stdout: every line is echoed
//! unchanged (truncated if overlong) and parsed for disk copy progress,
//! which is served as `v2v_disk_transfers{disk_id}` on `/metrics`.

#![deny(missing_docs)]

pub mod progress;
pub mod reader;

use std::io::{BufRead, Write};
use std::sync::Arc;

use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use parking_lot::RwLock;
use tracing::{debug, info};

pub use progress::{DiskProgress, Event};
pub use reader::{BoundedLines, MAX_LINE};

/// Progress shared between the reader and the metrics endpoint
pub type SharedProgress = Arc<RwLock<DiskProgress>>;

/// Router serving `GET /metrics`
pub fn router(progress: SharedProgress) -> Router {
    Router::new()
        .route("/metrics", get(metrics))
        .with_state(progress)
}

async fn metrics(State(progress): State<SharedProgress>) -> impl IntoResponse {
    let body = progress.read().render();
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
}

/// Echo `input` to `output` while folding every line into `progress`
///
/// Returns the number of lines read.
pub fn pump<R: BufRead, W: Write>(
    input: R,
    mut output: W,
    progress: &SharedProgress,
) -> std::io::Result<u64> {
    let mut lines = BoundedLines::new(input, MAX_LINE);
    let mut count = 0;
    while let Some(line) = lines.next_line()? {
        output.write_all(&line)?;
        output.write_all(b"\n")?;
        output.flush()?;
        count += 1;

        let text = String::from_utf8_lossy(&line);
        match progress.write().observe(&text) {
            Some(Event::DiskStarted { disk, total }) => info!(disk, total, "copying disk"),
            Some(Event::Finished) => info!("conversion finishing"),
            Some(Event::Progress { disk, percent }) => debug!(disk, percent, "disk progress"),
            None => {}
        }
    }
    Ok(count)
}
