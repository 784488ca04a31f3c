//! Status endpoint payload.

use std::time::{Duration, Instant};

use chrono::{SecondsFormat, Utc};
use once_cell::sync::Lazy;
use serde::Serialize;

use ferry_core::{APP_NAME, VERSION};

/// Process details reported by the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessInfo {
    pub title: String,
    pub version: String,
    pub pid: u32,
    /// Seconds since the process started.
    pub uptime: f64,
}

/// Body of `GET {context_path}{route.status}`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub app: String,
    pub version: String,
    pub status_code: u16,
    pub status: String,
    /// RFC 3339 timestamp.
    pub time: String,
    pub process: ProcessInfo,
}

impl StatusReport {
    /// Builds a report for this process.
    pub fn collect() -> Self {
        Self {
            app: APP_NAME.to_string(),
            version: VERSION.to_string(),
            status_code: 200,
            status: "OK".to_string(),
            time: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            process: ProcessInfo {
                title: process_title(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                pid: std::process::id(),
                uptime: process_uptime().as_secs_f64(),
            },
        }
    }
}

static PROCESS_STARTED: Lazy<Instant> = Lazy::new(Instant::now);

/// Pins the process start time. Without a call the clock starts at the
/// first lifecycle controller or status report.
pub fn mark_process_start() {
    Lazy::force(&PROCESS_STARTED);
}

/// Time since [`mark_process_start`].
pub fn process_uptime() -> Duration {
    PROCESS_STARTED.elapsed()
}

fn process_title() -> String {
    std::env::args()
        .next()
        .as_deref()
        .and_then(|arg0| std::path::Path::new(arg0).file_name())
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| APP_NAME.to_string())
}
