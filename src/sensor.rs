//! Bio-sensor and scan-history seams.
//!
//! The real sensor client (MQTT transport, its own wait/retry budget, row
//! persistence per attempt) lives behind [`BioSensorClient`]; the scan
//! history table behind [`ScanRecorder`]. The engine only needs two things:
//! "give me one valid reading or nothing" and "append this row".

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Mutex;

// ============================================================================
// Bio-sensor client
// ============================================================================

/// Produces one valid physiological reading for a bed, or times out.
///
/// Implementations block up to their configured
/// `initial_wait + retry_count * retry_interval` budget and are responsible
/// for recording one scan row per read attempt (including invalid ones).
#[async_trait]
pub trait BioSensorClient: Send + Sync {
    /// Returns the reading payload on success, `None` when no valid data
    /// was obtained within the budget.
    async fn get_valid_scan_data(
        &self,
        target_bed: &str,
        task_id: &str,
        bed_name: &str,
    ) -> Option<Value>;
}

// ============================================================================
// Scan recorder
// ============================================================================

/// One row of scan history. Written by sensor clients for real attempts and
/// by the engine for skipped or interrupted beds ("N/A" rows).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScanRow {
    pub task_id: String,
    pub location_id: String,
    pub bed_name: String,
    pub bpm: Option<i64>,
    pub rpm: Option<i64>,
    pub status: String,
    pub is_valid: bool,
    pub retry_count: u32,
    pub details: String,
    pub scanned_at: DateTime<Utc>,
}

impl ScanRow {
    /// An "N/A" row for a bed that never produced a reading.
    #[must_use]
    pub fn not_available(
        task_id: impl Into<String>,
        location_id: impl Into<String>,
        bed_name: impl Into<String>,
        details: impl Into<String>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            location_id: location_id.into(),
            bed_name: bed_name.into(),
            bpm: None,
            rpm: None,
            status: "N/A".to_string(),
            is_valid: false,
            retry_count: 0,
            details: details.into(),
            scanned_at: Utc::now(),
        }
    }
}

/// Append-only scan history.
#[async_trait]
pub trait ScanRecorder: Send + Sync {
    async fn append(&self, row: ScanRow);
}

/// In-memory recorder. Reference implementation for tests and single-process
/// deployments without a history database.
#[derive(Debug, Default)]
pub struct MemoryScanRecorder {
    rows: Mutex<Vec<ScanRow>>,
}

impl MemoryScanRecorder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all recorded rows, oldest first.
    #[must_use]
    pub fn rows(&self) -> Vec<ScanRow> {
        self.rows.lock().expect("scan recorder lock poisoned").clone()
    }
}

#[async_trait]
impl ScanRecorder for MemoryScanRecorder {
    async fn append(&self, row: ScanRow) {
        self.rows.lock().expect("scan recorder lock poisoned").push(row);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn recorder_appends_in_order() {
        let recorder = MemoryScanRecorder::new();
        recorder
            .append(ScanRow::not_available("t1", "B_101-1", "101-1", "skipped"))
            .await;
        recorder
            .append(ScanRow::not_available("t1", "B_102-1", "102-1", "skipped"))
            .await;

        let rows = recorder.rows();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].bed_name, "101-1");
        assert_eq!(rows[1].bed_name, "102-1");
        assert!(rows.iter().all(|r| !r.is_valid && r.status == "N/A"));
    }
}
