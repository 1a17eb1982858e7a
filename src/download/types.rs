// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Proxy lifecycle state and progress bookkeeping.

use std::time::Instant;

/// Lifecycle of a [`DownloadProxy`](super::DownloadProxy).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyState {
    /// Accepting operations.
    Active,
    /// Terminal. Any further operation is a programming error.
    Invalidated,
}

impl std::fmt::Display for ProxyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProxyState::Active => write!(f, "ACTIVE"),
            ProxyState::Invalidated => write!(f, "INVALIDATED"),
        }
    }
}

/// Running totals for one transfer, for display.
#[derive(Debug, Clone)]
pub struct TransferProgress {
    pub total_written: u64,
    pub total_expected: Option<u64>,
    started: Instant,
}

impl TransferProgress {
    pub fn new() -> Self {
        Self {
            total_written: 0,
            total_expected: None,
            started: Instant::now(),
        }
    }

    pub fn update(&mut self, total_written: u64, total_expected: Option<u64>) {
        self.total_written = total_written;
        if total_expected.is_some() {
            self.total_expected = total_expected;
        }
    }

    /// Progress percentage (0-100) if the total is known.
    pub fn percent(&self) -> Option<f64> {
        self.total_expected.map(|total| {
            if total == 0 {
                100.0
            } else {
                (self.total_written as f64 / total as f64 * 100.0).min(100.0)
            }
        })
    }

    /// Average speed since the transfer started.
    pub fn speed_bps(&self) -> Option<u64> {
        let elapsed = self.started.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            Some((self.total_written as f64 / elapsed) as u64)
        } else {
            None
        }
    }

    pub fn eta_seconds(&self) -> Option<u64> {
        let total = self.total_expected?;
        let speed = self.speed_bps().filter(|s| *s > 0)?;
        Some(total.saturating_sub(self.total_written) / speed)
    }

    pub fn speed_string(&self) -> Option<String> {
        self.speed_bps().map(|bps| format!("{}/s", format_bytes(bps)))
    }

    pub fn eta_string(&self) -> Option<String> {
        self.eta_seconds().map(|secs| {
            if secs >= 3600 {
                format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
            } else if secs >= 60 {
                format!("{}m {}s", secs / 60, secs % 60)
            } else {
                format!("{}s", secs)
            }
        })
    }
}

impl Default for TransferProgress {
    fn default() -> Self {
        Self::new()
    }
}

/// Human-readable byte count.
pub fn format_bytes(bytes: u64) -> String {
    if bytes >= 1_073_741_824 {
        format!("{:.1} GB", bytes as f64 / 1_073_741_824.0)
    } else if bytes >= 1_048_576 {
        format!("{:.1} MB", bytes as f64 / 1_048_576.0)
    } else if bytes >= 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{} B", bytes)
    }
}
