//! Run report written at the end of a loopback session.
//!
//! The report is plain serde data so the driver binary can print it as
//! JSON and tests can assert on it without parsing log output.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Overall outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunResult {
    /// Every client ended in game with the host's world.
    Converged,
    /// At least one client did not.
    Diverged,
}

/// Traffic counters for one endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EndpointMetrics {
    /// Peer id.
    pub peer: u64,
    /// Final session state label.
    pub state: String,
    /// Packets handed to the transport.
    pub packets_sent: u64,
    /// Packets received.
    pub packets_received: u64,
    /// Bytes handed to the transport.
    pub bytes_sent: u64,
    /// Bytes received.
    pub bytes_received: u64,
    /// Last measured round trip.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<f64>,
    /// Replica matches the host world.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub in_sync: Option<bool>,
}

/// Bulk transfer totals on the host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferSummary {
    /// Transfers started.
    pub started: u64,
    /// Transfers fully acknowledged.
    pub completed: u64,
    /// Chunks resent.
    pub resends: u64,
    /// Transfers dropped by the idle reaper.
    pub reaped: u64,
}

/// Loopback link totals.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkSummary {
    /// Messages delivered.
    pub delivered: u64,
    /// Messages dropped by fault injection.
    pub dropped: u64,
    /// Sends refused for a full inbox.
    pub refused: u64,
}

/// Complete report for one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    /// Scenario name.
    pub name: String,
    /// When the report was built (RFC 3339).
    pub timestamp: String,
    /// Outcome.
    pub result: RunResult,
    /// Host ticks executed.
    pub ticks: u64,
    /// Host counters.
    pub host: EndpointMetrics,
    /// Per-client counters.
    pub clients: Vec<EndpointMetrics>,
    /// Bulk transfer totals.
    pub transfers: TransferSummary,
    /// Link totals.
    pub link: LinkSummary,
}

/// Fluent construction of a [`RunReport`].
pub struct RunReportBuilder {
    report: RunReport,
}

impl RunReportBuilder {
    /// Start a report stamped with the current time.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            report: RunReport {
                name: name.into(),
                timestamp: chrono::Utc::now().to_rfc3339(),
                result: RunResult::Converged,
                ticks: 0,
                host: EndpointMetrics::default(),
                clients: Vec::new(),
                transfers: TransferSummary::default(),
                link: LinkSummary::default(),
            },
        }
    }

    /// Ticks executed.
    pub fn ticks(mut self, ticks: u64) -> Self {
        self.report.ticks = ticks;
        self
    }

    /// Host counters.
    pub fn host(mut self, host: EndpointMetrics) -> Self {
        self.report.host = host;
        self
    }

    /// Add one client. A client that is not in sync marks the run diverged.
    pub fn client(mut self, client: EndpointMetrics) -> Self {
        if client.in_sync != Some(true) {
            self.report.result = RunResult::Diverged;
        }
        self.report.clients.push(client);
        self
    }

    /// Transfer totals.
    pub fn transfers(mut self, transfers: TransferSummary) -> Self {
        self.report.transfers = transfers;
        self
    }

    /// Link totals.
    pub fn link(mut self, link: LinkSummary) -> Self {
        self.report.link = link;
        self
    }

    /// Finish.
    pub fn build(self) -> RunReport {
        self.report
    }
}

/// Writes a [`RunReport`] as pretty JSON.
pub struct ReportSink {
    path: PathBuf,
}

impl ReportSink {
    /// Sink at `path`, creating parent directories.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        Ok(Self { path })
    }

    /// Overwrite the file with `report`.
    pub fn write(&self, report: &RunReport) -> Result<()> {
        let json = serde_json::to_string_pretty(report).context("Failed to serialize report")?;
        let mut file = File::create(&self.path)
            .with_context(|| format!("Failed to create {}", self.path.display()))?;
        file.write_all(json.as_bytes())?;
        Ok(())
    }
}
