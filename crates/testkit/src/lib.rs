#![warn(missing_docs)]
//! Test surfaces for the sync engine: an in-memory transport with fault
//! injection, an in-memory grid world, a JSONL event sink and run reports.

mod loopback;
mod report;
mod world;

use anyhow::{Context, Result};
use colonysync_core::PeerId;
use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

pub use loopback::*;
pub use report::*;
pub use world::*;

/// One line of the event log.
#[derive(Debug, Serialize)]
pub struct EventRecord<'a> {
    /// Wall-clock time (RFC 3339).
    pub at: String,
    /// Host tick when the event occurred.
    pub tick: u64,
    /// Peer the event concerns.
    pub peer: PeerId,
    /// Short kind label.
    pub kind: &'a str,
    /// Free-form detail.
    pub detail: &'a str,
}

impl<'a> EventRecord<'a> {
    /// Record stamped with the current time.
    pub fn now(tick: u64, peer: PeerId, kind: &'a str, detail: &'a str) -> Self {
        Self {
            at: chrono::Utc::now().to_rfc3339(),
            tick,
            peer,
            kind,
            detail,
        }
    }
}

/// A sink that writes newline-delimited JSON to disk.
pub struct JsonlSink {
    out: BufWriter<File>,
    written: usize,
}

impl JsonlSink {
    /// Create a new sink at `path`.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::create(path)
            .with_context(|| format!("Failed to create event log {}", path.display()))?;
        Ok(Self {
            out: BufWriter::new(file),
            written: 0,
        })
    }

    /// Append an event to the log.
    pub fn write(&mut self, event: &EventRecord<'_>) -> Result<()> {
        let line = serde_json::to_string(event)?;
        self.out.write_all(line.as_bytes())?;
        self.out.write_all(b"\n")?;
        self.written += 1;
        Ok(())
    }

    /// Events written so far.
    pub fn written(&self) -> usize {
        self.written
    }

    /// Push buffered lines to disk.
    pub fn flush(&mut self) -> Result<()> {
        self.out.flush().context("Failed to flush event log")
    }
}
