use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;

use super::parser::Parser;
use crate::error::{Error, Result};

/// Classified outcome of a scan-type response.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash)]
pub enum ScanVerdict {
    Clean,
    VirusDetected,
    Error,
    Unknown,
}

/// A single `<file>: <signature> FOUND` line from the daemon.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct InfectedFile {
    pub(crate) file_name: String,
    pub(crate) virus_name: String,
}

impl InfectedFile {
    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn virus_name(&self) -> &str {
        &self.virus_name
    }
}

/// Parsed reply to `SCAN`, `MULTISCAN`, `CONTSCAN`, `ALLMATCHSCAN` or `INSTREAM`.
///
/// Infected files only ever appear under [`ScanVerdict::VirusDetected`], in
/// the order the daemon reported them.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ScanResult {
    raw: String,
    verdict: ScanVerdict,
    infected_files: Vec<InfectedFile>,
}

impl ScanResult {
    pub fn parse(raw: &str) -> Self {
        let (verdict, infected_files) = Parser::parse_scan_response(raw);
        Self {
            raw: raw.to_string(),
            verdict,
            infected_files,
        }
    }

    /// Like [`ScanResult::parse`], but rejects an absent response.
    pub fn from_raw(raw: Option<&str>) -> Result<Self> {
        raw.map(Self::parse).ok_or_else(|| {
            Error::InvalidArgument("Raw scan response must not be absent".to_string())
        })
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn verdict(&self) -> ScanVerdict {
        self.verdict
    }

    pub fn infected_files(&self) -> &[InfectedFile] {
        &self.infected_files
    }

    pub fn is_clean(&self) -> bool {
        self.verdict == ScanVerdict::Clean
    }

    pub fn is_infected(&self) -> bool {
        self.verdict == ScanVerdict::VirusDetected
    }
}

/// Parsed reply to `STATS`.
///
/// Keys the parser does not recognise, or recognises but cannot convert,
/// are kept verbatim in [`ServerStats::extra`].
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct ServerStats {
    pub(crate) pools: Option<u32>,
    pub(crate) state: Option<String>,
    pub(crate) threads: Option<u32>,
    pub(crate) max_threads: Option<u32>,
    pub(crate) idle_threads: Option<u32>,
    pub(crate) queue: Option<u32>,
    pub(crate) max_queue: Option<u32>,
    pub(crate) scanned: Option<u64>,
    pub(crate) found: Option<u64>,
    pub(crate) memory_bytes: Option<u64>,
    pub(crate) signatures: Option<u64>,
    pub(crate) last_update: Option<DateTime<Utc>>,
    pub(crate) extra: HashMap<String, String>,
}

impl ServerStats {
    pub fn parse(raw: &str) -> Self {
        Parser::parse_stats(raw)
    }

    pub fn pools(&self) -> Option<u32> {
        self.pools
    }

    pub fn state(&self) -> Option<&str> {
        self.state.as_deref()
    }

    pub fn threads(&self) -> Option<u32> {
        self.threads
    }

    pub fn max_threads(&self) -> Option<u32> {
        self.max_threads
    }

    pub fn idle_threads(&self) -> Option<u32> {
        self.idle_threads
    }

    pub fn queue(&self) -> Option<u32> {
        self.queue
    }

    pub fn max_queue(&self) -> Option<u32> {
        self.max_queue
    }

    pub fn scanned(&self) -> Option<u64> {
        self.scanned
    }

    pub fn found(&self) -> Option<u64> {
        self.found
    }

    pub fn memory_bytes(&self) -> Option<u64> {
        self.memory_bytes
    }

    pub fn signatures(&self) -> Option<u64> {
        self.signatures
    }

    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        self.last_update
    }

    pub fn extra(&self) -> &HashMap<String, String> {
        &self.extra
    }
}
