use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use regex::Regex;
use std::str::FromStr;
use std::sync::LazyLock;

use super::types::{InfectedFile, ScanVerdict, ServerStats};

static THREADS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"live\s+(\d+)\s+idle\s+(\d+)\s+max\s+(\d+)").expect("threads pattern")
});
static QUEUE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d+)\s+items(?:.*?max\s+(\d+))?").expect("queue pattern")
});
static MEMSTATS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bused\s+([\d.]+)M").expect("memstats pattern"));

const FOUND_MARKER: &str = " FOUND";
const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

pub struct Parser;

impl Parser {
    /// Classifies a scan-type response.
    ///
    /// Rules apply in order, case-insensitively, against the whole response
    /// exactly as received: ends with `OK`, ends with `ERROR`, contains
    /// `FOUND`, otherwise unknown.
    pub fn parse_scan_response(response: &str) -> (ScanVerdict, Vec<InfectedFile>) {
        let upper = response.to_ascii_uppercase();

        if upper.ends_with("OK") {
            (ScanVerdict::Clean, Vec::new())
        } else if upper.ends_with("ERROR") {
            (ScanVerdict::Error, Vec::new())
        } else if upper.contains("FOUND") {
            let files = response
                .lines()
                .filter_map(Self::parse_infected_line)
                .collect();
            (ScanVerdict::VirusDetected, files)
        } else {
            (ScanVerdict::Unknown, Vec::new())
        }
    }

    // `<file name>: <virus name> FOUND`; the file name may itself contain colons.
    fn parse_infected_line(line: &str) -> Option<InfectedFile> {
        let line = line.trim_end();
        // ASCII upper-casing keeps byte offsets valid for `line`
        let upper = line.to_ascii_uppercase();
        if !upper.ends_with("FOUND") {
            return None;
        }

        let marker = upper.rfind(FOUND_MARKER)?;
        if marker == 0 {
            return None;
        }

        let file_part = &line[..marker];
        let colon = file_part.rfind(':')?;

        Some(InfectedFile {
            file_name: file_part[..colon].trim().to_string(),
            virus_name: file_part[colon + 1..].trim().to_string(),
        })
    }

    pub fn parse_stats(response: &str) -> ServerStats {
        let mut stats = ServerStats::default();

        for line in response.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };

            let key = key.trim();
            let value = value.trim();
            if key.is_empty() {
                continue;
            }

            let recognised = match key.to_ascii_uppercase().as_str() {
                "POOLS" => set(&mut stats.pools, value),
                "STATE" => {
                    stats.state = Some(value.to_string());
                    true
                }
                "THREADS" => Self::apply_threads(&mut stats, value),
                "MAXTHREADS" => set(&mut stats.max_threads, value),
                "IDLETHREADS" => set(&mut stats.idle_threads, value),
                "QUEUE" => Self::apply_queue(&mut stats, value),
                "MAXQUEUE" => set(&mut stats.max_queue, value),
                "SCANNED" => set(&mut stats.scanned, value),
                "FOUND" => set(&mut stats.found, value),
                "MEMORY" => set(&mut stats.memory_bytes, value),
                "MEMSTATS" => Self::apply_memstats(&mut stats, value),
                "SIGNATURES" | "DBSIGS" => set(&mut stats.signatures, value),
                "LASTUPDATE" | "DBBUILDTIME" => match Self::parse_timestamp(value) {
                    Some(ts) => {
                        stats.last_update = Some(ts);
                        true
                    }
                    None => false,
                },
                _ => false,
            };

            if !recognised {
                stats.extra.insert(key.to_string(), value.to_string());
            }
        }

        stats
    }

    fn apply_threads(stats: &mut ServerStats, value: &str) -> bool {
        if set(&mut stats.threads, value) {
            return true;
        }

        // Format: live 1 idle 0 max 12 idle-timeout 30
        let parsed = THREADS_RE.captures(value).and_then(|caps| {
            Some((
                caps[1].parse::<u32>().ok()?,
                caps[2].parse::<u32>().ok()?,
                caps[3].parse::<u32>().ok()?,
            ))
        });

        match parsed {
            Some((live, idle, max)) => {
                stats.threads = Some(live);
                stats.idle_threads = Some(idle);
                stats.max_threads = Some(max);
                true
            }
            None => false,
        }
    }

    fn apply_queue(stats: &mut ServerStats, value: &str) -> bool {
        if set(&mut stats.queue, value) {
            return true;
        }

        // Format: 0 items, max 100
        let parsed = QUEUE_RE.captures(value).and_then(|caps| {
            let items = caps[1].parse::<u32>().ok()?;
            let max = match caps.get(2) {
                Some(max) => Some(max.as_str().parse::<u32>().ok()?),
                None => None,
            };
            Some((items, max))
        });

        match parsed {
            Some((items, max)) => {
                stats.queue = Some(items);
                if max.is_some() {
                    stats.max_queue = max;
                }
                true
            }
            None => false,
        }
    }

    fn apply_memstats(stats: &mut ServerStats, value: &str) -> bool {
        // Format: heap 1.234M mmap 0.000M used 1.234M ...
        let used = MEMSTATS_RE
            .captures(value)
            .and_then(|caps| caps[1].parse::<f64>().ok());

        match used {
            Some(mb) => {
                stats.memory_bytes = Some((mb * BYTES_PER_MB) as u64);
                true
            }
            None => false,
        }
    }

    fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
        if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
            return Some(ts.with_timezone(&Utc));
        }

        if let Ok(secs) = value.parse::<i64>() {
            return Utc.timestamp_opt(secs, 0).single();
        }

        // Example: Mon Mar 13 08:20:48 2023
        NaiveDateTime::parse_from_str(value, "%a %b %e %H:%M:%S %Y")
            .ok()
            .map(|naive| naive.and_utc())
    }
}

fn set<T: FromStr>(slot: &mut Option<T>, value: &str) -> bool {
    match value.parse() {
        Ok(parsed) => {
            *slot = Some(parsed);
            true
        }
        Err(_) => false,
    }
}
