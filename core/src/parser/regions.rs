use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

static ERASE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)will be erased from").unwrap());
static COMPRESSED: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^compressed \d+ bytes").unwrap());
static WRITING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^writing at 0x[0-9a-f]+.*\((\d{1,3})\s*%\)").unwrap());
static VERIFIED: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)hash of data verified").unwrap());

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionState {
    pub total_regions: u32,
    pub current_region: u32,
    pub completed_regions: u32,
}

/// Tracks esptool's per-region progress and folds it into one overall
/// percentage.
#[derive(Debug, Clone, Default)]
pub struct RegionTracker {
    state: RegionState,
    region_percent: u8,
}

impl RegionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> RegionState {
        self.state
    }

    /// Feeds one complete line. Returns the overall percent when the line
    /// moved it, `None` for lines that carry no region progress.
    pub fn observe(&mut self, line: &str) -> Option<u8> {
        let line = line.trim();

        if ERASE.is_match(line) {
            self.state.total_regions += 1;
            return None;
        }

        if COMPRESSED.is_match(line) {
            self.state.current_region += 1;
            self.region_percent = 0;
            return None;
        }

        if let Some(caps) = WRITING.captures(line) {
            let percent = caps.get(1)?.as_str().parse::<u32>().ok()?.min(100) as u8;
            self.region_percent = percent;
            return Some(self.overall());
        }

        if VERIFIED.is_match(line) {
            self.state.completed_regions += 1;
            self.region_percent = 0;
            return Some(self.overall());
        }

        None
    }

    pub fn is_progress_line(line: &str) -> bool {
        WRITING.is_match(line.trim())
    }

    fn overall(&self) -> u8 {
        let total = self
            .state
            .total_regions
            .max(self.state.current_region)
            .max(self.state.completed_regions)
            .max(1);

        // completed/total*100 + current/total, kept in integers
        let overall = (self.state.completed_regions * 100 + self.region_percent as u32) / total;
        overall.min(100) as u8
    }
}
