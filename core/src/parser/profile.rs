use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::PatternsConfig;
use crate::flash::ToolKind;

static BAR_PERCENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\[[^\]]*\]\s*(\d{1,3})\s*%").unwrap());
static FRACTION: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\[(\d+)\s*/\s*(\d+)\]").unwrap());

static GENERIC_PERCENT: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"\((\d{1,3})\s*%\)",
        r"\|\s*(\d{1,3})\s*%",
        r"\]\s*(\d{1,3})\s*%",
        r"(\d{1,3})\s*%",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

// avrdude also draws `Reading | ... |` bars for the signature read and verify.
static AVRDUDE_WRITING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^Writing\s*\|[^|]*\|\s*(\d{1,3})\s*%").unwrap());
// dfu-util erases with its own bar before `Download`.
static DFU_DOWNLOAD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^Download\s*\[[^\]]*\]\s*(\d{1,3})\s*%").unwrap());
static BOSSAC_PAGES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\[[^\]]*\]\s*(\d{1,3})\s*%\s*\(\d+/\d+ pages\)").unwrap());

#[derive(Debug, Clone)]
pub enum ProgressMatcher {
    /// `[=====     ] 50%` bars and `[12/40]` fractions from the compiler.
    Build,
    /// Per-region esptool output, see `RegionTracker`.
    Regions,
    /// First matching pattern wins.
    Generic(Vec<Regex>),
}

impl ProgressMatcher {
    pub fn generic() -> Self {
        ProgressMatcher::Generic(GENERIC_PERCENT.clone())
    }

    /// Only the flash-write bars of a known flasher count as progress.
    pub fn for_tool(kind: ToolKind) -> Self {
        match kind {
            ToolKind::Esptool => ProgressMatcher::Regions,
            ToolKind::Avrdude => ProgressMatcher::Generic(vec![AVRDUDE_WRITING.clone()]),
            ToolKind::DfuUtil => ProgressMatcher::Generic(vec![DFU_DOWNLOAD.clone()]),
            ToolKind::Bossac => ProgressMatcher::Generic(vec![BOSSAC_PAGES.clone()]),
            ToolKind::Direct => Self::generic(),
        }
    }

    /// Percent carried by `line`, for the matchers that work line by line.
    pub fn percent_of(&self, line: &str) -> Option<u8> {
        match self {
            ProgressMatcher::Build => build_percent(line.trim_start()),
            ProgressMatcher::Regions => None,
            ProgressMatcher::Generic(patterns) => patterns
                .iter()
                .find_map(|p| p.captures(line))
                .and_then(|caps| caps.get(1))
                .and_then(|m| m.as_str().parse::<u32>().ok())
                .filter(|p| *p <= 100)
                .map(|p| p as u8),
        }
    }
}

fn build_percent(line: &str) -> Option<u8> {
    if let Some(caps) = BAR_PERCENT.captures(line) {
        return caps
            .get(1)
            .and_then(|m| m.as_str().parse::<u32>().ok())
            .map(|p| p.min(100) as u8);
    }

    let caps = FRACTION.captures(line)?;
    let current: u64 = caps.get(1)?.as_str().parse().ok()?;
    let total: u64 = caps.get(2)?.as_str().parse().ok()?;
    if total == 0 {
        return None;
    }
    Some((current.min(total) * 100 / total) as u8)
}

/// Line patterns a parser classifies against.
#[derive(Debug, Clone)]
pub struct ParserProfile {
    pub build_text_marker: String,
    pub size_marker: Option<String>,
    pub progress: ProgressMatcher,
    pub error_tags: Vec<Regex>,
}

impl ParserProfile {
    pub fn build(patterns: &PatternsConfig) -> Result<Self, regex::Error> {
        Ok(Self {
            build_text_marker: patterns.build_text_marker.clone(),
            size_marker: Some(patterns.size_summary_marker.clone()),
            progress: ProgressMatcher::Build,
            error_tags: compile_tags(&patterns.error_tags)?,
        })
    }

    pub fn upload(patterns: &PatternsConfig, tool: ToolKind) -> Result<Self, regex::Error> {
        let mut tags = patterns.error_tags.clone();
        tags.extend(patterns.upload_error_tags.iter().cloned());

        Ok(Self {
            build_text_marker: patterns.build_text_marker.clone(),
            size_marker: None,
            progress: ProgressMatcher::for_tool(tool),
            error_tags: compile_tags(&tags)?,
        })
    }

    pub fn is_error(&self, line: &str) -> bool {
        self.error_tags.iter().any(|tag| tag.is_match(line))
    }
}

fn compile_tags(tags: &[String]) -> Result<Vec<Regex>, regex::Error> {
    tags.iter()
        .map(|tag| Regex::new(&format!("(?i){}", tag)))
        .collect()
}
