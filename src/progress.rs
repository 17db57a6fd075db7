use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// Step counter scraped from a tqdm-style progress bar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub current: u32,
    pub total: u32,
}

impl Progress {
    pub fn percent(&self) -> u8 {
        if self.total == 0 {
            return 0;
        }
        ((u64::from(self.current.min(self.total)) * 100) / u64::from(self.total)) as u8
    }
}

fn bar_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // "  45%|████▌     | 9/20 [00:12<00:15,  1.39s/it]"
    RE.get_or_init(|| Regex::new(r"(\d{1,3})%\|[^|]*\|\s*(\d+)/(\d+)").expect("progress regex"))
}

/// Returns the last progress reading in `line`, if any.
pub fn parse_progress(line: &str) -> Option<Progress> {
    let caps = bar_regex().captures_iter(line).last()?;
    let current = caps.get(2)?.as_str().parse().ok()?;
    let total = caps.get(3)?.as_str().parse().ok()?;
    if total == 0 || current > total {
        return None;
    }
    Some(Progress { current, total })
}
