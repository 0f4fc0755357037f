//! Per-disk copy progress parsed from virt-v2v output

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;

static COPYING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^.*Copying disk (\d+)/(\d+)").expect("valid copying regex"));
static PERCENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d+)% \[[*-]+\]").expect("valid percent regex"));
static FINISHING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\[[ .0-9]*\] Finishing off").expect("valid finishing regex"));

/// What a line changed
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Event {
    /// A disk started copying
    DiskStarted {
        /// 1-based disk number
        disk: u32,
        /// Disk count
        total: u32,
    },
    /// The current disk advanced
    Progress {
        /// 1-based disk number
        disk: u32,
        /// Percent, capped at 100
        percent: f64,
    },
    /// Conversion finished; every disk is complete
    Finished,
}

/// Copy progress keyed by 1-based disk number
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DiskProgress {
    current: Option<u32>,
    total: u32,
    percent: BTreeMap<u32, f64>,
}

impl DiskProgress {
    /// Fold one output line; returns the event it produced, if any
    pub fn observe(&mut self, line: &str) -> Option<Event> {
        if FINISHING.is_match(line) {
            for disk in 1..=self.total {
                self.percent.insert(disk, 100.0);
            }
            return Some(Event::Finished);
        }
        if let Some(caps) = COPYING.captures(line) {
            let disk: u32 = caps[1].parse().ok()?;
            let total: u32 = caps[2].parse().ok()?;
            self.total = self.total.max(total);
            if disk == 0 || disk > self.total {
                return None;
            }
            self.current = Some(disk);
            self.percent.entry(disk).or_insert(0.0);
            return Some(Event::DiskStarted { disk, total });
        }
        if let Some(caps) = PERCENT.captures(line) {
            let disk = self.current?;
            let percent = caps[1].parse::<f64>().ok()?.min(100.0);
            self.percent.insert(disk, percent);
            return Some(Event::Progress { disk, percent });
        }
        None
    }

    /// Percent of one disk
    pub fn percent(&self, disk: u32) -> Option<f64> {
        self.percent.get(&disk).copied()
    }

    /// Disk count announced so far
    pub fn total(&self) -> u32 {
        self.total
    }

    /// Prometheus text exposition of `v2v_disk_transfers`
    pub fn render(&self) -> String {
        let mut out = String::from(
            "# HELP v2v_disk_transfers Percent of disk copied\n# TYPE v2v_disk_transfers gauge\n",
        );
        for (disk, percent) in &self.percent {
            out.push_str(&format!("v2v_disk_transfers{{disk_id=\"{disk}\"}} {percent}\n"));
        }
        out
    }
}
