use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AttendanceStatus {
    Present,
    Absent,
    Late,
    Excused,
}

impl AttendanceStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "present" => Some(Self::Present),
            "absent" => Some(Self::Absent),
            "late" => Some(Self::Late),
            "excused" => Some(Self::Excused),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Present => "present",
            Self::Absent => "absent",
            Self::Late => "late",
            Self::Excused => "excused",
        }
    }
}

/// Feed option-set categories. Fixed; reports group scores by these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FeedCategory {
    Progress,
    Homework,
    Attitude,
    Test,
    Etc,
}

impl FeedCategory {
    pub const ALL: [FeedCategory; 5] = [
        Self::Progress,
        Self::Homework,
        Self::Attitude,
        Self::Test,
        Self::Etc,
    ];

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "progress" => Some(Self::Progress),
            "homework" => Some(Self::Homework),
            "attitude" => Some(Self::Attitude),
            "test" => Some(Self::Test),
            "etc" => Some(Self::Etc),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Progress => "progress",
            Self::Homework => "homework",
            Self::Attitude => "attitude",
            Self::Test => "test",
            Self::Etc => "etc",
        }
    }
}

/// Halves round away from zero, so `-2.5` becomes `-3`.
pub fn round_to(x: f64, decimals: u32) -> f64 {
    let f = 10f64.powi(decimals as i32);
    (x * f).round() / f
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceTally {
    pub present: usize,
    pub absent: usize,
    pub late: usize,
    pub excused: usize,
}

impl AttendanceTally {
    pub fn add(&mut self, status: AttendanceStatus) {
        match status {
            AttendanceStatus::Present => self.present += 1,
            AttendanceStatus::Absent => self.absent += 1,
            AttendanceStatus::Late => self.late += 1,
            AttendanceStatus::Excused => self.excused += 1,
        }
    }

    pub fn checked(&self) -> usize {
        self.present + self.absent + self.late + self.excused
    }

    /// Percentage of attended days over days that counted. Excused days are
    /// left out of both sides; `None` when nothing counted.
    pub fn rate(&self, count_late_as_present: bool, decimals: u32) -> Option<f64> {
        let denom = self.present + self.absent + self.late;
        if denom == 0 {
            return None;
        }
        let attended = if count_late_as_present {
            self.present + self.late
        } else {
            self.present
        };
        Some(round_to(
            100.0 * attended as f64 / denom as f64,
            decimals,
        ))
    }
}

#[derive(Debug, Clone, Default)]
pub struct CategoryScores {
    sums: BTreeMap<FeedCategory, (f64, usize)>,
}

impl CategoryScores {
    pub fn add(&mut self, category: FeedCategory, score: f64) {
        let e = self.sums.entry(category).or_insert((0.0, 0));
        e.0 += score;
        e.1 += 1;
    }

    pub fn averages(&self, decimals: u32) -> BTreeMap<&'static str, f64> {
        self.sums
            .iter()
            .filter(|(_, (_, n))| *n > 0)
            .map(|(c, (sum, n))| (c.as_str(), round_to(sum / *n as f64, decimals)))
            .collect()
    }
}
