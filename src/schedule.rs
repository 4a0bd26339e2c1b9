//! Timetable math: dates, times, recurrence, and move planning.
//!
//! Nothing here touches the database. Handlers load the affected blocks,
//! ask for a plan, check conflicts, then write the planned rows back.

use chrono::{Datelike, Duration, NaiveDate};

pub const MAX_REPEAT_WEEKS: u32 = 52;

/// Stored dates are compared as text, so only four-digit years are valid.
pub fn in_calendar(d: NaiveDate) -> bool {
    (1..=9999).contains(&d.year())
}

pub fn parse_date(s: &str) -> Result<NaiveDate, String> {
    let bad = || format!("invalid date `{}` (expected YYYY-MM-DD)", s);
    let t = s.trim();
    let shaped = t.len() == 10
        && t.bytes().enumerate().all(|(i, b)| match i {
            4 | 7 => b == b'-',
            _ => b.is_ascii_digit(),
        });
    if !shaped {
        return Err(bad());
    }
    NaiveDate::parse_from_str(t, "%Y-%m-%d")
        .ok()
        .filter(|d| in_calendar(*d))
        .ok_or_else(bad)
}

/// `date` moved by `days`, or an error when the result leaves years 0001-9999.
pub fn shift_days(date: NaiveDate, days: i64) -> Result<NaiveDate, String> {
    date.checked_add_signed(Duration::days(days))
        .filter(|d| in_calendar(*d))
        .ok_or_else(|| {
            format!(
                "moving {} by {} days leaves the supported years 0001-9999",
                format_date(date),
                days
            )
        })
}

pub fn format_date(d: NaiveDate) -> String {
    d.format("%Y-%m-%d").to_string()
}

/// `HH:MM` to minutes after midnight. `24:00` is accepted as an end time.
pub fn parse_time(s: &str) -> Result<u32, String> {
    let bad = || format!("invalid time `{}` (expected HH:MM)", s);
    let (h, m) = s.trim().split_once(':').ok_or_else(bad)?;
    if h.len() != 2 || m.len() != 2 {
        return Err(bad());
    }
    let h: u32 = h.parse().map_err(|_| bad())?;
    let m: u32 = m.parse().map_err(|_| bad())?;
    if m > 59 || h > 24 || (h == 24 && m != 0) {
        return Err(bad());
    }
    Ok(h * 60 + m)
}

pub fn format_time(minutes: u32) -> String {
    format!("{:02}:{:02}", minutes / 60, minutes % 60)
}

/// Half-open intervals: back-to-back lessons do not overlap.
pub fn overlaps(a_start: u32, a_end: u32, b_start: u32, b_end: u32) -> bool {
    a_start < b_end && b_start < a_end
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeekStart {
    Monday,
    Sunday,
}

impl WeekStart {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "monday" => Some(Self::Monday),
            "sunday" => Some(Self::Sunday),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Monday => "monday",
            Self::Sunday => "sunday",
        }
    }
}

pub fn week_start(date: NaiveDate, start: WeekStart) -> Result<NaiveDate, String> {
    let back = match start {
        WeekStart::Monday => date.weekday().num_days_from_monday(),
        WeekStart::Sunday => date.weekday().num_days_from_sunday(),
    };
    shift_days(date, -(back as i64))
}

/// Same weekday for `weeks` consecutive weeks starting at `first`.
pub fn weekly_dates(first: NaiveDate, weeks: u32) -> Result<Vec<NaiveDate>, String> {
    (0..weeks)
        .map(|w| shift_days(first, w as i64 * 7))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveScope {
    /// Only the selected block.
    Day,
    /// Every block created in the same recurrence series.
    Group,
}

impl MoveScope {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "day" => Some(Self::Day),
            "group" => Some(Self::Group),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Day => "day",
            Self::Group => "group",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BlockSlot {
    pub id: String,
    pub group_id: Option<String>,
    pub teacher_id: String,
    pub student_id: Option<String>,
    pub date: NaiveDate,
    pub start: u32,
    pub end: u32,
    pub detached: bool,
}

#[derive(Debug, Clone, Default)]
pub struct MoveRequest {
    pub date: Option<NaiveDate>,
    pub start: Option<u32>,
    pub end: Option<u32>,
    pub teacher_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MovePlan {
    /// `Group` degrades to `Day` for blocks that have no series.
    pub scope: MoveScope,
    pub updates: Vec<BlockSlot>,
}

/// Blocks a move or assignment touches: the anchor alone, or its whole
/// series when the scope is `Group` and the anchor has one.
pub fn scope_targets<'a>(
    anchor: &'a BlockSlot,
    series: &'a [BlockSlot],
    scope: MoveScope,
) -> (MoveScope, Vec<&'a BlockSlot>) {
    match (scope, anchor.group_id.as_ref()) {
        (MoveScope::Group, Some(gid)) => {
            let members: Vec<&BlockSlot> = series
                .iter()
                .filter(|b| b.group_id.as_ref() == Some(gid))
                .collect();
            if members.is_empty() {
                (MoveScope::Day, vec![anchor])
            } else {
                (MoveScope::Group, members)
            }
        }
        _ => (MoveScope::Day, vec![anchor]),
    }
}

/// Plans a move. `series` holds every block of the anchor's group (the
/// anchor included) and is ignored for `Day` moves.
///
/// `Day` rewrites only the anchor and detaches it from its series. `Group`
/// shifts each member by the anchor's day delta, applies any new times or
/// teacher to all of them, and reattaches detached members.
pub fn plan_move(
    anchor: &BlockSlot,
    series: &[BlockSlot],
    scope: MoveScope,
    req: &MoveRequest,
) -> Result<MovePlan, String> {
    let anchor_start = req.start.unwrap_or(anchor.start);
    let anchor_end = req.end.unwrap_or(anchor.end);
    if anchor_start >= anchor_end {
        return Err("startTime must be before endTime".to_string());
    }
    let delta = req
        .date
        .map(|d| d.signed_duration_since(anchor.date).num_days())
        .unwrap_or(0);

    let (effective, targets) = scope_targets(anchor, series, scope);
    let updates = match effective {
        MoveScope::Day => vec![BlockSlot {
            date: shift_days(anchor.date, delta)?,
            start: anchor_start,
            end: anchor_end,
            teacher_id: req
                .teacher_id
                .clone()
                .unwrap_or_else(|| anchor.teacher_id.clone()),
            detached: anchor.group_id.is_some(),
            ..anchor.clone()
        }],
        MoveScope::Group => {
            let mut out = Vec::with_capacity(targets.len());
            for b in targets {
                let start = req.start.unwrap_or(b.start);
                let end = req.end.unwrap_or(b.end);
                if start >= end {
                    return Err(format!(
                        "move would leave block {} with startTime after endTime",
                        b.id
                    ));
                }
                out.push(BlockSlot {
                    date: shift_days(b.date, delta)?,
                    start,
                    end,
                    teacher_id: req.teacher_id.clone().unwrap_or_else(|| b.teacher_id.clone()),
                    detached: false,
                    ..b.clone()
                });
            }
            out.sort_by(|a, b| a.date.cmp(&b.date).then(a.start.cmp(&b.start)));
            out
        }
    };

    Ok(MovePlan {
        scope: effective,
        updates,
    })
}

/// Pairs `(moved block, existing block)` where one student would sit in two
/// overlapping lessons. Blocks present in `moved` are skipped in `existing`.
pub fn student_conflicts(moved: &[BlockSlot], existing: &[BlockSlot]) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for m in moved {
        let Some(student) = m.student_id.as_ref() else {
            continue;
        };
        for e in existing {
            if moved.iter().any(|x| x.id == e.id) {
                continue;
            }
            if e.student_id.as_ref() == Some(student)
                && e.date == m.date
                && overlaps(m.start, m.end, e.start, e.end)
            {
                out.push((m.id.clone(), e.id.clone()));
            }
        }
    }
    out
}
