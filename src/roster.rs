use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::eligibility::format_utc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    PrimaryInstructor,
    SecondaryInstructor,
    Student,
}

impl SessionRole {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "primary_instructor" => Some(Self::PrimaryInstructor),
            "secondary_instructor" => Some(Self::SecondaryInstructor),
            "student" => Some(Self::Student),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::PrimaryInstructor => "primary_instructor",
            Self::SecondaryInstructor => "secondary_instructor",
            Self::Student => "student",
        }
    }

    pub fn display_label(self) -> &'static str {
        match self {
            Self::PrimaryInstructor => "Primary Instructor",
            Self::SecondaryInstructor => "Secondary Instructor",
            Self::Student => "Student",
        }
    }

    fn rank(self) -> u8 {
        match self {
            Self::PrimaryInstructor => 0,
            Self::SecondaryInstructor => 1,
            Self::Student => 2,
        }
    }
}

/// One stored attendance fact joined with the member's display name.
#[derive(Debug, Clone)]
pub struct RawAttendance {
    pub user_id: String,
    pub display_name: String,
    pub role: SessionRole,
    pub present: bool,
    pub join_time: Option<DateTime<Utc>>,
    pub leave_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterEntry {
    pub user_id: String,
    pub display_name: String,
    pub role_in_session: &'static str,
    pub display_role: &'static str,
    pub present: bool,
    pub join_time: Option<String>,
    pub leave_time: Option<String>,
    pub late_join: bool,
    pub early_left: bool,
}

pub fn late_join(
    present: bool,
    join_time: Option<DateTime<Utc>>,
    start: DateTime<Utc>,
    grace_minutes: i64,
) -> bool {
    present
        && join_time
            .map(|j| j > start + Duration::minutes(grace_minutes))
            .unwrap_or(false)
}

pub fn early_left(present: bool, leave_time: Option<DateTime<Utc>>, end: DateTime<Utc>) -> bool {
    present && leave_time.map(|l| l < end).unwrap_or(false)
}

/// Orders raw records primary, secondary, then students in their incoming
/// relative order, and annotates each with the derived lateness flags.
/// Never persisted; recomputed from stored facts on every read.
pub fn build_roster(
    records: Vec<RawAttendance>,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    grace_minutes: i64,
) -> Vec<RosterEntry> {
    let mut records = records;
    records.sort_by_key(|r| r.role.rank());
    records
        .into_iter()
        .map(|r| RosterEntry {
            late_join: late_join(r.present, r.join_time, start, grace_minutes),
            early_left: early_left(r.present, r.leave_time, end),
            user_id: r.user_id,
            display_name: r.display_name,
            role_in_session: r.role.as_str(),
            display_role: r.role.display_label(),
            present: r.present,
            join_time: r.join_time.map(format_utc),
            leave_time: r.leave_time.map(format_utc),
        })
        .collect()
}
