use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Admin,
    Support,
    Instructor,
    Student,
    Parent,
}

impl Role {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "admin" => Some(Self::Admin),
            "support" => Some(Self::Support),
            "instructor" => Some(Self::Instructor),
            "student" => Some(Self::Student),
            "parent" => Some(Self::Parent),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Support => "support",
            Self::Instructor => "instructor",
            Self::Student => "student",
            Self::Parent => "parent",
        }
    }

    /// Admin and support are exempt from every policy time window.
    pub fn is_privileged(self) -> bool {
        matches!(self, Self::Admin | Self::Support)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Scheduled,
    Ongoing,
    Completed,
    Cancelled,
}

impl SessionStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "scheduled" => Some(Self::Scheduled),
            "ongoing" => Some(Self::Ongoing),
            "completed" => Some(Self::Completed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Ongoing => "ongoing",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Tenant scheduling policy. Stored as JSON under the settings key
/// `policy.scheduling`; unknown historical fields are dropped on load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SchedulingPolicy {
    pub instructor_cancel_allowed: bool,
    pub instructor_cancel_min_hours: i64,
    pub instructor_reschedule_allowed: bool,
    pub instructor_reschedule_min_hours: i64,
    pub learner_cancel_allowed: bool,
    pub learner_cancel_min_hours: i64,
    pub learner_reschedule_allowed: bool,
    pub learner_reschedule_min_hours: i64,
    pub early_start_tolerance_minutes: i64,
    // 0 disables the lateness allowance: joins stay open to session end only.
    pub join_delay_tolerance_minutes: i64,
    pub max_reschedule_horizon_days: i64,
    pub refund_credits_on_cancel: bool,
}

impl Default for SchedulingPolicy {
    fn default() -> Self {
        Self {
            instructor_cancel_allowed: true,
            instructor_cancel_min_hours: 12,
            instructor_reschedule_allowed: true,
            instructor_reschedule_min_hours: 12,
            learner_cancel_allowed: true,
            learner_cancel_min_hours: 24,
            learner_reschedule_allowed: true,
            learner_reschedule_min_hours: 24,
            early_start_tolerance_minutes: 5,
            join_delay_tolerance_minutes: 15,
            max_reschedule_horizon_days: 60,
            refund_credits_on_cancel: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Eligibility {
    pub can_join: bool,
    pub can_cancel: bool,
    pub can_reschedule: bool,
}

/// Scheduled -> Ongoing -> Completed is time-driven and never stored;
/// only `cancelled` is a stored terminal fact.
pub fn effective_status(
    stored: SessionStatus,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    now: DateTime<Utc>,
) -> SessionStatus {
    if stored == SessionStatus::Cancelled {
        return SessionStatus::Cancelled;
    }
    if now > end {
        SessionStatus::Completed
    } else if now >= start {
        SessionStatus::Ongoing
    } else {
        SessionStatus::Scheduled
    }
}

fn terminal_denial(status: SessionStatus) -> Option<String> {
    match status {
        SessionStatus::Cancelled => Some("session is already cancelled".to_string()),
        SessionStatus::Completed => Some("session is already completed".to_string()),
        _ => None,
    }
}

/// Why the actor may not join right now, or None if joining is permitted.
pub fn join_denial(
    stored: SessionStatus,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    policy: Option<&SchedulingPolicy>,
    role: Role,
    is_participant: bool,
    now: DateTime<Utc>,
) -> Option<String> {
    let Some(policy) = policy else {
        return Some("scheduling policy not loaded".to_string());
    };
    match effective_status(stored, start, end, now) {
        SessionStatus::Cancelled => return Some("session is cancelled".to_string()),
        SessionStatus::Completed => return Some("session has already ended".to_string()),
        SessionStatus::Scheduled | SessionStatus::Ongoing => {}
    }
    if !is_participant && !role.is_privileged() {
        return Some("not a participant in this session".to_string());
    }
    let opens_at = start - Duration::minutes(policy.early_start_tolerance_minutes);
    if now < opens_at {
        return Some(format!(
            "session opens for joining {} minutes before start",
            policy.early_start_tolerance_minutes
        ));
    }
    let closes_at = if policy.join_delay_tolerance_minutes == 0 {
        end
    } else {
        start + Duration::minutes(policy.join_delay_tolerance_minutes)
    };
    if now > closes_at {
        return Some("join window has closed".to_string());
    }
    None
}

fn window_denial(
    action: &str,
    allowed: bool,
    min_hours: i64,
    start: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Option<String> {
    if !allowed {
        return Some(format!("{} is not permitted by policy for this role", action));
    }
    // Boundary is inclusive: exactly min_hours before start still permits.
    if now > start - Duration::hours(min_hours) {
        return Some(format!(
            "{} window closed: requires at least {} hours notice",
            action, min_hours
        ));
    }
    None
}

/// Why the actor may not cancel, or None if cancellation is permitted.
pub fn cancel_denial(
    stored: SessionStatus,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    policy: Option<&SchedulingPolicy>,
    role: Role,
    now: DateTime<Utc>,
) -> Option<String> {
    let Some(policy) = policy else {
        return Some("scheduling policy not loaded".to_string());
    };
    if let Some(denial) = terminal_denial(effective_status(stored, start, end, now)) {
        return Some(denial);
    }
    if role.is_privileged() {
        return None;
    }
    let (allowed, min_hours) = match role {
        Role::Instructor => (
            policy.instructor_cancel_allowed,
            policy.instructor_cancel_min_hours,
        ),
        _ => (policy.learner_cancel_allowed, policy.learner_cancel_min_hours),
    };
    window_denial("cancellation", allowed, min_hours, start, now)
}

/// Why the actor may not reschedule, or None if rescheduling is permitted.
/// The horizon check on the new start time is separate (`horizon_denial`).
pub fn reschedule_denial(
    stored: SessionStatus,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    policy: Option<&SchedulingPolicy>,
    role: Role,
    now: DateTime<Utc>,
) -> Option<String> {
    let Some(policy) = policy else {
        return Some("scheduling policy not loaded".to_string());
    };
    if let Some(denial) = terminal_denial(effective_status(stored, start, end, now)) {
        return Some(denial);
    }
    if role.is_privileged() {
        return None;
    }
    let (allowed, min_hours) = match role {
        Role::Instructor => (
            policy.instructor_reschedule_allowed,
            policy.instructor_reschedule_min_hours,
        ),
        _ => (
            policy.learner_reschedule_allowed,
            policy.learner_reschedule_min_hours,
        ),
    };
    window_denial("reschedule", allowed, min_hours, start, now)
}

/// The new start time must land inside the tenant's reschedule horizon.
/// A violation is reported, never clamped.
pub fn horizon_denial(
    new_start: DateTime<Utc>,
    policy: Option<&SchedulingPolicy>,
    now: DateTime<Utc>,
) -> Option<String> {
    let Some(policy) = policy else {
        return Some("scheduling policy not loaded".to_string());
    };
    if new_start > now + Duration::days(policy.max_reschedule_horizon_days) {
        return Some(format!(
            "reschedule horizon exceeded: new start must be within {} days",
            policy.max_reschedule_horizon_days
        ));
    }
    None
}

pub fn derive_eligibility(
    stored: SessionStatus,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    policy: Option<&SchedulingPolicy>,
    role: Role,
    is_participant: bool,
    now: DateTime<Utc>,
) -> Eligibility {
    Eligibility {
        can_join: join_denial(stored, start, end, policy, role, is_participant, now).is_none(),
        can_cancel: cancel_denial(stored, start, end, policy, role, now).is_none(),
        can_reschedule: reschedule_denial(stored, start, end, policy, role, now).is_none(),
    }
}

pub fn parse_utc(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

pub fn format_utc(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}
