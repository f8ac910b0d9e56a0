use chrono::{Datelike, NaiveDate, NaiveTime};
use std::collections::HashMap;

/// Weekday names as stored on routine template rows, Monday-first.
/// Listings and resolution order days by position in this table.
pub const DAY_ORDER: [&str; 7] = [
    "MONDAY",
    "TUESDAY",
    "WEDNESDAY",
    "THURSDAY",
    "FRIDAY",
    "SATURDAY",
    "SUNDAY",
];

pub const SLOT_TYPES: [&str; 4] = ["TEACHING", "BREAK", "LUNCH", "ASSEMBLY"];

pub const SESSION_STATUSES: [&str; 4] = ["SCHEDULED", "CONDUCTED", "CANCELLED", "POSTPONED"];

pub const STUDENT_ATTENDANCE_STATUSES: [&str; 5] =
    ["PRESENT", "ABSENT", "LATE", "EXCUSED", "SICK_LEAVE"];

pub const STAFF_ATTENDANCE_STATUSES: [&str; 4] = ["PRESENT", "ABSENT", "LATE", "ON_LEAVE"];

pub fn weekday_name(date: NaiveDate) -> &'static str {
    DAY_ORDER[date.weekday().num_days_from_monday() as usize]
}

pub fn day_sort_key(day: &str) -> usize {
    DAY_ORDER.iter().position(|d| *d == day).unwrap_or(7)
}

pub fn parse_day_of_week(raw: &str) -> Option<&'static str> {
    let upper = raw.trim().to_ascii_uppercase();
    DAY_ORDER.iter().find(|d| **d == upper).copied()
}

pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").ok()
}

pub fn parse_time(raw: &str) -> Option<NaiveTime> {
    let t = raw.trim();
    NaiveTime::parse_from_str(t, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(t, "%H:%M:%S"))
        .ok()
}

/// Half-open interval test: [s1,e1) and [s2,e2) overlap iff s1 < e2 && s2 < e1.
/// Touching endpoints (e1 == s2) do not overlap.
pub fn intervals_overlap(s1: NaiveTime, e1: NaiveTime, s2: NaiveTime, e2: NaiveTime) -> bool {
    s1 < e2 && s2 < e1
}

/// Override-or-fallback for the per-date subject/teacher resolution.
pub fn effective<'a>(override_value: Option<&'a str>, template_value: &'a str) -> &'a str {
    override_value.unwrap_or(template_value)
}

/// One weekly template row, as resolution sees it. Rows arrive already in
/// slot display order; overlay preserves that order.
#[derive(Debug, Clone, PartialEq)]
pub struct TemplateSlot {
    pub template_id: String,
    pub time_slot_id: String,
    pub subject_id: String,
    pub teacher_id: String,
}

/// One daily session row for the date being resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct DailyOverride {
    pub session_id: String,
    pub routine_template_id: Option<String>,
    pub subject_override_id: Option<String>,
    pub teacher_override_id: Option<String>,
    pub actual_teacher_id: Option<String>,
    pub status: String,
    pub attendance_marked: bool,
    pub remarks: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedSlot {
    pub template_id: String,
    pub time_slot_id: String,
    pub effective_subject_id: String,
    pub effective_teacher_id: String,
    pub session: Option<DailyOverride>,
}

/// Merge a weekday's template rows with that date's session rows.
///
/// A template row with a session referencing it takes the session's
/// overrides; every other row passes through unchanged with no session
/// attached. Ad-hoc sessions (no template reference) are ignored here.
pub fn overlay_day(template: &[TemplateSlot], overrides: &[DailyOverride]) -> Vec<ResolvedSlot> {
    let by_template: HashMap<&str, &DailyOverride> = overrides
        .iter()
        .filter_map(|o| o.routine_template_id.as_deref().map(|t| (t, o)))
        .collect();

    template
        .iter()
        .map(|t| {
            let session = by_template.get(t.template_id.as_str()).copied();
            ResolvedSlot {
                template_id: t.template_id.clone(),
                time_slot_id: t.time_slot_id.clone(),
                effective_subject_id: effective(
                    session.and_then(|s| s.subject_override_id.as_deref()),
                    &t.subject_id,
                )
                .to_string(),
                effective_teacher_id: effective(
                    session.and_then(|s| s.teacher_override_id.as_deref()),
                    &t.teacher_id,
                )
                .to_string(),
                session: session.cloned(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(template_id: &str, slot_id: &str, subject: &str, teacher: &str) -> TemplateSlot {
        TemplateSlot {
            template_id: template_id.to_string(),
            time_slot_id: slot_id.to_string(),
            subject_id: subject.to_string(),
            teacher_id: teacher.to_string(),
        }
    }

    fn t(s: &str) -> NaiveTime {
        parse_time(s).expect("time")
    }

    #[test]
    fn weekday_name_is_monday_first() {
        let monday = parse_date("2024-03-04").expect("date");
        assert_eq!(weekday_name(monday), "MONDAY");
        assert_eq!(weekday_name(monday.succ_opt().expect("tuesday")), "TUESDAY");
        assert_eq!(day_sort_key("MONDAY"), 0);
        assert_eq!(day_sort_key("SUNDAY"), 6);
        assert_eq!(day_sort_key("NOT_A_DAY"), 7);
    }

    #[test]
    fn touching_intervals_do_not_overlap() {
        assert!(!intervals_overlap(
            t("09:00"),
            t("09:45"),
            t("09:45"),
            t("10:30")
        ));
        assert!(intervals_overlap(
            t("09:00"),
            t("09:46"),
            t("09:45"),
            t("10:30")
        ));
        assert!(intervals_overlap(
            t("09:00"),
            t("10:30"),
            t("09:30"),
            t("09:45")
        ));
    }

    #[test]
    fn effective_prefers_override() {
        assert_eq!(effective(Some("sub"), "base"), "sub");
        assert_eq!(effective(None, "base"), "base");
    }

    #[test]
    fn overlay_without_sessions_passes_template_through() {
        let template = vec![
            slot("rt1", "s1", "math", "tx"),
            slot("rt2", "s2", "eng", "ty"),
        ];
        let out = overlay_day(&template, &[]);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].effective_subject_id, "math");
        assert_eq!(out[0].effective_teacher_id, "tx");
        assert!(out[0].session.is_none());
        assert_eq!(out[1].template_id, "rt2");
        assert!(out[1].session.is_none());
    }

    #[test]
    fn overlay_applies_override_only_to_its_slot() {
        let template = vec![
            slot("rt1", "s1", "math", "tx"),
            slot("rt2", "s2", "eng", "ty"),
        ];
        let overrides = vec![DailyOverride {
            session_id: "ds1".to_string(),
            routine_template_id: Some("rt1".to_string()),
            subject_override_id: None,
            teacher_override_id: Some("tz".to_string()),
            actual_teacher_id: Some("tz".to_string()),
            status: "CONDUCTED".to_string(),
            attendance_marked: false,
            remarks: None,
        }];
        let out = overlay_day(&template, &overrides);
        // Substituted teacher, subject falls through from the template.
        assert_eq!(out[0].effective_teacher_id, "tz");
        assert_eq!(out[0].effective_subject_id, "math");
        assert_eq!(
            out[0].session.as_ref().map(|s| s.status.as_str()),
            Some("CONDUCTED")
        );
        assert_eq!(out[1].effective_teacher_id, "ty");
        assert!(out[1].session.is_none());
    }

    #[test]
    fn overlay_ignores_ad_hoc_sessions() {
        let template = vec![slot("rt1", "s1", "math", "tx")];
        let overrides = vec![DailyOverride {
            session_id: "ds9".to_string(),
            routine_template_id: None,
            subject_override_id: Some("extra".to_string()),
            teacher_override_id: Some("tz".to_string()),
            actual_teacher_id: None,
            status: "SCHEDULED".to_string(),
            attendance_marked: false,
            remarks: None,
        }];
        let out = overlay_day(&template, &overrides);
        assert_eq!(out.len(), 1);
        assert!(out[0].session.is_none());
        assert_eq!(out[0].effective_teacher_id, "tx");
    }
}
