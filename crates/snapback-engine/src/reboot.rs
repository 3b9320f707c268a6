//! Reboot policy: decides whether this cycle's capture reboots the source.
//!
//! A recurrence rule on the instance forces a reboot on the days it names;
//! between those days (and for instances tagged `NoReboot`) the capture runs
//! without pausing the source. The engine's own host is never rebooted.

use chrono::{DateTime, Utc};
use rrule::{RRule, RRuleError, Tz, Unvalidated};
use snapback_common::{format_stamp, CloudInventory, Instance, Result, REBOOT_STAMP_TAG};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RebootDecision {
    /// A recurrence rule names a day on or before now.
    pub force_reboot: bool,
    /// Capture without pausing the source. Always true for the engine's own
    /// host; otherwise forced reboots override `NoReboot` and rule presence.
    pub skip_reboot: bool,
}

/// Pure policy decision for one instance at `now`.
pub fn decide(instance: &Instance, own_instance_id: Option<&str>, now: DateTime<Utc>) -> RebootDecision {
    let is_self = own_instance_id == Some(instance.id.as_str());

    let mut force_reboot = false;
    if let Some(rule) = instance.reboot_rule() {
        let anchor = instance.reboot_anchor();
        match next_due(rule, anchor, now) {
            Ok(Some(due)) => {
                debug!(instance_id = %instance.id, %due, "reboot rule occurrence is due");
                force_reboot = true;
            }
            Ok(None) => {}
            Err(e) => {
                warn!(instance_id = %instance.id, rule, error = %e, "ignoring malformed reboot rule");
            }
        }
    }

    let skip_reboot = (!force_reboot
        && (instance.wants_no_reboot() || instance.reboot_rule().is_some()))
        || is_self;

    RebootDecision {
        force_reboot,
        skip_reboot,
    }
}

/// Stamps the instance with `LastRebootTime` ahead of the capture, so a
/// crash between stamping and imaging cannot double-reboot on retry.
pub async fn record_reboot(
    inventory: &dyn CloudInventory,
    instance: &Instance,
    now: DateTime<Utc>,
) -> Result<()> {
    let stamp = format_stamp(now);
    info!(instance_id = %instance.id, %stamp, "recording reboot stamp");
    inventory
        .tag_resource(&instance.region, &instance.id, REBOOT_STAMP_TAG, &stamp)
        .await
}

/// First rule occurrence strictly after `anchor` that is on or before `now`.
///
/// Occurrences are evaluated at day granularity: the rule is overridden to
/// fire at midnight UTC, and an occurrence exactly at midnight is due from
/// that instant onward. The anchor itself never counts, so an anchor landing
/// on an occurrence does not re-trigger on the very next cycle.
fn next_due(
    rule: &str,
    anchor: DateTime<Utc>,
    now: DateTime<Utc>,
) -> std::result::Result<Option<DateTime<Utc>>, RRuleError> {
    // The time override caps occurrences at one per matching day, so only
    // an anchor-coincident occurrence can precede the one we want.
    const OCCURRENCE_SCAN_LIMIT: usize = 8;

    let rule: RRule<Unvalidated> = rule.parse()?;
    let rule = rule.by_hour(vec![0]).by_minute(vec![0]).by_second(vec![0]);
    let set = rule.build(anchor.with_timezone(&Tz::UTC))?;
    for occurrence in set.into_iter().take(OCCURRENCE_SCAN_LIMIT) {
        let occurrence = occurrence.with_timezone(&Utc);
        if occurrence <= anchor {
            continue;
        }
        return Ok(if occurrence <= now { Some(occurrence) } else { None });
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use snapback_common::{NO_REBOOT_TAG, REBOOT_RRULE_TAG, REBOOT_STAMP_TAG};

    fn instance(launch: DateTime<Utc>, tags: &[(&str, &str)]) -> Instance {
        Instance {
            id: "i-aaaa".into(),
            region: "eu-west-1".into(),
            launch_time: launch,
            tags: tags
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn default_policy_reboots() {
        let decision = decide(&instance(at(2024, 1, 1, 8, 0, 0), &[]), None, at(2024, 1, 5, 12, 0, 0));
        assert!(!decision.force_reboot);
        assert!(!decision.skip_reboot);
    }

    #[test]
    fn no_reboot_tag_skips() {
        let decision = decide(
            &instance(at(2024, 1, 1, 8, 0, 0), &[(NO_REBOOT_TAG, "")]),
            None,
            at(2024, 1, 5, 12, 0, 0),
        );
        assert!(!decision.force_reboot);
        assert!(decision.skip_reboot);
    }

    #[test]
    fn own_host_always_skips() {
        // Rule is overdue, but self-protection wins.
        let target = instance(
            at(2024, 1, 1, 8, 0, 0),
            &[(REBOOT_RRULE_TAG, "FREQ=DAILY")],
        );
        let decision = decide(&target, Some("i-aaaa"), at(2024, 1, 5, 12, 0, 0));
        assert!(decision.force_reboot);
        assert!(decision.skip_reboot);
    }

    #[test]
    fn rule_not_yet_due_skips_reboot() {
        // Anchored this morning after midnight; the next daily occurrence is
        // tomorrow's midnight.
        let target = instance(
            at(2024, 1, 5, 0, 30, 0),
            &[(REBOOT_RRULE_TAG, "FREQ=DAILY")],
        );
        let decision = decide(&target, None, at(2024, 1, 5, 12, 0, 0));
        assert!(!decision.force_reboot);
        assert!(decision.skip_reboot);
    }

    #[test]
    fn due_rule_forces_reboot_despite_no_reboot_tag() {
        let target = instance(
            at(2024, 1, 1, 8, 0, 0),
            &[(REBOOT_RRULE_TAG, "FREQ=DAILY"), (NO_REBOOT_TAG, "")],
        );
        let decision = decide(&target, None, at(2024, 1, 3, 12, 0, 0));
        assert!(decision.force_reboot);
        assert!(!decision.skip_reboot);
    }

    #[test]
    fn anchor_prefers_last_reboot_stamp() {
        // Launched long ago, but rebooted this morning after midnight: the
        // stamped anchor pushes the next occurrence past now.
        let target = instance(
            at(2023, 6, 1, 8, 0, 0),
            &[
                (REBOOT_RRULE_TAG, "FREQ=DAILY"),
                (REBOOT_STAMP_TAG, "2024-01-05T00:30:00Z"),
            ],
        );
        let decision = decide(&target, None, at(2024, 1, 5, 12, 0, 0));
        assert!(!decision.force_reboot);
        assert!(decision.skip_reboot);
    }

    #[test]
    fn midnight_occurrence_is_due_from_that_instant() {
        let target = instance(
            at(2024, 1, 1, 6, 0, 0),
            &[(REBOOT_RRULE_TAG, "FREQ=DAILY")],
        );
        // One second before the first occurrence: not due.
        let before = decide(&target, None, at(2024, 1, 1, 23, 59, 59));
        assert!(!before.force_reboot);
        // Exactly at midnight: due.
        let at_midnight = decide(&target, None, at(2024, 1, 2, 0, 0, 0));
        assert!(at_midnight.force_reboot);
        assert!(!at_midnight.skip_reboot);
    }

    #[test]
    fn anchor_on_an_occurrence_does_not_retrigger() {
        let target = instance(
            at(2024, 1, 1, 0, 0, 0),
            &[(REBOOT_RRULE_TAG, "FREQ=DAILY")],
        );
        let decision = decide(&target, None, at(2024, 1, 1, 12, 0, 0));
        assert!(!decision.force_reboot);
        assert!(decision.skip_reboot);
    }

    #[test]
    fn weekly_rule_fires_on_named_day() {
        // 2024-01-01 is a Monday; rule fires on Sundays.
        let target = instance(
            at(2024, 1, 1, 8, 0, 0),
            &[(REBOOT_RRULE_TAG, "FREQ=WEEKLY;BYDAY=SU")],
        );
        let saturday = decide(&target, None, at(2024, 1, 6, 12, 0, 0));
        assert!(!saturday.force_reboot);
        let sunday = decide(&target, None, at(2024, 1, 7, 12, 0, 0));
        assert!(sunday.force_reboot);
        assert!(!sunday.skip_reboot);
    }

    #[test]
    fn malformed_rule_never_forces_and_never_panics() {
        let target = instance(
            at(2024, 1, 1, 8, 0, 0),
            &[(REBOOT_RRULE_TAG, "not-a-rule")],
        );
        let decision = decide(&target, None, at(2024, 1, 5, 12, 0, 0));
        assert!(!decision.force_reboot);
        // The rule tag is still present, so the capture runs without reboot.
        assert!(decision.skip_reboot);
    }
}
