//! Run reports.
//!
//! Buttons are tested on several devices at once, so consecutive buttons in
//! the plan belong to different devices under test. Results are partitioned
//! round-robin into a fixed number of groups (4 on the production fixture)
//! and each group is judged on its own:
//!
//! ```text
//! group approved = approval_rate >= 0.80 AND mean_similarity >= 0.70
//! ```
//!
//! Rates count only buttons with at least one camera that found a reference.
//! Unvalidated buttons stay in the per-button summary. A group with no
//! validated button is reported as `no_data` and is never approved.
//! [`aggregate`] is pure; persistence lives in [`archive`].

pub mod archive;

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::hardware::infrared::InfraredOutcome;
use crate::plan::ButtonTarget;
use crate::vision::ValidationResult;

/// Minimum share of approved buttons for a group to pass.
pub const GROUP_APPROVAL_RATE: f64 = 0.80;

/// Minimum mean similarity for a group to pass.
///
/// Distinct from the per-button threshold used by the image validator.
pub const GROUP_SIMILARITY_THRESHOLD: f64 = 0.70;

/// Grouping and approval rules.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupPolicy {
    /// Number of devices under test per run.
    pub group_count: u32,
    /// Minimum approval rate.
    pub approval_rate: f64,
    /// Minimum mean similarity.
    pub similarity_threshold: f64,
}

impl Default for GroupPolicy {
    fn default() -> Self {
        Self {
            group_count: 4,
            approval_rate: GROUP_APPROVAL_RATE,
            similarity_threshold: GROUP_SIMILARITY_THRESHOLD,
        }
    }
}

impl GroupPolicy {
    /// One-based group of the zero-based `button_index`.
    pub fn group_of(&self, button_index: usize) -> u32 {
        let count = self.group_count.max(1) as usize;
        (button_index % count) as u32 + 1
    }
}

/// Result of one button.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ButtonResult {
    /// Zero-based position in the plan.
    pub index: usize,
    /// The button visited.
    pub target: ButtonTarget,
    /// When the button finished.
    pub timestamp: DateTime<Utc>,
    /// Infrared capture, when one was requested.
    pub infrared: Option<InfraredOutcome>,
    /// One result per registered camera.
    pub cameras: Vec<ValidationResult>,
    /// AND over cameras that found a reference (true when none did).
    #[serde(rename = "aprovado")]
    pub approved: bool,
    /// Mean combined score over validated cameras.
    pub similarity: Option<f64>,
}

impl ButtonResult {
    /// Build a result, deriving approval and similarity from `cameras`.
    pub fn new(
        index: usize,
        target: ButtonTarget,
        cameras: Vec<ValidationResult>,
        infrared: Option<InfraredOutcome>,
    ) -> Self {
        let validated: Vec<&ValidationResult> = cameras.iter().filter(|c| c.reference_found).collect();
        let approved = validated.iter().all(|c| c.approved);
        let similarity = mean(validated.iter().map(|c| c.combined_score));
        Self {
            index,
            target,
            timestamp: Utc::now(),
            infrared,
            cameras,
            approved,
            similarity,
        }
    }

    /// Whether any camera compared this button against a reference.
    pub fn is_validated(&self) -> bool {
        self.similarity.is_some()
    }
}

/// Whether a group had anything to judge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupStatus {
    /// At least one button was validated against a reference.
    Evaluated,
    /// No button in this group could be validated.
    NoData,
}

/// One line of a group's per-button summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ButtonSummary {
    /// Zero-based position in the plan.
    pub index: usize,
    /// Button name.
    pub name: String,
    /// Button approval.
    #[serde(rename = "aprovado")]
    pub approved: bool,
    /// Mean combined score, if any camera validated.
    pub similarity: Option<f64>,
}

/// Verdict for one device under test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupReport {
    /// One-based group index.
    pub group: u32,
    /// Whether the group had buttons.
    pub status: GroupStatus,
    /// Buttons in the group.
    pub total: usize,
    /// Buttons compared against at least one reference.
    pub validated: usize,
    /// Approved validated buttons.
    pub approved_count: usize,
    /// Rejected validated buttons.
    pub rejected_count: usize,
    /// `approved_count / validated`; absent without data.
    pub approval_rate: Option<f64>,
    /// Mean of the buttons' similarities; absent when nothing validated.
    pub mean_similarity: Option<f64>,
    /// Group verdict.
    #[serde(rename = "aprovado")]
    pub approved: bool,
    /// Per-button summary.
    pub buttons: Vec<ButtonSummary>,
}

/// Run-level counts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Buttons processed.
    pub total_buttons: usize,
    /// Validated buttons approved.
    pub approved_buttons: usize,
    /// Validated buttons rejected.
    pub rejected_buttons: usize,
    /// Buttons no camera could validate.
    pub unvalidated_buttons: usize,
    /// Fixed number of groups.
    pub group_count: u32,
    /// Groups approved.
    pub groups_approved: u32,
    /// Groups not approved (including groups without data).
    pub groups_rejected: u32,
    /// Operator-facing line, e.g. `4/4 groups approved`.
    pub text: String,
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    /// Every button was processed.
    Completed,
    /// The continue flag was cleared before the end of the plan.
    Interrupted,
    /// The run ended in Emergency.
    Aborted {
        /// What escaped the per-button boundary.
        reason: String,
    },
}

/// Run metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    /// Unique run identifier.
    pub run_id: Uuid,
    /// Monotonic run counter since process start.
    pub run_index: u64,
    /// Fixture side the run primed.
    pub side: u8,
    /// Run start.
    pub started_at: DateTime<Utc>,
    /// Run end.
    pub finished_at: DateTime<Utc>,
    /// Directory holding this run's frames and report.
    pub photo_dir: PathBuf,
    /// How the run ended.
    pub outcome: RunOutcome,
}

/// The consolidated artifact of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    /// Run metadata.
    pub metadata: RunMetadata,
    /// Button results in plan order.
    pub buttons: Vec<ButtonResult>,
    /// Group verdicts keyed by one-based group index.
    pub groups: BTreeMap<u32, GroupReport>,
    /// Run-level counts.
    pub summary: RunSummary,
}

impl RunReport {
    /// Whether every group passed.
    pub fn all_groups_approved(&self) -> bool {
        self.summary.groups_approved == self.summary.group_count
    }
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    (count > 0).then(|| sum / count as f64)
}

fn group_report(group: u32, members: &[&ButtonResult], policy: &GroupPolicy) -> GroupReport {
    let validated: Vec<&ButtonResult> = members.iter().copied().filter(|b| b.is_validated()).collect();
    let approved_count = validated.iter().filter(|b| b.approved).count();
    let approval_rate = (!validated.is_empty()).then(|| approved_count as f64 / validated.len() as f64);
    let mean_similarity = mean(validated.iter().filter_map(|b| b.similarity));

    let approved = matches!(
        (approval_rate, mean_similarity),
        (Some(rate), Some(sim)) if rate >= policy.approval_rate && sim >= policy.similarity_threshold
    );

    GroupReport {
        group,
        status: if validated.is_empty() {
            GroupStatus::NoData
        } else {
            GroupStatus::Evaluated
        },
        total: members.len(),
        validated: validated.len(),
        approved_count,
        rejected_count: validated.len() - approved_count,
        approval_rate,
        mean_similarity,
        approved,
        buttons: members
            .iter()
            .map(|b| ButtonSummary {
                index: b.index,
                name: b.target.name.clone(),
                approved: b.approved,
                similarity: b.similarity,
            })
            .collect(),
    }
}

/// Group `buttons` and compute every verdict.
pub fn aggregate(metadata: RunMetadata, buttons: Vec<ButtonResult>, policy: &GroupPolicy) -> RunReport {
    let group_count = policy.group_count.max(1);
    let mut groups = BTreeMap::new();
    for group in 1..=group_count {
        let members: Vec<&ButtonResult> = buttons
            .iter()
            .filter(|b| policy.group_of(b.index) == group)
            .collect();
        groups.insert(group, group_report(group, &members, policy));
    }

    let groups_approved = groups.values().filter(|g| g.approved).count() as u32;
    let validated = buttons.iter().filter(|b| b.is_validated()).count();
    let approved_buttons = buttons.iter().filter(|b| b.is_validated() && b.approved).count();
    let summary = RunSummary {
        total_buttons: buttons.len(),
        approved_buttons,
        rejected_buttons: validated - approved_buttons,
        unvalidated_buttons: buttons.len() - validated,
        group_count,
        groups_approved,
        groups_rejected: group_count - groups_approved,
        text: format!("{groups_approved}/{group_count} groups approved"),
    };

    RunReport {
        metadata,
        buttons,
        groups,
        summary,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validation(camera: u8, score: f64, found: bool) -> ValidationResult {
        ValidationResult {
            camera,
            template_score: score,
            histogram_score: score,
            combined_score: score,
            approved: found && score >= crate::vision::BUTTON_APPROVAL_THRESHOLD,
            reference_path: found.then(|| PathBuf::from(format!("cam{camera}.png"))),
            reference_found: found,
            error: None,
        }
    }

    fn button(index: usize, scores: &[(f64, bool)]) -> ButtonResult {
        let cameras = scores
            .iter()
            .enumerate()
            .map(|(i, (s, found))| validation(i as u8 + 1, *s, *found))
            .collect();
        ButtonResult::new(index, ButtonTarget::new(format!("b{index}"), 0.0, 0.0), cameras, None)
    }

    fn metadata() -> RunMetadata {
        RunMetadata {
            run_id: Uuid::new_v4(),
            run_index: 1,
            side: 1,
            started_at: Utc::now(),
            finished_at: Utc::now(),
            photo_dir: PathBuf::from("runs/1"),
            outcome: RunOutcome::Completed,
        }
    }

    #[test]
    fn button_approval_ignores_cameras_without_reference() {
        assert!(button(0, &[(0.9, true), (0.0, false)]).approved);
        assert!(!button(0, &[(0.9, true), (0.5, true)]).approved);

        let vacuous = button(0, &[(0.0, false), (0.0, false)]);
        assert!(vacuous.approved);
        assert_eq!(vacuous.similarity, None);
    }

    #[test]
    fn buttons_are_assigned_round_robin() {
        let policy = GroupPolicy::default();
        let groups: Vec<u32> = (0..6).map(|i| policy.group_of(i)).collect();
        assert_eq!(groups, vec![1, 2, 3, 4, 1, 2]);
    }

    #[test]
    fn group_needs_rate_and_similarity() {
        // group 1 gets buttons 0, 4, 8, 12, 16
        let mut buttons = Vec::new();
        for i in 0..20 {
            let score = if i == 16 { 0.5 } else { 0.9 };
            buttons.push(button(i, &[(score, true)]));
        }
        let report = aggregate(metadata(), buttons, &GroupPolicy::default());

        let g1 = &report.groups[&1];
        assert_eq!((g1.total, g1.approved_count, g1.rejected_count), (5, 4, 1));
        assert_eq!(g1.approval_rate, Some(0.8));
        assert!(g1.approved, "4/5 approved with mean {:?}", g1.mean_similarity);

        let policy = GroupPolicy {
            similarity_threshold: 0.85,
            ..GroupPolicy::default()
        };
        let buttons = report.buttons.clone();
        let strict = aggregate(metadata(), buttons, &policy);
        assert!(!strict.groups[&1].approved);
        assert!(strict.groups[&2].approved);
    }

    #[test]
    fn empty_groups_report_no_data() {
        let report = aggregate(metadata(), vec![button(0, &[(0.95, true)])], &GroupPolicy::default());
        assert_eq!(report.groups.len(), 4);
        assert_eq!(report.groups[&1].status, GroupStatus::Evaluated);

        let empty = &report.groups[&3];
        assert_eq!(empty.status, GroupStatus::NoData);
        assert_eq!(empty.approval_rate, None);
        assert!(!empty.approved);
        assert_eq!(report.summary.text, "1/4 groups approved");
        assert_eq!(report.summary.groups_rejected, 3);
    }

    #[test]
    fn unvalidated_buttons_do_not_count_toward_rates() {
        // group 1: buttons 0, 4, 8, 12 without references, 16 validated and rejected
        let mut buttons: Vec<ButtonResult> = (0..16).map(|i| button(i, &[(0.0, false)])).collect();
        buttons.push(button(16, &[(0.74, true)]));
        let report = aggregate(metadata(), buttons, &GroupPolicy::default());

        let g1 = &report.groups[&1];
        assert_eq!(g1.status, GroupStatus::Evaluated);
        assert_eq!((g1.total, g1.validated), (5, 1));
        assert_eq!((g1.approved_count, g1.rejected_count), (0, 1));
        assert_eq!(g1.approval_rate, Some(0.0));
        assert!(!g1.approved);
        assert_eq!(g1.buttons.len(), 5);

        let g2 = &report.groups[&2];
        assert_eq!(g2.status, GroupStatus::NoData);
        assert_eq!((g2.total, g2.validated), (4, 0));
        assert_eq!(g2.approval_rate, None);
        assert!(!g2.approved);

        assert_eq!(report.summary.unvalidated_buttons, 16);
        assert_eq!(report.summary.rejected_buttons, 1);
        assert_eq!(report.summary.text, "0/4 groups approved");
    }

    #[test]
    fn all_groups_pass_with_good_scores() {
        let buttons = (0..16).map(|i| button(i, &[(0.95, true), (0.95, true)])).collect();
        let report = aggregate(metadata(), buttons, &GroupPolicy::default());
        assert!(report.all_groups_approved());
        assert_eq!(report.summary.text, "4/4 groups approved");
        assert_eq!(report.summary.approved_buttons, 16);
    }

    #[test]
    fn report_uses_dashboard_keys() {
        let report = aggregate(metadata(), vec![button(0, &[(0.95, true)])], &GroupPolicy::default());
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["groups"]["1"]["aprovado"], true);
        assert_eq!(json["buttons"][0]["cameras"][0]["imagem_referencia_encontrada"], true);
        assert_eq!(json["metadata"]["outcome"]["status"], "completed");
    }
}
