use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::TemplateReference;

/// A one-off campaign sending one or more template variations to an
/// audience, optionally through an A/B test phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Broadcast {
    pub id: String,
    pub name: String,
    pub audience: AudienceSettings,
    pub schedule: Schedule,
    /// 1..N arms; more than one only makes sense with `ab_test`.
    pub variations: Vec<Variation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ab_test: Option<AbTestSettings>,
    pub status: BroadcastStatus,
    pub integration_id: String,

    pub test_recipient_count: i64,
    pub winner_recipient_count: i64,
    pub total_recipient_count: i64,

    /// Audience cursor (last enqueued email) persisted after every batch;
    /// resume starts strictly after it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_cursor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub winner_template: Option<TemplateReference>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_ends_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AudienceSettings {
    pub list_ids: Vec<String>,
    #[serde(default)]
    pub segment_ids: Vec<String>,
    /// Drop contacts whose membership is unsubscribed/bounced/complained on
    /// any configured list.
    #[serde(default = "default_true")]
    pub exclude_suppressed: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Schedule {
    Immediate,
    At {
        at: DateTime<Utc>,
        timezone: String,
    },
}

impl Schedule {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self {
            Self::Immediate => true,
            Self::At { at, .. } => *at <= now,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Variation {
    pub template: TemplateReference,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject_override: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbTestSettings {
    /// Recipients in the test phase, partitioned across variations.
    pub test_phase_recipient_count: i64,
    pub winner_metric: WinnerMetric,
    pub test_duration_minutes: i64,
    /// With `manual` winner selection the broadcast parks in
    /// `test_completed` until an operator picks; otherwise the orchestrator
    /// proceeds on its own.
    #[serde(default = "default_true")]
    pub auto_send_winner: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WinnerMetric {
    Opens,
    Clicks,
    Conversions,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BroadcastStatus {
    Draft,
    Scheduled,
    Testing,
    TestCompleted,
    WinnerSelected,
    Sending,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl BroadcastStatus {
    /// Check if transition is valid. Transitions are monotonic except for
    /// pause/resume.
    pub fn can_transition_to(&self, target: BroadcastStatus) -> bool {
        use BroadcastStatus::*;

        match (self, target) {
            // From Draft
            (Draft, Scheduled) => true,
            (Draft, Cancelled) => true,

            // From Scheduled
            (Scheduled, Sending) => true,
            (Scheduled, Testing) => true,
            (Scheduled, Cancelled) => true,

            // From Testing
            (Testing, TestCompleted) => true,
            (Testing, Paused) => true,
            (Testing, Failed) => true,
            (Testing, Cancelled) => true,

            // From TestCompleted
            (TestCompleted, WinnerSelected) => true,
            (TestCompleted, Cancelled) => true,

            // From WinnerSelected
            (WinnerSelected, Sending) => true,
            (WinnerSelected, Cancelled) => true,

            // From Sending
            (Sending, Completed) => true,
            (Sending, Paused) => true,
            (Sending, Failed) => true,
            (Sending, Cancelled) => true,

            // From Paused
            (Paused, Sending) => true,
            (Paused, Testing) => true,
            (Paused, Cancelled) => true,

            // Terminal states cannot transition
            (Completed, _) => false,
            (Failed, _) => false,
            (Cancelled, _) => false,

            _ => false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Scheduled => "scheduled",
            Self::Testing => "testing",
            Self::TestCompleted => "test_completed",
            Self::WinnerSelected => "winner_selected",
            Self::Sending => "sending",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(Self::Draft),
            "scheduled" => Some(Self::Scheduled),
            "testing" => Some(Self::Testing),
            "test_completed" => Some(Self::TestCompleted),
            "winner_selected" => Some(Self::WinnerSelected),
            "sending" => Some(Self::Sending),
            "paused" => Some(Self::Paused),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" | "canceled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for BroadcastStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Broadcast {
    pub fn has_ab_test(&self) -> bool {
        self.ab_test.is_some() && self.variations.len() > 1
    }

    /// Template to use outside the test phase: the winner if one was
    /// picked, else the only variation.
    pub fn sending_template(&self) -> Option<&TemplateReference> {
        self.winner_template
            .as_ref()
            .or_else(|| self.variations.first().map(|v| &v.template))
    }

    /// Whether definition edits are allowed; a broadcast that started
    /// sending (or testing) is immutable.
    pub fn is_editable(&self) -> bool {
        matches!(
            self.status,
            BroadcastStatus::Draft | BroadcastStatus::Scheduled
        )
    }

    pub fn validate(&self) -> Result<()> {
        if self.variations.is_empty() {
            bail!("broadcast requires at least one variation");
        }
        if self.audience.list_ids.is_empty() {
            bail!("broadcast audience requires at least one list");
        }
        if let Some(ab) = &self.ab_test {
            if self.variations.len() < 2 {
                bail!("A/B test requires at least two variations");
            }
            if ab.test_phase_recipient_count <= 0 {
                bail!("test phase recipient count must be positive");
            }
            if ab.test_duration_minutes <= 0 {
                bail!("test duration must be positive");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broadcast_transitions() {
        use BroadcastStatus::*;

        assert!(Draft.can_transition_to(Scheduled));
        assert!(Scheduled.can_transition_to(Testing));
        assert!(Scheduled.can_transition_to(Sending));
        assert!(Testing.can_transition_to(TestCompleted));
        assert!(TestCompleted.can_transition_to(WinnerSelected));
        assert!(WinnerSelected.can_transition_to(Sending));
        assert!(Sending.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Sending));

        assert!(!Draft.can_transition_to(Sending));
        assert!(!Sending.can_transition_to(Scheduled));
        assert!(!Completed.can_transition_to(Sending));
        assert!(!Cancelled.can_transition_to(Sending));
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            BroadcastStatus::Draft,
            BroadcastStatus::TestCompleted,
            BroadcastStatus::WinnerSelected,
            BroadcastStatus::Cancelled,
        ] {
            assert_eq!(BroadcastStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(BroadcastStatus::parse("bogus"), None);
    }

    #[test]
    fn test_schedule_due() {
        let now = Utc::now();
        assert!(Schedule::Immediate.is_due(now));
        assert!(Schedule::At {
            at: now - chrono::Duration::minutes(1),
            timezone: "UTC".to_string()
        }
        .is_due(now));
        assert!(!Schedule::At {
            at: now + chrono::Duration::minutes(1),
            timezone: "UTC".to_string()
        }
        .is_due(now));
    }

    fn broadcast_with(variations: usize, ab_test: bool) -> Broadcast {
        Broadcast {
            id: "bc-1".to_string(),
            name: "Launch".to_string(),
            audience: AudienceSettings {
                list_ids: vec!["list-1".to_string()],
                ..Default::default()
            },
            schedule: Schedule::Immediate,
            variations: (0..variations)
                .map(|i| Variation {
                    template: TemplateReference::new(format!("tpl-{i}"), 1),
                    subject_override: None,
                })
                .collect(),
            ab_test: ab_test.then(|| AbTestSettings {
                test_phase_recipient_count: 100,
                winner_metric: WinnerMetric::Opens,
                test_duration_minutes: 30,
                auto_send_winner: true,
            }),
            status: BroadcastStatus::Draft,
            integration_id: "int-1".to_string(),
            test_recipient_count: 0,
            winner_recipient_count: 0,
            total_recipient_count: 0,
            last_cursor: None,
            winner_template: None,
            test_ends_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_validate() {
        assert!(broadcast_with(1, false).validate().is_ok());
        assert!(broadcast_with(2, true).validate().is_ok());
        assert!(broadcast_with(1, true).validate().is_err());

        let mut no_lists = broadcast_with(1, false);
        no_lists.audience.list_ids.clear();
        assert!(no_lists.validate().is_err());
    }

    #[test]
    fn test_editability() {
        let mut broadcast = broadcast_with(1, false);
        assert!(broadcast.is_editable());
        broadcast.status = BroadcastStatus::Sending;
        assert!(!broadcast.is_editable());
    }
}
