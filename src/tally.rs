use crate::credits::ReviewStatus;
use serde::Serialize;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttendanceStatus {
    Present,
    Absent,
    Excused,
}

impl AttendanceStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "present" => Some(Self::Present),
            "absent" => Some(Self::Absent),
            "excused" => Some(Self::Excused),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Present => "present",
            Self::Absent => "absent",
            Self::Excused => "excused",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Present => "Present",
            Self::Absent => "Absent",
            Self::Excused => "Excused",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceTally {
    pub present: usize,
    pub absent: usize,
    pub excused: usize,
    pub unmarked: usize,
    pub total: usize,
    pub attendance_rate: f64,
}

/// Rate is over marked students only. Excused rows join the numerator
/// when `count_excused_as_present` is set.
pub fn tally_attendance<I>(marks: I, count_excused_as_present: bool) -> AttendanceTally
where
    I: IntoIterator<Item = Option<AttendanceStatus>>,
{
    let mut t = AttendanceTally::default();
    for m in marks {
        t.total += 1;
        match m {
            Some(AttendanceStatus::Present) => t.present += 1,
            Some(AttendanceStatus::Absent) => t.absent += 1,
            Some(AttendanceStatus::Excused) => t.excused += 1,
            None => t.unmarked += 1,
        }
    }
    let marked = t.present + t.absent + t.excused;
    let attended = if count_excused_as_present {
        t.present + t.excused
    } else {
        t.present
    };
    t.attendance_rate = if marked > 0 {
        round_rate(attended as f64 / marked as f64)
    } else {
        0.0
    };
    t
}

pub fn round_rate(r: f64) -> f64 {
    (r * 10_000.0).round() / 10_000.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    CompletionLetter,
    OutcomeForm,
    FeedbackForm,
    Video,
}

impl DocumentKind {
    pub const ALL: [DocumentKind; 4] = [
        DocumentKind::CompletionLetter,
        DocumentKind::OutcomeForm,
        DocumentKind::FeedbackForm,
        DocumentKind::Video,
    ];

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "completion_letter" => Some(Self::CompletionLetter),
            "outcome_form" => Some(Self::OutcomeForm),
            "feedback_form" => Some(Self::FeedbackForm),
            "video" => Some(Self::Video),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::CompletionLetter => "completion_letter",
            Self::OutcomeForm => "outcome_form",
            Self::FeedbackForm => "feedback_form",
            Self::Video => "video",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::CompletionLetter => "Completion Letter",
            Self::OutcomeForm => "Outcome Form",
            Self::FeedbackForm => "Feedback Form",
            Self::Video => "Video",
        }
    }

    pub fn allowed_extensions(self) -> &'static [&'static str] {
        match self {
            Self::Video => &["mp4", "mov", "webm", "mkv"],
            _ => &["pdf", "doc", "docx", "jpg", "jpeg", "png"],
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KindState {
    pub kind: DocumentKind,
    pub label: &'static str,
    /// `missing`, or the review status of the stored document.
    pub state: &'static str,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldProjectStatus {
    pub kinds: Vec<KindState>,
    pub submitted_count: usize,
    pub approved_count: usize,
    pub required_count: usize,
    pub complete: bool,
    pub fully_approved: bool,
}

impl FieldProjectStatus {
    pub fn state_of(&self, kind: DocumentKind) -> &'static str {
        self.kinds
            .iter()
            .find(|k| k.kind == kind)
            .map(|k| k.state)
            .unwrap_or("missing")
    }
}

/// Counts distinct kinds. A rejected document does not count as submitted.
pub fn field_project_status<I>(docs: I) -> FieldProjectStatus
where
    I: IntoIterator<Item = (DocumentKind, ReviewStatus)>,
{
    let mut by_kind: HashMap<DocumentKind, ReviewStatus> = HashMap::new();
    for (kind, status) in docs {
        by_kind.insert(kind, status);
    }

    let kinds: Vec<KindState> = DocumentKind::ALL
        .iter()
        .map(|k| KindState {
            kind: *k,
            label: k.label(),
            state: by_kind.get(k).map(|s| s.as_str()).unwrap_or("missing"),
        })
        .collect();
    let submitted_count = by_kind
        .values()
        .filter(|s| **s != ReviewStatus::Rejected)
        .count();
    let approved_count = by_kind
        .values()
        .filter(|s| **s == ReviewStatus::Approved)
        .count();
    let required_count = DocumentKind::ALL.len();

    FieldProjectStatus {
        kinds,
        submitted_count,
        approved_count,
        required_count,
        complete: submitted_count == required_count,
        fully_approved: approved_count == required_count,
    }
}
