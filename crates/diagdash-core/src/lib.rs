//! Core domain model for the diagnostic lead dashboard.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, FixedOffset, NaiveDate, Offset, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "diagdash-core";

/// Campaign selector value meaning "no campaign constraint".
pub const ALL_CAMPAIGNS: &str = "all";

/// Row exactly as the remote store returned it, keyed by store-defined labels.
pub type RawRecord = serde_json::Map<String, serde_json::Value>;

/// Stable internal shape of one diagnostic submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub name: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub utm_campaign: Option<String>,
    pub utm_source: Option<String>,
    pub utm_medium: Option<String>,
    pub utm_content: Option<String>,
    pub respondent_profile: String,
    pub age_bracket: String,
    pub familiarity: String,
    pub employment_status: String,
    pub salary_bracket: String,
    pub first_time_attendee: String,
    pub learning_gap: String,
}

impl CanonicalRecord {
    /// Record with the required keys set and every other field at its mapping default.
    pub fn bare(id: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            created_at,
            name: None,
            phone: None,
            email: None,
            utm_campaign: None,
            utm_source: None,
            utm_medium: None,
            utm_content: None,
            respondent_profile: String::new(),
            age_bracket: String::new(),
            familiarity: String::new(),
            employment_status: String::new(),
            salary_bracket: String::new(),
            first_time_attendee: String::new(),
            learning_gap: String::new(),
        }
    }
}

/// Immutable, ordered, id-deduplicated copy of the remote record set.
///
/// Records keep the order the store delivered them in (newest first). A snapshot is
/// never mutated after construction; refreshing produces a new one with a higher
/// generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    generation: u64,
    synced_at: DateTime<Utc>,
    records: Vec<CanonicalRecord>,
}

impl Snapshot {
    pub fn new(generation: u64, synced_at: DateTime<Utc>, records: Vec<CanonicalRecord>) -> Self {
        Self {
            generation,
            synced_at,
            records,
        }
    }

    pub fn empty() -> Self {
        Self::new(0, DateTime::<Utc>::UNIX_EPOCH, Vec::new())
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn synced_at(&self) -> DateTime<Utc> {
        self.synced_at
    }

    pub fn records(&self) -> &[CanonicalRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// User-selected constraints applied before aggregation.
///
/// Missing bounds are unbounded on that side. Calendar days are interpreted in
/// `utc_offset`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FilterSpec {
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub campaign: Option<String>,
    pub utc_offset: FixedOffset,
}

impl Default for FilterSpec {
    fn default() -> Self {
        Self {
            start_date: None,
            end_date: None,
            campaign: None,
            utc_offset: Utc.fix(),
        }
    }
}

impl FilterSpec {
    pub fn with_offset(utc_offset: FixedOffset) -> Self {
        Self {
            utc_offset,
            ..Self::default()
        }
    }

    /// Campaign the records must match, or `None` when every campaign passes.
    pub fn campaign_constraint(&self) -> Option<&str> {
        match self.campaign.as_deref() {
            None | Some("") | Some(ALL_CAMPAIGNS) => None,
            Some(campaign) => Some(campaign),
        }
    }
}

/// The charts the dashboard derives from a filtered snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChartKind {
    AdPerformance,
    Source,
    AgeBracket,
    EmploymentStatus,
}

impl ChartKind {
    pub const ALL: [ChartKind; 4] = [
        ChartKind::AdPerformance,
        ChartKind::Source,
        ChartKind::AgeBracket,
        ChartKind::EmploymentStatus,
    ];

    pub fn slug(self) -> &'static str {
        match self {
            ChartKind::AdPerformance => "ads",
            ChartKind::Source => "source",
            ChartKind::AgeBracket => "age",
            ChartKind::EmploymentStatus => "employment",
        }
    }

    pub fn title(self) -> &'static str {
        match self {
            ChartKind::AdPerformance => "Anúncios que mais converteram",
            ChartKind::Source => "Distribuição por Origem",
            ChartKind::AgeBracket => "Distribuição por Idade",
            ChartKind::EmploymentStatus => "Status de Emprego",
        }
    }

    /// Bucket label used when the selector field is missing or empty.
    pub fn fallback_label(self) -> &'static str {
        match self {
            ChartKind::AdPerformance => "Sem anúncio",
            ChartKind::Source => "Sem origem",
            ChartKind::AgeBracket | ChartKind::EmploymentStatus => "Não informado",
        }
    }

    pub fn select(self, record: &CanonicalRecord) -> Option<&str> {
        match self {
            ChartKind::AdPerformance => record.utm_content.as_deref(),
            ChartKind::Source => record.utm_source.as_deref(),
            ChartKind::AgeBracket => Some(record.age_bracket.as_str()),
            ChartKind::EmploymentStatus => Some(record.employment_status.as_str()),
        }
    }
}

impl fmt::Display for ChartKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownChartKind(pub String);

impl fmt::Display for UnknownChartKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown chart kind `{}`", self.0)
    }
}

impl std::error::Error for UnknownChartKind {}

impl FromStr for ChartKind {
    type Err = UnknownChartKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ChartKind::ALL
            .into_iter()
            .find(|kind| kind.slug() == s)
            .ok_or_else(|| UnknownChartKind(s.to_string()))
    }
}

/// One bar/slice of a chart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChartBucket {
    pub label: String,
    pub count: usize,
    pub original_label: String,
}

/// Aggregated, ordered buckets for one chart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivedView {
    pub kind: ChartKind,
    pub buckets: Vec<ChartBucket>,
}

impl DerivedView {
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

/// Everything the dashboard needs for one (snapshot, filter) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DashboardSummary {
    pub generation: u64,
    pub total_records: usize,
    pub filtered_records: usize,
    pub campaigns: Vec<String>,
    pub views: Vec<DerivedView>,
}

impl DashboardSummary {
    pub fn view(&self, kind: ChartKind) -> Option<&DerivedView> {
        self.views.iter().find(|v| v.kind == kind)
    }
}
