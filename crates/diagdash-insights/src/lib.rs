//! Pure filtering and aggregation over a canonical snapshot.
//!
//! Nothing here performs I/O or keeps state: every function is a deterministic
//! function of its arguments, so callers can memoize on `(generation, FilterSpec)`.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveTime, Utc};
use diagdash_core::{
    CanonicalRecord, ChartBucket, ChartKind, DashboardSummary, DerivedView, FilterSpec, Snapshot,
};

pub const CRATE_NAME: &str = "diagdash-insights";

/// Buckets kept by the ranked ad-performance view.
pub const TOP_N: usize = 10;
/// Display labels longer than this many characters are cut.
pub const MAX_LABEL_CHARS: usize = 20;
pub const ELLIPSIS: &str = "...";

/// First instant of `date` in the given offset.
pub fn day_start(date: NaiveDate, offset: FixedOffset) -> Option<DateTime<Utc>> {
    date.and_time(NaiveTime::MIN)
        .and_local_timezone(offset)
        .single()
        .map(|ts| ts.with_timezone(&Utc))
}

/// Half-open instant range `[from, until)` selected by a filter's dates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DateWindow {
    from: Option<DateTime<Utc>>,
    until: Option<DateTime<Utc>>,
}

impl DateWindow {
    fn from_spec(spec: &FilterSpec) -> Self {
        let from = spec
            .start_date
            .and_then(|date| day_start(date, spec.utc_offset));
        // End of day is inclusive: everything before the next day's first instant.
        let until = spec
            .end_date
            .and_then(|date| date.succ_opt())
            .and_then(|next| day_start(next, spec.utc_offset));
        Self { from, until }
    }

    fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.from.map_or(true, |from| ts >= from) && self.until.map_or(true, |until| ts < until)
    }
}

/// Records passing both the date and the campaign constraint, in snapshot order.
///
/// An inverted date range (start after end) matches nothing.
pub fn apply_filter(records: &[CanonicalRecord], spec: &FilterSpec) -> Vec<CanonicalRecord> {
    let window = DateWindow::from_spec(spec);
    let campaign = spec.campaign_constraint();
    records
        .iter()
        .filter(|r| window.contains(r.created_at))
        .filter(|r| campaign.map_or(true, |c| r.utm_campaign.as_deref() == Some(c)))
        .cloned()
        .collect()
}

/// Cut `label` to `max_chars` characters plus [`ELLIPSIS`] when it is longer.
pub fn truncate_label(label: &str, max_chars: usize) -> String {
    match label.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}{ELLIPSIS}", &label[..cut]),
        None => label.to_string(),
    }
}

/// `(label, count)` per distinct selector value, in order of first occurrence.
fn group(records: &[CanonicalRecord], kind: ChartKind) -> Vec<(String, usize)> {
    let mut index: HashMap<&str, usize> = HashMap::new();
    let mut groups: Vec<(String, usize)> = Vec::new();
    for record in records {
        let label = match kind.select(record) {
            Some(value) if !value.is_empty() => value,
            _ => kind.fallback_label(),
        };
        match index.get(label) {
            Some(&slot) => groups[slot].1 += 1,
            None => {
                index.insert(label, groups.len());
                groups.push((label.to_string(), 1));
            }
        }
    }
    groups
}

/// Bucket counts in first-occurrence order (bar/pie axis order).
pub fn category_counts(records: &[CanonicalRecord], kind: ChartKind) -> DerivedView {
    let buckets = group(records, kind)
        .into_iter()
        .map(|(label, count)| ChartBucket {
            original_label: label.clone(),
            label,
            count,
        })
        .collect();
    DerivedView { kind, buckets }
}

/// The `n` largest buckets, count descending, ties kept in first-occurrence order.
pub fn ranked_top(
    records: &[CanonicalRecord],
    kind: ChartKind,
    n: usize,
    max_label_chars: usize,
) -> DerivedView {
    let mut groups = group(records, kind);
    groups.sort_by(|a, b| b.1.cmp(&a.1));
    let buckets = groups
        .into_iter()
        .take(n)
        .map(|(original_label, count)| ChartBucket {
            label: truncate_label(&original_label, max_label_chars),
            count,
            original_label,
        })
        .collect();
    DerivedView { kind, buckets }
}

pub fn derive_view(records: &[CanonicalRecord], kind: ChartKind) -> DerivedView {
    match kind {
        ChartKind::AdPerformance => ranked_top(records, kind, TOP_N, MAX_LABEL_CHARS),
        ChartKind::Source | ChartKind::AgeBracket | ChartKind::EmploymentStatus => {
            category_counts(records, kind)
        }
    }
}

/// Distinct non-empty campaigns of the whole (unfiltered) snapshot, in first-occurrence
/// order.
pub fn distinct_campaigns(snapshot: &Snapshot) -> Vec<String> {
    let mut seen = HashSet::new();
    snapshot
        .records()
        .iter()
        .filter_map(|r| r.utm_campaign.as_deref())
        .filter(|c| !c.is_empty() && seen.insert(*c))
        .map(ToString::to_string)
        .collect()
}

pub fn summarize(snapshot: &Snapshot, spec: &FilterSpec) -> DashboardSummary {
    let filtered = apply_filter(snapshot.records(), spec);
    DashboardSummary {
        generation: snapshot.generation(),
        total_records: snapshot.len(),
        filtered_records: filtered.len(),
        campaigns: distinct_campaigns(snapshot),
        views: ChartKind::ALL
            .into_iter()
            .map(|kind| derive_view(&filtered, kind))
            .collect(),
    }
}
