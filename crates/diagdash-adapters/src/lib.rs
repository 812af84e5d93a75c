//! Store-label to canonical-field mapping and fixture loading.
//!
//! The remote table names its survey columns after the full question text shown to
//! respondents. Everything downstream of this crate works with [`CanonicalRecord`]
//! only; raw labels are looked up here and nowhere else.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use diagdash_core::{CanonicalRecord, RawRecord};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "diagdash-adapters";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CanonicalField {
    Id,
    CreatedAt,
    Name,
    Phone,
    Email,
    UtmCampaign,
    UtmSource,
    UtmMedium,
    UtmContent,
    RespondentProfile,
    AgeBracket,
    Familiarity,
    EmploymentStatus,
    SalaryBracket,
    FirstTimeAttendee,
    LearningGap,
}

impl CanonicalField {
    /// Canonical fields in export/column order.
    pub const ALL: [CanonicalField; 16] = [
        CanonicalField::Id,
        CanonicalField::CreatedAt,
        CanonicalField::Name,
        CanonicalField::Phone,
        CanonicalField::Email,
        CanonicalField::UtmCampaign,
        CanonicalField::UtmSource,
        CanonicalField::UtmMedium,
        CanonicalField::UtmContent,
        CanonicalField::RespondentProfile,
        CanonicalField::AgeBracket,
        CanonicalField::Familiarity,
        CanonicalField::EmploymentStatus,
        CanonicalField::SalaryBracket,
        CanonicalField::FirstTimeAttendee,
        CanonicalField::LearningGap,
    ];

    pub fn column_name(self) -> &'static str {
        match self {
            CanonicalField::Id => "id",
            CanonicalField::CreatedAt => "created_at",
            CanonicalField::Name => "name",
            CanonicalField::Phone => "phone",
            CanonicalField::Email => "email",
            CanonicalField::UtmCampaign => "utm_campaign",
            CanonicalField::UtmSource => "utm_source",
            CanonicalField::UtmMedium => "utm_medium",
            CanonicalField::UtmContent => "utm_content",
            CanonicalField::RespondentProfile => "respondent_profile",
            CanonicalField::AgeBracket => "age_bracket",
            CanonicalField::Familiarity => "familiarity",
            CanonicalField::EmploymentStatus => "employment_status",
            CanonicalField::SalaryBracket => "salary_bracket",
            CanonicalField::FirstTimeAttendee => "first_time_attendee",
            CanonicalField::LearningGap => "learning_gap",
        }
    }

    /// Text of this field on a mapped record; `None` for an unset optional field.
    pub fn text(self, record: &CanonicalRecord) -> Option<String> {
        match self {
            CanonicalField::Id => Some(record.id.clone()),
            CanonicalField::CreatedAt => Some(record.created_at.to_rfc3339()),
            CanonicalField::Name => record.name.clone(),
            CanonicalField::Phone => record.phone.clone(),
            CanonicalField::Email => record.email.clone(),
            CanonicalField::UtmCampaign => record.utm_campaign.clone(),
            CanonicalField::UtmSource => record.utm_source.clone(),
            CanonicalField::UtmMedium => record.utm_medium.clone(),
            CanonicalField::UtmContent => record.utm_content.clone(),
            CanonicalField::RespondentProfile => Some(record.respondent_profile.clone()),
            CanonicalField::AgeBracket => Some(record.age_bracket.clone()),
            CanonicalField::Familiarity => Some(record.familiarity.clone()),
            CanonicalField::EmploymentStatus => Some(record.employment_status.clone()),
            CanonicalField::SalaryBracket => Some(record.salary_bracket.clone()),
            CanonicalField::FirstTimeAttendee => Some(record.first_time_attendee.clone()),
            CanonicalField::LearningGap => Some(record.learning_gap.clone()),
        }
    }
}

/// Store label for every canonical field. Labels not listed here are ignored.
///
/// The two last question labels are cut off by the store's column-name limit; they
/// must stay byte-identical to the remote column names.
pub const FIELD_MAP: &[(&str, CanonicalField)] = &[
    ("id", CanonicalField::Id),
    ("created_at", CanonicalField::CreatedAt),
    ("name", CanonicalField::Name),
    ("phone", CanonicalField::Phone),
    ("email", CanonicalField::Email),
    ("utm_campaign", CanonicalField::UtmCampaign),
    ("utm_source", CanonicalField::UtmSource),
    ("utm_medium", CanonicalField::UtmMedium),
    ("utm_content", CanonicalField::UtmContent),
    ("Você é", CanonicalField::RespondentProfile),
    ("Qual a sua idade", CanonicalField::AgeBracket),
    (
        "Há quanto tempo você conhece o Prof. Fernando Ferreira",
        CanonicalField::Familiarity,
    ),
    ("Você está empregado", CanonicalField::EmploymentStatus),
    ("Qual o valor do seu salário atual", CanonicalField::SalaryBracket),
    (
        "É a primeira vez que você participa da JORNADA DA PROGRAMAÇ",
        CanonicalField::FirstTimeAttendee,
    ),
    (
        "O que realmente FALTA você APRENDER para considerar que isso s",
        CanonicalField::LearningGap,
    ),
];

pub fn store_label(field: CanonicalField) -> &'static str {
    FIELD_MAP
        .iter()
        .find(|(_, f)| *f == field)
        .map(|(label, _)| *label)
        .unwrap_or_else(|| field.column_name())
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MappingError {
    #[error("row has no id")]
    MissingId,
    #[error("row {id} has no created_at")]
    MissingCreatedAt { id: String },
    #[error("row {id} has unparseable created_at `{value}`")]
    InvalidCreatedAt { id: String, value: String },
}

/// Map one raw store row into the canonical shape.
///
/// Absent or null optional fields become `None`, absent or null survey answers
/// become `""`. Only a missing id or an unreadable `created_at` is an error: both are
/// guaranteed by the store schema, so either one means the store broke its contract.
pub fn map_record(raw: &RawRecord) -> Result<CanonicalRecord, MappingError> {
    let id = text_of(raw, CanonicalField::Id)
        .filter(|id| !id.trim().is_empty())
        .ok_or(MappingError::MissingId)?;
    let created_raw = text_of(raw, CanonicalField::CreatedAt)
        .ok_or_else(|| MappingError::MissingCreatedAt { id: id.clone() })?;
    let created_at =
        parse_timestamp(&created_raw).ok_or_else(|| MappingError::InvalidCreatedAt {
            id: id.clone(),
            value: created_raw.clone(),
        })?;

    let required = |field| text_of(raw, field).unwrap_or_default();

    Ok(CanonicalRecord {
        id,
        created_at,
        name: text_of(raw, CanonicalField::Name),
        phone: text_of(raw, CanonicalField::Phone),
        email: text_of(raw, CanonicalField::Email),
        utm_campaign: text_of(raw, CanonicalField::UtmCampaign),
        utm_source: text_of(raw, CanonicalField::UtmSource),
        utm_medium: text_of(raw, CanonicalField::UtmMedium),
        utm_content: text_of(raw, CanonicalField::UtmContent),
        respondent_profile: required(CanonicalField::RespondentProfile),
        age_bracket: required(CanonicalField::AgeBracket),
        familiarity: required(CanonicalField::Familiarity),
        employment_status: required(CanonicalField::EmploymentStatus),
        salary_bracket: required(CanonicalField::SalaryBracket),
        first_time_attendee: required(CanonicalField::FirstTimeAttendee),
        learning_gap: required(CanonicalField::LearningGap),
    })
}

fn text_of(raw: &RawRecord, field: CanonicalField) -> Option<String> {
    raw.get(store_label(field)).and_then(scalar_text)
}

fn scalar_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::Null => None,
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Bool(b) => Some(b.to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        other => Some(other.to_string()),
    }
}

/// Parse store timestamps: RFC 3339, the space-separated Postgres rendering, or a
/// naive timestamp taken as UTC.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Some(ts.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f%#z", "%Y-%m-%dT%H:%M:%S%.f%#z"] {
        if let Ok(ts) = DateTime::parse_from_str(value, fmt) {
            return Some(ts.with_timezone(&Utc));
        }
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(ts) = NaiveDateTime::parse_from_str(value, fmt) {
            return Some(ts.and_utc());
        }
    }
    None
}

/// Fixture file: either a bare JSON array of rows or a bundle with capture metadata.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum FixtureFile {
    Bundle(FixtureBundle),
    Rows(Vec<RawRecord>),
}

/// Capture metadata alongside `rows` is ignored.
#[derive(Debug, Clone, Deserialize)]
struct FixtureBundle {
    rows: Vec<RawRecord>,
}

pub fn load_fixture_rows(path: impl AsRef<Path>) -> Result<Vec<RawRecord>> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let file: FixtureFile =
        serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))?;
    Ok(match file {
        FixtureFile::Bundle(bundle) => bundle.rows,
        FixtureFile::Rows(rows) => rows,
    })
}
