//! Core domain model for the federation registry sync.

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "fedbase-core";

/// First season with data on the federation site.
pub const FIRST_SEASON: i32 = 2004;

/// Sentinel strings the source uses where an athlete has no real license.
const LICENSE_SENTINELS: [&str; 2] = ["-", "None"];

/// Season label for an instant: seasons roll over September 1st and are
/// labeled by the calendar year they end in.
pub fn season_for(instant: DateTime<Utc>) -> i32 {
    if instant.month() >= 9 {
        instant.year() + 1
    } else {
        instant.year()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SeasonRangeError {
    #[error("first season {0} predates the earliest available season {FIRST_SEASON}")]
    BeforeFirstSeason(i32),
    #[error("first season {first} is after last season {last}")]
    Inverted { first: i32, last: i32 },
    #[error("last season {0} is in the future (current season is {1})")]
    InFuture(i32, i32),
}

/// Inclusive range of seasons to crawl, validated at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeasonRange {
    pub first: i32,
    pub last: i32,
}

impl SeasonRange {
    /// Build a range from CLI-style inputs. A missing last season defaults
    /// to the season containing `now`.
    pub fn new(
        first: i32,
        last: Option<i32>,
        now: DateTime<Utc>,
    ) -> Result<Self, SeasonRangeError> {
        let current = season_for(now);
        let last = last.unwrap_or(current);
        if first < FIRST_SEASON {
            return Err(SeasonRangeError::BeforeFirstSeason(first));
        }
        if first > last {
            return Err(SeasonRangeError::Inverted { first, last });
        }
        if last > current {
            return Err(SeasonRangeError::InFuture(last, current));
        }
        Ok(Self { first, last })
    }

    pub fn iter(&self) -> impl Iterator<Item = i32> {
        self.first..=self.last
    }
}

/// Which era of the source site issued a raw external id. Raw ids are only
/// unique within a generation, so a bare string must never be compared
/// across eras.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Generation {
    /// The old asp.net listing site.
    Legacy,
    /// The rebuilt site and its new id scheme.
    Modern,
}

impl Generation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Generation::Legacy => "legacy",
            Generation::Modern => "modern",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "legacy" => Some(Generation::Legacy),
            "modern" => Some(Generation::Modern),
            _ => None,
        }
    }
}

impl std::fmt::Display for Generation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Site-issued identifier tagged with the generation that produced it.
/// Equality requires both the raw id and the generation to agree.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExternalId {
    pub raw: String,
    pub generation: Generation,
}

impl ExternalId {
    pub fn legacy(raw: impl Into<String>) -> Self {
        Self {
            raw: raw.into(),
            generation: Generation::Legacy,
        }
    }

    pub fn modern(raw: impl Into<String>) -> Self {
        Self {
            raw: raw.into(),
            generation: Generation::Modern,
        }
    }
}

impl std::fmt::Display for ExternalId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.generation, self.raw)
    }
}

/// Canonical matching form of a display name: diacritics folded, lower-cased,
/// inner whitespace collapsed, trimmed. Idempotent.
pub fn normalize_name(name: &str) -> String {
    name.chars()
        .map(fold_diacritic)
        .collect::<String>()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Fold the accented Latin characters the source actually emits. The wider
/// Unicode tables are not needed for federation name data.
fn fold_diacritic(c: char) -> char {
    match c {
        'à' | 'á' | 'â' | 'ã' | 'ä' | 'å' => 'a',
        'À' | 'Á' | 'Â' | 'Ã' | 'Ä' | 'Å' => 'A',
        'ç' => 'c',
        'Ç' => 'C',
        'è' | 'é' | 'ê' | 'ë' => 'e',
        'È' | 'É' | 'Ê' | 'Ë' => 'E',
        'ì' | 'í' | 'î' | 'ï' => 'i',
        'Ì' | 'Í' | 'Î' | 'Ï' => 'I',
        'ñ' => 'n',
        'Ñ' => 'N',
        'ò' | 'ó' | 'ô' | 'õ' | 'ö' => 'o',
        'Ò' | 'Ó' | 'Ô' | 'Õ' | 'Ö' => 'O',
        'ù' | 'ú' | 'û' | 'ü' => 'u',
        'Ù' | 'Ú' | 'Û' | 'Ü' => 'U',
        'ý' | 'ÿ' => 'y',
        'Ý' => 'Y',
        other => other,
    }
}

/// A license id usable as a business key, or None for blank/sentinel values.
pub fn valid_license(license: Option<&str>) -> Option<&str> {
    let license = license?.trim();
    if license.is_empty() || LICENSE_SENTINELS.contains(&license) {
        return None;
    }
    Some(license)
}

/// Profile URL for an athlete id. The legacy site obfuscates the id in the
/// query string; the modern site uses a plain path segment.
pub fn profile_url(id: &ExternalId) -> String {
    match id.generation {
        Generation::Legacy => format!(
            "https://bases.athle.fr/asp.net/athletes.aspx?base=records&seq={}",
            encode_profile_seq(&id.raw)
        ),
        Generation::Modern => format!("https://www.athle.fr/athletes/{}", id.raw),
    }
}

/// Per-character encoding the legacy site expects in profile URLs: each
/// character c becomes the pair (99 - ord(c), ord(c)).
fn encode_profile_seq(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            let code = c as i64;
            format!("{}{}", 99 - code, code)
        })
        .collect()
}

/// A club row extracted from one listing page, before reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClubCandidate {
    pub external_id: ExternalId,
    pub name: String,
    /// Season of the listing page the row came from.
    pub season: i32,
}

/// An athlete row extracted from one listing page, before reconciliation.
/// Optional fields are absent observations, not empty values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AthleteCandidate {
    pub external_id: ExternalId,
    pub name: String,
    pub license_id: Option<String>,
    pub birth_date: Option<String>,
    pub sex: Option<String>,
    pub nationality: Option<String>,
}

impl AthleteCandidate {
    /// License id usable as a business key, if any.
    pub fn business_license(&self) -> Option<&str> {
        valid_license(self.license_id.as_deref())
    }
}

/// Canonical persisted club. `id` and `created_at` are assigned by the store
/// on first insert and never change; `normalized_name` and `updated_at` are
/// recomputed by the store on every write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Club {
    pub id: i64,
    pub external_id: ExternalId,
    pub name: String,
    pub normalized_name: String,
    pub first_season: i32,
    pub last_season: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Club {
    /// Whether the club was active in (or adjacent to) a season. Used as
    /// fuzzy-match corroboration, so one season of slack is allowed.
    pub fn active_near(&self, season: i32) -> bool {
        season >= self.first_season - 1 && season <= self.last_season + 1
    }
}

/// Canonical persisted athlete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Athlete {
    pub id: i64,
    pub external_id: ExternalId,
    pub license_id: Option<String>,
    pub name: String,
    pub normalized_name: String,
    pub url: Option<String>,
    pub birth_date: Option<String>,
    pub sex: Option<String>,
    pub nationality: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Athlete {
    pub fn business_license(&self) -> Option<&str> {
        valid_license(self.license_id.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(year: i32, month: u32, day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(year, month, day, 12, 0, 0).single().unwrap()
    }

    #[test]
    fn season_rolls_over_september_first() {
        assert_eq!(season_for(at(2025, 8, 31)), 2025);
        assert_eq!(season_for(at(2025, 9, 1)), 2026);
        assert_eq!(season_for(at(2026, 1, 15)), 2026);
    }

    #[test]
    fn season_range_defaults_last_to_current_season() {
        let range = SeasonRange::new(2004, None, at(2025, 10, 1)).unwrap();
        assert_eq!(range, SeasonRange { first: 2004, last: 2026 });
        assert_eq!(range.iter().count(), 23);
    }

    #[test]
    fn season_range_rejects_bad_inputs() {
        let now = at(2025, 6, 1);
        assert_eq!(
            SeasonRange::new(1999, None, now),
            Err(SeasonRangeError::BeforeFirstSeason(1999))
        );
        assert_eq!(
            SeasonRange::new(2020, Some(2010), now),
            Err(SeasonRangeError::Inverted { first: 2020, last: 2010 })
        );
        assert_eq!(
            SeasonRange::new(2020, Some(2030), now),
            Err(SeasonRangeError::InFuture(2030, 2025))
        );
    }

    #[test]
    fn normalize_strips_diacritics_case_and_whitespace() {
        assert_eq!(normalize_name("Éric O'Conner  "), "eric o'conner");
        assert_eq!(normalize_name("eric o'conner"), "eric o'conner");
        assert_eq!(normalize_name("  STADE   FRANÇAIS "), "stade francais");
    }

    #[test]
    fn normalize_is_idempotent() {
        for name in ["Éric O'Conner  ", "ATHLÉ 92*", "Jean-Noël Müller"] {
            let once = normalize_name(name);
            assert_eq!(normalize_name(&once), once);
        }
    }

    #[test]
    fn license_sentinels_are_not_business_keys() {
        assert_eq!(valid_license(Some("123456")), Some("123456"));
        assert_eq!(valid_license(Some(" 123456 ")), Some("123456"));
        assert_eq!(valid_license(Some("")), None);
        assert_eq!(valid_license(Some("   ")), None);
        assert_eq!(valid_license(Some("-")), None);
        assert_eq!(valid_license(Some("None")), None);
        assert_eq!(valid_license(None), None);
    }

    #[test]
    fn external_ids_differ_across_generations() {
        let a = ExternalId::legacy("1234");
        let b = ExternalId::modern("1234");
        assert_ne!(a, b);
        assert_eq!(a, ExternalId::legacy("1234"));
        assert_eq!(a.to_string(), "legacy:1234");
    }

    #[test]
    fn legacy_profile_seq_encoding() {
        assert_eq!(encode_profile_seq("1234"), "5049495048514752");
        assert_eq!(encode_profile_seq("ABCD"), "3465336632673168");
        assert_eq!(encode_profile_seq("7"), "4455");
    }

    #[test]
    fn profile_urls_per_generation() {
        assert_eq!(
            profile_url(&ExternalId::legacy("7")),
            "https://bases.athle.fr/asp.net/athletes.aspx?base=records&seq=4455"
        );
        assert_eq!(
            profile_url(&ExternalId::modern("NEW456")),
            "https://www.athle.fr/athletes/NEW456"
        );
    }
}
