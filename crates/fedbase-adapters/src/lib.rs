//! Listing-page contracts: URL construction, the fetch seam and the
//! extractors that turn raw federation pages into candidate records.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fedbase_core::{AthleteCandidate, ClubCandidate, ExternalId};
use fedbase_storage::{FetchError, HttpFetcher};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "fedbase-adapters";

const CLUB_LISTING_BASE: &str = "https://www.athle.fr/bases/liste.aspx";
const ATHLETE_LISTING_BASE: &str = "https://bases.athle.fr/asp.net/liste.aspx";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PageKind {
    Clubs,
    Athletes,
}

impl PageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PageKind::Clubs => "clubs",
            PageKind::Athletes => "athletes",
        }
    }
}

/// One paginated listing request: a season, a zero-based page index and, for
/// athlete listings, the club whose results are being listed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub kind: PageKind,
    pub season: i32,
    pub page: u32,
    pub club: Option<ExternalId>,
}

impl PageRequest {
    pub fn clubs(season: i32, page: u32) -> Self {
        Self {
            kind: PageKind::Clubs,
            season,
            page,
            club: None,
        }
    }

    pub fn athletes(season: i32, club: ExternalId, page: u32) -> Self {
        Self {
            kind: PageKind::Athletes,
            season,
            page,
            club: Some(club),
        }
    }

    pub fn url(&self) -> String {
        match self.kind {
            PageKind::Clubs => format!(
                "{CLUB_LISTING_BASE}?frmpostback=true&frmbase=cclubs&frmmode=1&frmespace=0\
                 &frmsaison={}&frmsexe=&frmligue=&frmdepartement=&frmnclub=&frmruptures=\
                 &frmposition={}",
                self.season, self.page
            ),
            PageKind::Athletes => format!(
                "{ATHLETE_LISTING_BASE}?frmpostback=true&frmbase=resultats&frmmode=1\
                 &frmespace=0&frmsaison={}&frmclub={}&frmposition={}",
                self.season,
                self.club.as_ref().map(|c| c.raw.as_str()).unwrap_or(""),
                self.page
            ),
        }
    }

    /// Label used for archived copies of pages that failed to parse.
    pub fn archive_label(&self) -> String {
        match &self.club {
            Some(club) => format!(
                "{}-{}-club{}-p{}",
                self.kind.as_str(),
                self.season,
                club.raw,
                self.page
            ),
            None => format!("{}-{}-p{}", self.kind.as_str(), self.season, self.page),
        }
    }
}

/// A fetched listing page with its provenance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawPage {
    pub url: String,
    pub body: String,
    pub fetched_at: DateTime<Utc>,
}

/// Fetch seam the crawler drives; tests substitute scripted pages.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch_page(&self, run_id: Uuid, request: &PageRequest) -> Result<RawPage, FetchError>;
}

/// Live implementation over the retrying HTTP fetcher. Every call hits the
/// site; nothing is cached.
pub struct HttpListingSource {
    fetcher: HttpFetcher,
}

impl HttpListingSource {
    pub fn new(fetcher: HttpFetcher) -> Self {
        Self { fetcher }
    }
}

#[async_trait]
impl PageSource for HttpListingSource {
    async fn fetch_page(&self, run_id: Uuid, request: &PageRequest) -> Result<RawPage, FetchError> {
        let response = self.fetcher.fetch_text(run_id, &request.url()).await?;
        Ok(RawPage {
            url: response.final_url,
            body: response.body,
            fetched_at: Utc::now(),
        })
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExtractError {
    /// The listing container itself is unrecognizable. Distinct from an
    /// empty-but-well-formed page, which ends pagination.
    #[error("unrecognizable {kind} listing markup at {url}")]
    UnrecognizedListing { kind: &'static str, url: String },
    #[error("invalid selector: {0}")]
    Selector(String),
}

fn sel(selector: &str) -> Result<Selector, ExtractError> {
    Selector::parse(selector).map_err(|e| ExtractError::Selector(e.to_string()))
}

fn squeeze(text: String) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn cell_text(cell: ElementRef<'_>) -> Option<String> {
    let text = squeeze(cell.text().collect::<String>());
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

/// Direct child cells only; detail sub-rows nest their own tables.
fn row_cells<'a>(
    row: ElementRef<'a>,
    cell_selector: &Selector,
) -> Vec<ElementRef<'a>> {
    row.select(cell_selector)
        .filter(|cell| cell.parent().map(|p| p.id()) == Some(row.id()))
        .collect()
}

fn strip_decoration(name: &str) -> String {
    squeeze(name.trim_end_matches('*').to_string())
}

/// Extract club candidates from a listing page. Modern pages carry the
/// rebuilt table markup; legacy pages link each club through a `frmnclub=`
/// query parameter. Candidates are tagged with the generation of whichever
/// markup matched.
pub fn extract_clubs(page: &RawPage, season: i32) -> Result<Vec<ClubCandidate>, ExtractError> {
    let document = Html::parse_document(&page.body);

    let tbody_sel = sel("tbody.text-blue-primary")?;
    if let Some(tbody) = document.select(&tbody_sel).next() {
        let row_sel = sel("tr")?;
        let cell_sel = sel("td")?;
        let anchor_sel = sel("a")?;

        let mut clubs = Vec::new();
        for row in tbody.select(&row_sel) {
            let cells = row_cells(row, &cell_sel);
            if cells.len() != 7 {
                continue;
            }
            let Some(anchor) = cells[2].select(&anchor_sel).next() else {
                continue;
            };
            let name = strip_decoration(&anchor.text().collect::<String>());
            let Some(raw_id) = cell_text(cells[3]) else {
                continue;
            };
            if name.is_empty() {
                continue;
            }
            clubs.push(ClubCandidate {
                external_id: ExternalId::modern(raw_id),
                name,
                season,
            });
        }
        return Ok(clubs);
    }

    let legacy_sel = sel("a[href*='frmnclub=']")?;
    let mut clubs = Vec::new();
    for anchor in document.select(&legacy_sel) {
        let Some(href) = anchor.value().attr("href") else {
            continue;
        };
        let Some(raw_id) = query_param(href, "frmnclub") else {
            continue;
        };
        let name = strip_decoration(&anchor.text().collect::<String>());
        if raw_id.is_empty() || name.is_empty() {
            continue;
        }
        clubs.push(ClubCandidate {
            external_id: ExternalId::legacy(raw_id),
            name,
            season,
        });
    }
    if !clubs.is_empty() {
        return Ok(clubs);
    }

    if document.select(&sel("select.barSelect")?).next().is_some() {
        return Ok(Vec::new());
    }

    Err(ExtractError::UnrecognizedListing {
        kind: PageKind::Clubs.as_str(),
        url: page.url.clone(),
    })
}

/// Extract athlete candidates from a results listing page. A results page
/// lists one row per performance, so the same athlete is deduplicated within
/// the page. Optional cells (license, birth date, sex, nationality) map to
/// None when the row does not carry them.
pub fn extract_athletes(page: &RawPage) -> Result<Vec<AthleteCandidate>, ExtractError> {
    let document = Html::parse_document(&page.body);
    let cell_sel = sel("td")?;

    let tbody_sel = sel("tbody.text-blue-primary")?;
    if let Some(tbody) = document.select(&tbody_sel).next() {
        let row_sel = sel("tr")?;
        let modern_anchor_sel = sel("a[href*='/athletes/']")?;

        let mut athletes = Vec::new();
        for row in tbody.select(&row_sel) {
            let Some(anchor) = row.select(&modern_anchor_sel).next() else {
                continue;
            };
            let Some(raw_id) = anchor
                .value()
                .attr("href")
                .and_then(modern_athlete_id)
            else {
                continue;
            };
            push_candidate(
                &mut athletes,
                ExternalId::modern(raw_id),
                anchor,
                row,
                &cell_sel,
            );
        }
        return Ok(athletes);
    }

    let legacy_anchor_sel = sel("a[href*='bddThrowAthlete']")?;
    let mut athletes = Vec::new();
    for anchor in document.select(&legacy_anchor_sel) {
        let Some(raw_id) = anchor.value().attr("href").and_then(legacy_athlete_id) else {
            continue;
        };
        let Some(row) = enclosing_row(anchor) else {
            continue;
        };
        push_candidate(
            &mut athletes,
            ExternalId::legacy(raw_id),
            anchor,
            row,
            &cell_sel,
        );
    }
    if !athletes.is_empty() {
        return Ok(athletes);
    }

    if document.select(&sel("select.barSelect")?).next().is_some() {
        return Ok(Vec::new());
    }

    Err(ExtractError::UnrecognizedListing {
        kind: PageKind::Athletes.as_str(),
        url: page.url.clone(),
    })
}

/// Raw id from the legacy throw-script href: the second quoted argument of
/// `javascript:bddThrowAthlete('base', 'ID', ...)`.
fn legacy_athlete_id(href: &str) -> Option<String> {
    let segment = href.split(',').nth(1)?;
    let raw = segment.trim().trim_matches('\'').trim();
    if raw.is_empty() {
        None
    } else {
        Some(raw.to_string())
    }
}

/// Raw id from a modern profile href: the path segment after `/athletes/`.
fn modern_athlete_id(href: &str) -> Option<String> {
    let rest = href.split("/athletes/").nth(1)?;
    let raw = rest.split(['?', '#', '/']).next()?.trim();
    if raw.is_empty() {
        None
    } else {
        Some(raw.to_string())
    }
}

fn enclosing_row(anchor: ElementRef<'_>) -> Option<ElementRef<'_>> {
    anchor
        .ancestors()
        .filter_map(ElementRef::wrap)
        .find(|el| el.value().name() == "tr")
}

/// Optional cells follow the name cell positionally: license, birth date,
/// sex, nationality. Trailing cells may be absent.
fn push_candidate(
    athletes: &mut Vec<AthleteCandidate>,
    external_id: ExternalId,
    anchor: ElementRef<'_>,
    row: ElementRef<'_>,
    cell_sel: &Selector,
) {
    if athletes.iter().any(|a| a.external_id == external_id) {
        return;
    }
    let name = squeeze(anchor.text().collect::<String>());
    if name.is_empty() {
        return;
    }

    let cells = row_cells(row, cell_sel);
    let anchor_id = anchor.id();
    let name_index = cells
        .iter()
        .position(|cell| cell.descendants().any(|node| node.id() == anchor_id))
        .unwrap_or(cells.len());
    let optional = |offset: usize| cells.get(name_index + offset).copied().and_then(cell_text);

    athletes.push(AthleteCandidate {
        external_id,
        name,
        license_id: optional(1),
        birth_date: optional(2),
        sex: optional(3),
        nationality: optional(4),
    });
}

fn query_param(href: &str, key: &str) -> Option<String> {
    let needle = format!("{key}=");
    let start = href.find(&needle)? + needle.len();
    let rest = &href[start..];
    let end = rest.find('&').unwrap_or(rest.len());
    Some(rest[..end].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use fedbase_core::Generation;

    fn page(body: &str) -> RawPage {
        RawPage {
            url: "https://example.test/listing".to_string(),
            body: body.to_string(),
            fetched_at: Utc.with_ymd_and_hms(2026, 1, 10, 9, 0, 0).single().unwrap(),
        }
    }

    #[test]
    fn club_listing_url_matches_site_contract() {
        let request = PageRequest::athletes(2024, ExternalId::legacy("CLUB42"), 0);
        assert_eq!(
            request.url(),
            "https://bases.athle.fr/asp.net/liste.aspx?frmpostback=true&frmbase=resultats\
             &frmmode=1&frmespace=0&frmsaison=2024&frmclub=CLUB42&frmposition=0"
        );
        let request = PageRequest::athletes(2023, ExternalId::legacy("CLUB42"), 5);
        assert!(request.url().ends_with("&frmposition=5"));

        let clubs = PageRequest::clubs(2022, 3);
        assert!(clubs.url().contains("frmbase=cclubs"));
        assert!(clubs.url().contains("frmsaison=2022"));
        assert!(clubs.url().ends_with("&frmposition=3"));
    }

    const MODERN_CLUBS: &str = r#"
        <table><tbody class="text-blue-primary">
          <tr>
            <td>1</td><td>R-IDF</td>
            <td><a href="/clubs/092001">Athlé  92 **</a></td>
            <td>092001</td><td>75</td><td>120</td><td>yes</td>
          </tr>
          <tr>
            <td>2</td><td>R-OCC</td>
            <td><a href="/clubs/031004">Stade Toulousain</a></td>
            <td>031004</td><td>31</td><td>98</td><td>yes</td>
          </tr>
          <tr class="detail-row"><td colspan="7">expanded details</td></tr>
        </tbody></table>
    "#;

    #[test]
    fn modern_club_rows_are_extracted_and_tagged() {
        let clubs = extract_clubs(&page(MODERN_CLUBS), 2024).unwrap();
        assert_eq!(clubs.len(), 2);
        assert_eq!(clubs[0].name, "Athlé 92");
        assert_eq!(clubs[0].external_id, ExternalId::modern("092001"));
        assert_eq!(clubs[0].season, 2024);
        assert_eq!(clubs[1].external_id.generation, Generation::Modern);
    }

    #[test]
    fn empty_modern_container_signals_end_of_pagination() {
        let body = r#"<table><tbody class="text-blue-primary"></tbody></table>"#;
        let clubs = extract_clubs(&page(body), 2024).unwrap();
        assert!(clubs.is_empty());
    }

    #[test]
    fn legacy_club_anchors_are_extracted_and_tagged() {
        let body = r#"
            <select class="barSelect"><option>1</option></select>
            <a href="liste.aspx?frmbase=cclubs&frmnclub=1234&frmposition=0">Club Name</a>
            <a href="liste.aspx?frmbase=cclubs&frmnclub=5678">Second   Club *</a>
        "#;
        let clubs = extract_clubs(&page(body), 2010).unwrap();
        assert_eq!(clubs.len(), 2);
        assert_eq!(clubs[0].external_id, ExternalId::legacy("1234"));
        assert_eq!(clubs[0].name, "Club Name");
        assert_eq!(clubs[1].external_id, ExternalId::legacy("5678"));
        assert_eq!(clubs[1].name, "Second Club");
    }

    #[test]
    fn empty_legacy_page_with_pagination_control_is_valid() {
        let body = r#"<select class="barSelect"></select>"#;
        assert_eq!(extract_clubs(&page(body), 2010).unwrap(), Vec::new());
    }

    #[test]
    fn unrecognizable_club_markup_is_a_parse_error() {
        let err = extract_clubs(&page("<html><body>maintenance</body></html>"), 2024)
            .unwrap_err();
        assert!(matches!(
            err,
            ExtractError::UnrecognizedListing { kind: "clubs", .. }
        ));
    }

    const LEGACY_ATHLETES: &str = r#"
        <select class="barSelect"><option>1</option></select>
        <table>
          <tr>
            <td>60m</td>
            <td><a href="javascript:bddThrowAthlete('resultats', '5678', 0)">John Doe</a></td>
            <td>123456</td><td>01/01/1990</td><td>M</td><td>FRA</td>
          </tr>
          <tr>
            <td>100m</td>
            <td><a href="javascript:bddThrowAthlete('resultats', '5678', 0)">John Doe</a></td>
            <td>123456</td><td>01/01/1990</td><td>M</td><td>FRA</td>
          </tr>
          <tr>
            <td>200m</td>
            <td><a href="javascript:bddThrowAthlete('resultats', '91011', 0)">Jane Roe</a></td>
          </tr>
        </table>
    "#;

    #[test]
    fn legacy_athlete_rows_deduplicate_and_tolerate_missing_cells() {
        let athletes = extract_athletes(&page(LEGACY_ATHLETES)).unwrap();
        assert_eq!(athletes.len(), 2);

        let john = &athletes[0];
        assert_eq!(john.external_id, ExternalId::legacy("5678"));
        assert_eq!(john.name, "John Doe");
        assert_eq!(john.license_id.as_deref(), Some("123456"));
        assert_eq!(john.birth_date.as_deref(), Some("01/01/1990"));
        assert_eq!(john.sex.as_deref(), Some("M"));
        assert_eq!(john.nationality.as_deref(), Some("FRA"));

        let jane = &athletes[1];
        assert_eq!(jane.external_id, ExternalId::legacy("91011"));
        assert_eq!(jane.license_id, None);
        assert_eq!(jane.birth_date, None);
        assert_eq!(jane.sex, None);
        assert_eq!(jane.nationality, None);
    }

    #[test]
    fn modern_athlete_rows_are_tagged_modern() {
        let body = r#"
            <table><tbody class="text-blue-primary">
              <tr>
                <td>1</td>
                <td><a href="https://www.athle.fr/athletes/A77?tab=records">Marie Curie</a></td>
                <td>777888</td><td>1995</td><td>F</td><td>FRA</td>
              </tr>
            </tbody></table>
        "#;
        let athletes = extract_athletes(&page(body)).unwrap();
        assert_eq!(athletes.len(), 1);
        assert_eq!(athletes[0].external_id, ExternalId::modern("A77"));
        assert_eq!(athletes[0].license_id.as_deref(), Some("777888"));
        assert_eq!(athletes[0].sex.as_deref(), Some("F"));
    }

    #[test]
    fn unrecognizable_athlete_markup_is_a_parse_error() {
        let err = extract_athletes(&page("<div>nothing here</div>")).unwrap_err();
        assert!(matches!(
            err,
            ExtractError::UnrecognizedListing { kind: "athletes", .. }
        ));
    }
}
