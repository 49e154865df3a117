//! Blocking HTTP client for genie.co.kr.
//!
//! Implements every source trait. Pages are fetched with `reqwest` and
//! parsed with a handful of anchored regexes; the parsers are plain
//! functions over the markup so they can be tested without the network.

use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::blocking::{Client, Response};
use reqwest::header::DATE;
use tracing::debug;

use crate::error::SourceError;
use crate::models::{AlbumInfo, ChartEntry, Credits, SongDetail};
use crate::sources::{
    infer_release_date, AlbumSource, ChartSource, NewestSource, SongDetailSource,
};

pub const BASE_URL: &str = "http://www.genie.co.kr";

const CHART_PATH: &str = "/chart/top200";
const NEWEST_PATH: &str = "/newest/song";
const SONG_PATH: &str = "/detail/songInfo";
const ALBUM_PATH: &str = "/detail/albumInfo";

const USER_AGENT: &str = concat!("kstreams/", env!("CARGO_PKG_VERSION"));
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

// Labels on the detail pages (image alt texts).
const LABEL_RELEASE_DATE: &str = "발매일";
const LABEL_AGENCY: &str = "기획사";
const LABEL_GENRE: &str = "장르/스타일";
const LABEL_PLAYS: &str = "전체 재생수";
const LABEL_LISTENERS: &str = "전체 청취자수";
const LABEL_LYRICS: &str = "작사가";
const LABEL_COMPOSITION: &str = "작곡가";
const LABEL_ARRANGEMENT: &str = "편곡자";

/// Genre tag of local-language releases.
const LOCAL_GENRE: &str = "가요";

// ============================================================================
// Patterns
// ============================================================================

static SONG_ROW: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?s)<tr[^>]*\bsongid="([^"]+)"[^>]*>(.*?)</tr>"#).unwrap());

static ROW_TITLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?s)class="title[^"]*"[^>]*>(.*?)</a>"#).unwrap());

static ROW_ARTIST: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?s)class="artist[^"]*"[^>]*>(.*?)</a>"#).unwrap());

static ALBUM_LAYER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"fnViewAlbumLayer\('([^']+)'\)").unwrap());

static SONG_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?s)class="name"[^>]*>(.*?)</h2>"#).unwrap());

static ARTIST_LINK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?s)onclick="[^"]*artistInfo[^"]*"[^>]*>(.*?)</a>"#).unwrap());

static ALBUM_LINK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"onclick="[^"]*albumInfo[^"]*?'([0-9]+)'"#).unwrap());

static SPAN: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<span[^>]*>.*?</span>").unwrap());

static TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]*>").unwrap());

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

/// `<span><img alt="LABEL"></span><span class="value">VALUE</span>`
fn labeled_value_pattern(label: &str) -> Regex {
    Regex::new(&format!(
        r#"(?s)alt="{}"[^>]*>.*?class="value"[^>]*>(.*?)</span>"#,
        regex::escape(label)
    ))
    .unwrap()
}

/// `<p>1,234</p><span><img alt="LABEL"></span>`
fn counter_pattern(label: &str) -> Regex {
    Regex::new(&format!(
        r#"(?s)<p[^>]*>\s*([0-9,]+)\s*</p>\s*<[^>]*>\s*<img[^>]*alt="{}""#,
        regex::escape(label)
    ))
    .unwrap()
}

static RELEASE_DATE: Lazy<Regex> = Lazy::new(|| labeled_value_pattern(LABEL_RELEASE_DATE));
static AGENCY: Lazy<Regex> = Lazy::new(|| labeled_value_pattern(LABEL_AGENCY));
static GENRE: Lazy<Regex> = Lazy::new(|| labeled_value_pattern(LABEL_GENRE));
static LYRICS: Lazy<Regex> = Lazy::new(|| labeled_value_pattern(LABEL_LYRICS));
static COMPOSITION: Lazy<Regex> = Lazy::new(|| labeled_value_pattern(LABEL_COMPOSITION));
static ARRANGEMENT: Lazy<Regex> = Lazy::new(|| labeled_value_pattern(LABEL_ARRANGEMENT));
static PLAYS: Lazy<Regex> = Lazy::new(|| counter_pattern(LABEL_PLAYS));
static LISTENERS: Lazy<Regex> = Lazy::new(|| counter_pattern(LABEL_LISTENERS));

// ============================================================================
// Parsers
// ============================================================================

/// Text content of a markup fragment: age-rating badges (`<span>`) dropped,
/// tags removed, entities for `&amp;`-style escapes decoded, whitespace
/// collapsed.
fn text_of(fragment: &str) -> String {
    let without_badges = SPAN.replace_all(fragment, "");
    let text = TAG.replace_all(&without_badges, "");
    let text = text
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&nbsp;", " ");
    WHITESPACE.replace_all(&text, " ").trim().to_string()
}

fn capture<'m>(re: &Regex, markup: &'m str) -> Option<&'m str> {
    re.captures(markup).and_then(|c| c.get(1)).map(|m| m.as_str())
}

/// Song rows of a chart or newest releases page, in page order. Rows missing
/// a field are dropped.
pub fn parse_chart_page(markup: &str) -> Vec<ChartEntry> {
    SONG_ROW
        .captures_iter(markup)
        .filter_map(|row| {
            let id = row.get(1)?.as_str().to_string();
            let body = row.get(2)?.as_str();
            let title = text_of(capture(&ROW_TITLE, body)?);
            let artist = text_of(capture(&ROW_ARTIST, body)?);
            let album_id = capture(&ALBUM_LAYER, body)?.to_string();
            Some(ChartEntry {
                id,
                title,
                artist,
                album_id,
            })
        })
        .collect()
}

/// Title, artist and album of a song detail page.
pub fn parse_song_entry(song_id: &str, markup: &str) -> Result<ChartEntry, SourceError> {
    let title = capture(&SONG_NAME, markup)
        .map(text_of)
        .ok_or_else(|| SourceError::missing("song title", song_id))?;
    let artist = capture(&ARTIST_LINK, markup)
        .map(text_of)
        .ok_or_else(|| SourceError::missing("artist", song_id))?;
    let album_id = capture(&ALBUM_LINK, markup)
        .ok_or_else(|| SourceError::missing("album link", song_id))?
        .to_string();
    Ok(ChartEntry {
        id: song_id.to_string(),
        title,
        artist,
        album_id,
    })
}

fn parse_counter(re: &Regex, what: &'static str, markup: &str) -> Result<i64, SourceError> {
    let raw = capture(re, markup).ok_or_else(|| SourceError::missing(what, "song page"))?;
    raw.replace(',', "").parse().map_err(|_| SourceError::Parse {
        what,
        value: raw.to_string(),
    })
}

fn parse_names(re: &Regex, markup: &str) -> Vec<String> {
    capture(re, markup)
        .map(text_of)
        .map(|names| {
            names
                .split(',')
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

/// Credits of a song detail page. Missing roles are empty.
pub fn parse_credits(markup: &str) -> Credits {
    Credits {
        lyrics: parse_names(&LYRICS, markup),
        composition: parse_names(&COMPOSITION, markup),
        arrangement: parse_names(&ARRANGEMENT, markup),
    }
}

/// Counters and credits of a song detail page observed at `observed_at`.
pub fn parse_song_detail(markup: &str, observed_at: DateTime<Utc>) -> Result<SongDetail, SourceError> {
    Ok(SongDetail {
        observed_at,
        plays: parse_counter(&PLAYS, "total plays", markup)?,
        listeners: parse_counter(&LISTENERS, "total listeners", markup)?,
        credits: parse_credits(markup),
    })
}

fn parse_date(raw: &str) -> Result<NaiveDate, SourceError> {
    ["%Y.%m.%d", "%Y-%m-%d"]
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok())
        .ok_or_else(|| SourceError::Parse {
            what: "release date",
            value: raw.to_string(),
        })
}

/// Album page metadata. The release date is inferred relative to `now`.
pub fn parse_album(album_id: &str, markup: &str, now: DateTime<Utc>) -> Result<AlbumInfo, SourceError> {
    let raw_date = capture(&RELEASE_DATE, markup)
        .map(text_of)
        .ok_or_else(|| SourceError::missing("release date", album_id))?;
    let release_date = infer_release_date(parse_date(&raw_date)?, now).fixed_offset();

    let agency = capture(&AGENCY, markup).map(text_of).unwrap_or_default();
    let is_local_language = capture(&GENRE, markup)
        .map(|genre| text_of(genre).contains(LOCAL_GENRE))
        .unwrap_or(false);
    let title_tracks = SONG_ROW
        .captures_iter(markup)
        .filter(|row| row.get(2).is_some_and(|body| body.as_str().contains("icon-title")))
        .filter_map(|row| row.get(1).map(|id| id.as_str().to_string()))
        .collect();

    Ok(AlbumInfo {
        release_date,
        agency,
        is_local_language,
        title_tracks,
    })
}

// ============================================================================
// Client
// ============================================================================

pub struct GenieClient {
    client: Client,
    base_url: String,
}

impl GenieClient {
    pub fn new() -> Result<Self, SourceError> {
        Self::with_base_url(BASE_URL)
    }

    pub fn with_base_url(base_url: &str) -> Result<Self, SourceError> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn get(&self, path: &str, query: &[(&str, &str)]) -> Result<Response, SourceError> {
        let url = format!("{}{}", self.base_url, path);
        debug!(url = %url, ?query, "GET");
        Ok(self.client.get(&url).query(query).send()?.error_for_status()?)
    }

    fn get_text(&self, path: &str, query: &[(&str, &str)]) -> Result<String, SourceError> {
        Ok(self.get(path, query)?.text()?)
    }
}

/// Server time of a response, from its `Date` header.
fn server_time(response: &Response) -> Result<DateTime<Utc>, SourceError> {
    let raw = response
        .headers()
        .get(DATE)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| SourceError::missing("Date header", response.url().as_str()))?;
    DateTime::parse_from_rfc2822(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| SourceError::Parse {
            what: "Date header",
            value: raw.to_string(),
        })
}

impl ChartSource for GenieClient {
    fn fetch_chart_page(&self, page: usize) -> Result<Vec<ChartEntry>, SourceError> {
        let pg = (page + 1).to_string();
        let markup = self.get_text(CHART_PATH, &[("ditc", "D"), ("rtm", "Y"), ("pg", pg.as_str())])?;
        let entries = parse_chart_page(&markup);
        if entries.is_empty() {
            return Err(SourceError::missing("chart entries", format!("page {}", pg)));
        }
        debug!("Chart page {} parsed ({} entries)", pg, entries.len());
        Ok(entries)
    }
}

impl NewestSource for GenieClient {
    fn fetch_newest(&self) -> Result<Vec<ChartEntry>, SourceError> {
        let markup = self.get_text(NEWEST_PATH, &[("GenreCode", "DM0000")])?;
        Ok(parse_chart_page(&markup))
    }
}

impl SongDetailSource for GenieClient {
    fn fetch_song_detail(&self, song_id: &str) -> Result<SongDetail, SourceError> {
        let response = self.get(SONG_PATH, &[("xgnm", song_id)])?;
        let observed_at = server_time(&response)?;
        let markup = response.text()?;
        parse_song_detail(&markup, observed_at)
    }

    fn fetch_song_entry(&self, song_id: &str) -> Result<ChartEntry, SourceError> {
        let markup = self.get_text(SONG_PATH, &[("xgnm", song_id)])?;
        parse_song_entry(song_id, &markup)
    }
}

impl AlbumSource for GenieClient {
    fn fetch_album(&self, album_id: &str) -> Result<AlbumInfo, SourceError> {
        let markup = self.get_text(ALBUM_PATH, &[("axnm", album_id)])?;
        parse_album(album_id, &markup, Utc::now())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const CHART_PAGE: &str = r##"
<table><tbody>
<tr class="list" songid="89409452">
  <td class="number">1</td>
  <td class="info">
    <a href="#" class="title ellipsis" title="재생">
      <span class="icon icon-19">19금</span>
      뚜두뚜두 (DDU-DU DDU-DU)
    </a>
    <a href="#" class="artist ellipsis" onclick="fnViewArtist('80123');return false;">BLACKPINK</a>
    <i class="bar">|</i>
    <a href="#" class="albumtitle ellipsis" onclick="fnViewAlbumLayer('81097612');return false;">SQUARE UP</a>
  </td>
</tr>
<tr class="list" songid="93186133">
  <td class="info">
    <a href="#" class="title ellipsis">Love &amp; Hate</a>
    <a href="#" class="artist ellipsis">Someone</a>
    <a href="#" class="albumtitle ellipsis" onclick="fnViewAlbumLayer('82000001');return false;">Single</a>
  </td>
</tr>
<tr class="list" songid="1">
  <td class="info"><a href="#" class="title ellipsis">No album</a></td>
</tr>
</tbody></table>"##;

    const ALBUM_PAGE: &str = r#"
<ul class="info-data">
  <li><span class="attr"><img src="/icon_release.gif" alt="발매일" /></span><span class="value">2018.06.15</span></li>
  <li><span class="attr"><img src="/icon_genre.gif" alt="장르/스타일" /></span><span class="value">가요 / 댄스</span></li>
  <li><span class="attr"><img src="/icon_agency.gif" alt="기획사" /></span><span class="value">YG Entertainment</span></li>
</ul>
<table><tbody>
<tr class="list" songid="89409452"><td><span class="icon-title">TITLE</span>뚜두뚜두</td></tr>
<tr class="list" songid="89409453"><td>Forever Young</td></tr>
</tbody></table>"#;

    const SONG_PAGE: &str = r##"
<h2 class="name">
  <span class="icon icon-19">19금</span>
  뚜두뚜두 (DDU-DU DDU-DU)
</h2>
<ul class="info-data">
  <li><span class="attr"><img alt="아티스트" /></span><span class="value"><a href="#" onclick="fnGoMore('artistInfo','80123');return false;">BLACKPINK</a></span></li>
  <li><span class="attr"><img alt="앨범" /></span><span class="value"><a href="#" onclick="fnGoMore('albumInfo','81097612');return false;">SQUARE UP</a></span></li>
  <li><span class="attr"><img alt="작사가" /></span><span class="value">TEDDY</span></li>
  <li><span class="attr"><img alt="작곡가" /></span><span class="value">TEDDY, R.Tee, 24</span></li>
</ul>
<div class="total">
  <div><p>1,234,567</p><span class="icon"><img alt="전체 재생수" /></span></div>
  <div><p>98,765</p><span class="icon"><img alt="전체 청취자수" /></span></div>
</div>"##;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2018, 9, 18, 12, 30, 0).unwrap()
    }

    #[test]
    fn test_parse_chart_page() {
        let entries = parse_chart_page(CHART_PAGE);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].id, "89409452");
        assert_eq!(entries[0].title, "뚜두뚜두 (DDU-DU DDU-DU)");
        assert_eq!(entries[0].artist, "BLACKPINK");
        assert_eq!(entries[0].album_id, "81097612");
        assert_eq!(entries[1].title, "Love & Hate");
    }

    #[test]
    fn test_parse_album() {
        let album = parse_album("81097612", ALBUM_PAGE, now()).unwrap();
        assert_eq!(album.agency, "YG Entertainment");
        assert!(album.is_local_language);
        assert_eq!(album.title_tracks, vec!["89409452".to_string()]);
        assert!(album.is_eligible("89409452"));
        assert!(!album.is_eligible("89409453"));
        assert_eq!(
            album.release_date,
            Utc.with_ymd_and_hms(2018, 6, 15, 9, 0, 0).unwrap().fixed_offset()
        );
    }

    #[test]
    fn test_parse_album_foreign_genre() {
        let markup = ALBUM_PAGE.replace("가요 / 댄스", "POP");
        assert!(!parse_album("1", &markup, now()).unwrap().is_local_language);
    }

    #[test]
    fn test_parse_album_without_date_fails() {
        assert!(parse_album("1", "<html></html>", now()).is_err());
        let markup = ALBUM_PAGE.replace("2018.06.15", "soon");
        assert!(matches!(
            parse_album("1", &markup, now()),
            Err(SourceError::Parse { .. })
        ));
    }

    #[test]
    fn test_parse_song_entry() {
        let entry = parse_song_entry("89409452", SONG_PAGE).unwrap();
        assert_eq!(entry.title, "뚜두뚜두 (DDU-DU DDU-DU)");
        assert_eq!(entry.artist, "BLACKPINK");
        assert_eq!(entry.album_id, "81097612");
    }

    #[test]
    fn test_parse_song_detail() {
        let detail = parse_song_detail(SONG_PAGE, now()).unwrap();
        assert_eq!(detail.observed_at, now());
        assert_eq!(detail.plays, 1_234_567);
        assert_eq!(detail.listeners, 98_765);
        assert_eq!(detail.credits.lyrics, vec!["TEDDY"]);
        assert_eq!(detail.credits.composition, vec!["TEDDY", "R.Tee", "24"]);
        assert!(detail.credits.arrangement.is_empty());
    }

    #[test]
    fn test_parse_song_detail_without_counters_fails() {
        let markup = SONG_PAGE.replace("전체 재생수", "something else");
        assert!(parse_song_detail(&markup, now()).is_err());
    }

    #[test]
    fn test_text_of() {
        assert_eq!(text_of("  <b>a</b>\n  b <span>x</span> "), "a b");
    }
}
