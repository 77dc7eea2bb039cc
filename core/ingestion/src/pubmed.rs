//! PubMed E-utilities client.
//!
//! ESearch runs the query with `usehistory=y` so the result set is kept
//! server-side; EFetch then pages through it via the WebEnv/query_key pair,
//! carried as the [`ContinuationToken`].

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate, Utc};
use litwatch_schemas::{unknown_publication_date, RawRecord};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader as XmlReader;
use reqwest::{Client, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::config::PubMedConfig;
use crate::error::FetchError;
use crate::fetcher::{ContinuationToken, LiteratureSource, RateGate, SearchHandle};

const RETRY_DELAY_MS: u64 = 1000;

const UNKNOWN_TITLE: &str = "Unknown Title";
const UNKNOWN_VENUE: &str = "Unknown Journal";
const DEFAULT_ARTICLE_TYPE: &str = "Research Article";

pub struct PubMedClient {
    client: Client,
    config: PubMedConfig,
    gate: Arc<RateGate>,
}

impl PubMedClient {
    pub fn new(config: PubMedConfig) -> Result<Self, FetchError> {
        let gate = Arc::new(RateGate::new(config.request_interval()));
        Self::with_gate(config, gate)
    }

    /// Client drawing on an existing rate budget
    pub fn with_gate(config: PubMedConfig, gate: Arc<RateGate>) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(format!("{}/{}", config.tool, env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            config,
            gate,
        })
    }

    fn common_params(&self) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("db", "pubmed".to_string()),
            ("tool", self.config.tool.clone()),
        ];
        if let Some(ref email) = self.config.email {
            params.push(("email", email.clone()));
        }
        if let Some(ref api_key) = self.config.api_key {
            params.push(("api_key", api_key.clone()));
        }
        params
    }

    fn search_params(&self, query: &str, after: Option<NaiveDate>) -> Vec<(&'static str, String)> {
        let mut params = self.common_params();
        params.extend([
            ("term", query.to_string()),
            ("usehistory", "y".to_string()),
            ("retmax", "0".to_string()),
            ("sort", "date".to_string()),
        ]);
        params.extend(date_window(after, Utc::now().date_naive()));
        params
    }

    fn fetch_params(
        &self,
        token: &ContinuationToken,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<(&'static str, String)>, FetchError> {
        let (query_key, web_env) = token.0.split_once(':').ok_or(FetchError::MissingToken)?;

        let mut params = self.common_params();
        params.extend([
            ("query_key", query_key.to_string()),
            ("WebEnv", web_env.to_string()),
            ("retstart", offset.to_string()),
            ("retmax", limit.to_string()),
            ("retmode", "xml".to_string()),
            ("rettype", "abstract".to_string()),
        ]);
        Ok(params)
    }

    /// GET through the rate gate, retrying throttling, server errors and
    /// transport failures with exponential backoff
    async fn get_text(&self, endpoint: &str, params: &[(&'static str, String)]) -> Result<String, FetchError> {
        let url = format!("{}/{}", self.config.base_url, endpoint);
        let mut retries = 0;

        loop {
            self.gate.wait().await;
            debug!("GET {}", url);

            match self.client.get(&url).query(params).send().await {
                Ok(response) if response.status().is_success() => {
                    return Ok(response.text().await?);
                }
                Ok(response) => {
                    let status = response.status();
                    let retryable =
                        status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error();
                    if retryable && retries < self.config.max_retries {
                        retries += 1;
                        let delay = RETRY_DELAY_MS * 2_u64.pow(retries - 1);
                        warn!(
                            "PubMed returned {}, retrying ({}/{}) in {}ms",
                            status, retries, self.config.max_retries, delay
                        );
                        sleep(Duration::from_millis(delay)).await;
                        continue;
                    }
                    let body = response.text().await.unwrap_or_default();
                    return Err(FetchError::Status {
                        status: status.as_u16(),
                        body,
                    });
                }
                Err(e) if retries < self.config.max_retries => {
                    retries += 1;
                    let delay = RETRY_DELAY_MS * 2_u64.pow(retries - 1);
                    warn!(
                        "PubMed request failed ({}), retrying ({}/{}) in {}ms",
                        e, retries, self.config.max_retries, delay
                    );
                    sleep(Duration::from_millis(delay)).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[async_trait]
impl LiteratureSource for PubMedClient {
    async fn search(
        &self,
        query: &str,
        after: Option<NaiveDate>,
    ) -> Result<SearchHandle, FetchError> {
        let params = self.search_params(query, after);
        let xml = self.get_text("esearch.fcgi", &params).await?;
        let result = parse_esearch(&xml)?;

        debug!("ESearch matched {} records", result.count);

        let token = match (result.query_key, result.web_env) {
            (Some(key), Some(env)) => Some(ContinuationToken(format!("{}:{}", key, env))),
            _ => None,
        };

        Ok(SearchHandle {
            total_count: result.count,
            token,
        })
    }

    async fn fetch_page(
        &self,
        token: &ContinuationToken,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<RawRecord>, FetchError> {
        let params = self.fetch_params(token, offset, limit)?;
        let xml = self.get_text("efetch.fcgi", &params).await?;
        parse_efetch(&xml)
    }
}

/// Publication-date filter. With a cursor the window starts at the cursor;
/// without one it spans the previous and the current calendar year.
fn date_window(after: Option<NaiveDate>, today: NaiveDate) -> Vec<(&'static str, String)> {
    let (min, max) = match after {
        Some(date) => (date.format("%Y/%m/%d").to_string(), "3000".to_string()),
        None => ((today.year() - 1).to_string(), today.year().to_string()),
    };
    vec![
        ("datetype", "pdat".to_string()),
        ("mindate", min),
        ("maxdate", max),
    ]
}

// ========== RESPONSE PARSING ==========

#[derive(Debug, Default, PartialEq)]
struct ESearchResult {
    count: usize,
    web_env: Option<String>,
    query_key: Option<String>,
}

fn parse_esearch(xml: &str) -> Result<ESearchResult, FetchError> {
    let mut reader = XmlReader::from_str(xml);
    reader.trim_text(true);
    let mut buf = Vec::new();
    let mut path: Vec<String> = Vec::new();
    let mut result = ESearchResult::default();
    let mut error: Option<String> = None;

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(ref e) => path.push(element_name(e)),
            Event::End(_) => {
                path.pop();
            }
            Event::Text(ref t) => {
                let text = t.unescape()?.trim().to_string();
                // Count also appears nested inside the translation stack
                match path_tail(&path).as_slice() {
                    ["eSearchResult", "Count"] => {
                        result.count = text
                            .parse()
                            .map_err(|_| FetchError::Xml(format!("invalid Count '{}'", text)))?;
                    }
                    ["eSearchResult", "WebEnv"] => result.web_env = Some(text),
                    ["eSearchResult", "QueryKey"] => result.query_key = Some(text),
                    [.., "ERROR"] => error = Some(text),
                    _ => {}
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    if let Some(message) = error {
        if result.web_env.is_none() {
            return Err(FetchError::Xml(format!("ESearch error: {}", message)));
        }
    }
    Ok(result)
}

fn element_name(e: &BytesStart) -> String {
    String::from_utf8_lossy(e.name().as_ref()).into_owned()
}

/// Last two elements of the current path, for parent/child matching
fn path_tail(path: &[String]) -> Vec<&str> {
    path.iter()
        .rev()
        .take(2)
        .rev()
        .map(String::as_str)
        .collect::<Vec<_>>()
}

/// Fields gathered for one PubmedArticle while streaming
#[derive(Default)]
struct ArticleBuilder {
    pmid: Option<String>,
    title: String,
    abstract_sections: Vec<(Option<String>, String)>,
    authors: Vec<String>,
    last_name: Option<String>,
    fore_name: Option<String>,
    journal_title: Option<String>,
    iso_abbreviation: Option<String>,
    year: Option<String>,
    month: Option<String>,
    day: Option<String>,
    medline_date: Option<String>,
    publication_types: Vec<String>,
    reference_count: u32,
}

impl ArticleBuilder {
    fn build(self) -> Option<RawRecord> {
        let external_id = self.pmid.filter(|p| !p.is_empty())?;

        let title = collapse_whitespace(&self.title);
        let title = if title.is_empty() {
            UNKNOWN_TITLE.to_string()
        } else {
            title
        };

        let sections: Vec<(Option<String>, String)> = self
            .abstract_sections
            .into_iter()
            .map(|(label, text)| (label, collapse_whitespace(&text)))
            .filter(|(_, text)| !text.is_empty())
            .collect();
        let abstract_text = match sections.len() {
            0 => format!("Abstract not available. Title: {}", title),
            1 => sections[0].1.clone(),
            _ => sections
                .iter()
                .map(|(label, text)| match label {
                    Some(label) => format!("{}: {}", label, text),
                    None => text.clone(),
                })
                .collect::<Vec<_>>()
                .join(" "),
        };

        let published_date = resolve_publication_date(
            self.year.as_deref(),
            self.month.as_deref(),
            self.day.as_deref(),
            self.medline_date.as_deref(),
        );

        Some(RawRecord {
            external_id,
            title,
            abstract_text,
            published_date,
            article_type: self
                .publication_types
                .into_iter()
                .next()
                .unwrap_or_else(|| DEFAULT_ARTICLE_TYPE.to_string()),
            authors: self.authors,
            venue: self
                .journal_title
                .or(self.iso_abbreviation)
                .unwrap_or_else(|| UNKNOWN_VENUE.to_string()),
            reference_count: (self.reference_count > 0).then_some(self.reference_count),
        })
    }
}

/// Parse an EFetch PubmedArticleSet. Articles without a PMID are skipped;
/// every other missing field gets a default.
fn parse_efetch(xml: &str) -> Result<Vec<RawRecord>, FetchError> {
    let mut reader = XmlReader::from_str(xml);
    let mut buf = Vec::new();
    let mut path: Vec<String> = Vec::new();
    let mut current: Option<ArticleBuilder> = None;
    let mut records = Vec::new();

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(ref e) => {
                let name = element_name(e);
                match name.as_str() {
                    "PubmedArticle" => current = Some(ArticleBuilder::default()),
                    "AbstractText" if in_abstract(&path) => {
                        if let Some(article) = current.as_mut() {
                            let label = e
                                .attributes()
                                .flatten()
                                .find(|a| a.key.as_ref() == b"Label")
                                .and_then(|a| a.unescape_value().ok())
                                .map(|v| v.to_string());
                            article.abstract_sections.push((label, String::new()));
                        }
                    }
                    "Reference" if path.last().map(String::as_str) == Some("ReferenceList") => {
                        if let Some(article) = current.as_mut() {
                            article.reference_count += 1;
                        }
                    }
                    _ => {}
                }
                path.push(name);
            }
            Event::End(ref e) => {
                match e.name().as_ref() {
                    b"PubmedArticle" => {
                        if let Some(article) = current.take() {
                            match article.build() {
                                Some(record) => records.push(record),
                                None => warn!("Skipping PubMed article without PMID"),
                            }
                        }
                    }
                    b"Author" => {
                        if let Some(article) = current.as_mut() {
                            let fore = article.fore_name.take();
                            if let Some(last) = article.last_name.take() {
                                article.authors.push(match fore {
                                    Some(fore) => format!("{} {}", last, fore),
                                    None => last,
                                });
                            }
                        }
                    }
                    _ => {}
                }
                path.pop();
            }
            Event::Text(ref t) => {
                if let Some(article) = current.as_mut() {
                    let text = t.unescape()?;
                    collect_text(article, &path, &text);
                }
            }
            Event::CData(c) => {
                if let Some(article) = current.as_mut() {
                    let raw = c.into_inner();
                    collect_text(article, &path, &String::from_utf8_lossy(&raw));
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    debug!("Parsed {} articles from EFetch response", records.len());
    Ok(records)
}

fn in_abstract(path: &[String]) -> bool {
    path.last().map(String::as_str) == Some("Abstract")
        && !path.iter().any(|p| p == "OtherAbstract")
}

fn within(path: &[String], element: &str) -> bool {
    path.iter().any(|p| p == element)
}

/// Route a text node to the field its position in the document belongs to
fn collect_text(article: &mut ArticleBuilder, path: &[String], text: &str) {
    // Inline markup (<i>, <sup>) inside titles and abstracts
    if within(path, "ArticleTitle") {
        article.title.push_str(text);
        return;
    }
    if within(path, "AbstractText") && within(path, "Abstract") && !within(path, "OtherAbstract") {
        if let Some((_, section)) = article.abstract_sections.last_mut() {
            section.push_str(text);
        }
        return;
    }

    let text = text.trim();
    if text.is_empty() {
        return;
    }

    match path_tail(path).as_slice() {
        ["MedlineCitation", "PMID"] if article.pmid.is_none() => {
            article.pmid = Some(text.to_string());
        }
        ["Author", "LastName"] => article.last_name = Some(text.to_string()),
        ["Author", "ForeName"] => article.fore_name = Some(text.to_string()),
        ["Journal", "Title"] => article.journal_title = Some(text.to_string()),
        ["Journal", "ISOAbbreviation"] => article.iso_abbreviation = Some(text.to_string()),
        ["PubDate", "Year"] => article.year = Some(text.to_string()),
        ["PubDate", "Month"] => article.month = Some(text.to_string()),
        ["PubDate", "Day"] => article.day = Some(text.to_string()),
        ["PubDate", "MedlineDate"] => article.medline_date = Some(text.to_string()),
        ["PublicationTypeList", "PublicationType"] => {
            article.publication_types.push(text.to_string())
        }
        _ => {}
    }
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn month_number(raw: &str) -> Option<u32> {
    if let Ok(n) = raw.parse::<u32>() {
        return (1..=12).contains(&n).then_some(n);
    }
    let prefix: String = raw.chars().take(3).collect::<String>().to_lowercase();
    let months = [
        "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
    ];
    months
        .iter()
        .position(|m| *m == prefix)
        .map(|i| i as u32 + 1)
}

/// Best-effort publication date. Missing day or month default to 1; a
/// missing year falls back to the leading year of `MedlineDate`
/// ("2024 Jan-Feb"), and failing that to the fixed unknown-date sentinel.
fn resolve_publication_date(
    year: Option<&str>,
    month: Option<&str>,
    day: Option<&str>,
    medline_date: Option<&str>,
) -> NaiveDate {
    let mut medline_parts = medline_date.unwrap_or_default().split_whitespace();
    let medline_year = medline_parts
        .next()
        .and_then(|y| y.get(..4))
        .and_then(|y| y.parse::<i32>().ok());
    let medline_month = medline_parts.next();

    let year = match year.and_then(|y| y.trim().parse::<i32>().ok()) {
        Some(year) => year,
        None => match medline_year {
            Some(year) => year,
            None => return unknown_publication_date(),
        },
    };

    let month = month
        .or(medline_month)
        .and_then(month_number)
        .unwrap_or(1);
    let day = day.and_then(|d| d.trim().parse::<u32>().ok()).unwrap_or(1);

    NaiveDate::from_ymd_opt(year, month, day)
        .or_else(|| NaiveDate::from_ymd_opt(year, month, 1))
        .or_else(|| NaiveDate::from_ymd_opt(year, 1, 1))
        .unwrap_or_else(unknown_publication_date)
}
