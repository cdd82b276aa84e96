//! Source adapter contract + selector-profile HTML adapters for the job boards.

use std::collections::HashSet;
use std::sync::LazyLock;

use async_trait::async_trait;
use jobsync_core::{clean_text, RawRecord};
use jobsync_storage::{FetchError, HttpFetcher};
use regex::Regex;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobsync-adapters";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterContext {
    pub run_id: Uuid,
}

/// Opaque pointer to one posting on a source, as handed out by `list_refs`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceRef {
    pub url: String,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &str;

    /// Item cap this source was configured with, if any. Callers fall back to
    /// their own default when `None`.
    fn max_refs(&self) -> Option<usize> {
        None
    }

    /// Lists the postings currently advertised by the source. May be empty.
    async fn list_refs(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
    ) -> Result<Vec<SourceRef>, AdapterError>;

    /// `Ok(None)` when the ref no longer yields a posting.
    async fn fetch(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        source_ref: &SourceRef,
    ) -> Result<Option<RawRecord>, AdapterError>;
}

/// Selector cascades describing one job board. Each field list is tried in
/// order and the first non-empty match wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteProfile {
    pub source_id: String,
    pub listing_urls: Vec<String>,
    pub link_selectors: Vec<String>,
    /// Hosts (or parent domains) a posting link may point at.
    pub allowed_hosts: Vec<String>,
    /// At least one must appear in a link path, when non-empty.
    pub path_keywords: Vec<String>,
    pub title_selectors: Vec<String>,
    pub company_selectors: Vec<String>,
    pub location_selectors: Vec<String>,
    pub description_selectors: Vec<String>,
    pub salary_selectors: Vec<String>,
    pub job_type_selectors: Vec<String>,
    pub requirement_item_selectors: Vec<String>,
    pub benefit_item_selectors: Vec<String>,
    pub default_location: Option<String>,
    pub max_refs: usize,
}

impl SiteProfile {
    pub fn with_listing_urls(mut self, urls: Vec<String>) -> Self {
        if !urls.is_empty() {
            self.listing_urls = urls;
        }
        self
    }

    pub fn with_max_refs(mut self, max_refs: usize) -> Self {
        self.max_refs = max_refs.max(1);
        self
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

const COMMON_DESCRIPTION: [&str; 4] = [".job-description", ".description", ".content", "[class*=\"description\"]"];
const COMMON_REQUIREMENTS: [&str; 3] = [".requirements li", ".job-requirements li", ".qualifications li"];
const COMMON_BENEFITS: [&str; 2] = [".benefits li", ".job-benefits li"];

pub fn pnet_profile() -> SiteProfile {
    SiteProfile {
        source_id: "pnet".to_string(),
        listing_urls: strings(&["https://www.pnet.co.za/jobs/in-johannesburg"]),
        link_selectors: strings(&[
            "a[href*=\"/job/\"]",
            "a[href*=\"/jobs/\"]",
            ".job-title a",
            ".job-link a",
            "h3 a",
            "h2 a",
            ".result-title a",
        ]),
        allowed_hosts: strings(&["pnet.co.za"]),
        path_keywords: strings(&["/job"]),
        title_selectors: strings(&["h1.job-title", "h1", ".job-title", ".title", "[class*=\"title\"]"]),
        company_selectors: strings(&[
            ".company-name",
            ".company",
            ".employer",
            "[class*=\"company\"]",
            ".job-company",
        ]),
        location_selectors: strings(&[".job-location", ".location", "[class*=\"location\"]", ".address"]),
        description_selectors: strings(&COMMON_DESCRIPTION),
        salary_selectors: strings(&[".salary", ".job-salary", "[class*=\"salary\"]"]),
        job_type_selectors: strings(&[".job-type", ".employment-type", "[class*=\"job-type\"]"]),
        requirement_item_selectors: strings(&COMMON_REQUIREMENTS),
        benefit_item_selectors: strings(&COMMON_BENEFITS),
        default_location: Some("South Africa".to_string()),
        max_refs: 20,
    }
}

pub fn careers247_profile() -> SiteProfile {
    SiteProfile {
        source_id: "careers247".to_string(),
        listing_urls: strings(&["https://www.247careers.co.za/", "https://247vacancies4fresherz.com/"]),
        link_selectors: strings(&[
            "a[href*=\"/job\"]",
            "a[href*=\"/vacancy\"]",
            "a[href*=\"/career\"]",
            ".job-title a",
            ".job-link a",
            "h3 a",
            "h2 a",
            ".post-title a",
        ]),
        allowed_hosts: strings(&["247careers.co.za", "247vacancies4fresherz.com"]),
        path_keywords: Vec::new(),
        title_selectors: strings(&["h1.entry-title", "h1.post-title", "h1", ".job-title", ".title"]),
        company_selectors: strings(&[".company-name", ".company", ".employer", "[class*=\"company\"]"]),
        location_selectors: strings(&[".job-location", ".location", "[class*=\"location\"]"]),
        description_selectors: strings(&[
            ".entry-content",
            ".post-content",
            ".job-description",
            ".description",
            ".content",
        ]),
        salary_selectors: strings(&[".salary", "[class*=\"salary\"]"]),
        job_type_selectors: strings(&[".job-type", "[class*=\"job-type\"]"]),
        requirement_item_selectors: strings(&COMMON_REQUIREMENTS),
        benefit_item_selectors: strings(&COMMON_BENEFITS),
        default_location: Some("South Africa".to_string()),
        max_refs: 30,
    }
}

pub fn jobservicehub_profile() -> SiteProfile {
    SiteProfile {
        source_id: "jobservicehub".to_string(),
        listing_urls: strings(&["https://www.jobservicehub.com/"]),
        link_selectors: strings(&["a[href*=\"/job\"]", ".job-title a", "a.job-link", ".job-link a", "h2 a"]),
        allowed_hosts: strings(&["jobservicehub.com"]),
        path_keywords: strings(&["/job"]),
        title_selectors: strings(&["h1.job-title", "h1", ".job-title", ".title"]),
        company_selectors: strings(&[".company-name", ".company", ".employer", "[class*=\"company\"]"]),
        location_selectors: strings(&[".job-location", ".location", "[class*=\"location\"]"]),
        description_selectors: strings(&COMMON_DESCRIPTION),
        salary_selectors: strings(&[".salary", "[class*=\"salary\"]"]),
        job_type_selectors: strings(&[".job-type", "[class*=\"job-type\"]"]),
        requirement_item_selectors: strings(&COMMON_REQUIREMENTS),
        benefit_item_selectors: strings(&COMMON_BENEFITS),
        default_location: None,
        max_refs: 20,
    }
}

pub fn profile_for_source(source_id: &str) -> Option<SiteProfile> {
    match source_id {
        "pnet" => Some(pnet_profile()),
        "careers247" => Some(careers247_profile()),
        "jobservicehub" => Some(jobservicehub_profile()),
        _ => None,
    }
}

pub fn adapter_for_source(source_id: &str) -> Option<Box<dyn SourceAdapter>> {
    profile_for_source(source_id).map(|profile| Box::new(SiteProfileAdapter::new(profile)) as Box<dyn SourceAdapter>)
}

pub fn known_source_ids() -> &'static [&'static str] {
    &["pnet", "careers247", "jobservicehub"]
}

#[derive(Debug, Clone)]
pub struct SiteProfileAdapter {
    profile: SiteProfile,
}

impl SiteProfileAdapter {
    pub fn new(profile: SiteProfile) -> Self {
        Self { profile }
    }

    /// Posting links found on one listing page, absolute, fragment-free and
    /// deduplicated in document order.
    pub fn parse_listing(&self, page_url: &str, html: &str) -> Result<Vec<String>, AdapterError> {
        let base = Url::parse(page_url).map_err(|e| AdapterError::Message(format!("bad listing url {page_url}: {e}")))?;
        let document = Html::parse_document(html);
        let mut seen = HashSet::new();
        let mut links = Vec::new();

        for selector in &self.profile.link_selectors {
            for href in select_all_attrs(&document, selector, "href")? {
                let Some(url) = self.accept_link(&base, &href) else {
                    continue;
                };
                if seen.insert(url.clone()) {
                    links.push(url);
                }
            }
        }
        Ok(links)
    }

    fn accept_link(&self, base: &Url, href: &str) -> Option<String> {
        let mut url = base.join(href.trim()).ok()?;
        if !matches!(url.scheme(), "http" | "https") {
            return None;
        }
        url.set_fragment(None);
        let host = url.host_str()?;
        let host_ok = self.profile.allowed_hosts.is_empty()
            || self
                .profile
                .allowed_hosts
                .iter()
                .any(|allowed| host == allowed || host.ends_with(&format!(".{allowed}")));
        let path_ok = self.profile.path_keywords.is_empty()
            || self
                .profile
                .path_keywords
                .iter()
                .any(|keyword| url.path().contains(keyword.as_str()));
        let is_listing = url.as_str() == base.as_str();
        (host_ok && path_ok && !is_listing).then(|| url.to_string())
    }

    /// `Ok(None)` when the page carries no title.
    pub fn parse_detail(&self, url: &str, html: &str) -> Result<Option<RawRecord>, AdapterError> {
        let document = Html::parse_document(html);
        let Some(title) = first_match(&document, &self.profile.title_selectors)? else {
            return Ok(None);
        };

        let company = first_match(&document, &self.profile.company_selectors)?.unwrap_or_default();
        let location = first_match(&document, &self.profile.location_selectors)?
            .or_else(|| self.profile.default_location.clone())
            .unwrap_or_default();
        let description = first_match(&document, &self.profile.description_selectors)?.unwrap_or_default();
        let salary = match first_match(&document, &self.profile.salary_selectors)? {
            Some(salary) => salary,
            None => extract_salary(&format!("{title} {description}")).unwrap_or_default(),
        };
        let job_type = first_match(&document, &self.profile.job_type_selectors)?.unwrap_or_default();
        let requirements = first_list(&document, &self.profile.requirement_item_selectors)?.join("; ");
        let benefits = first_list(&document, &self.profile.benefit_item_selectors)?.join("; ");

        Ok(Some(RawRecord {
            title,
            company,
            location,
            description,
            salary,
            job_type,
            requirements,
            benefits,
            source_url: url.to_string(),
            source_name: self.profile.source_id.clone(),
        }))
    }
}

#[async_trait]
impl SourceAdapter for SiteProfileAdapter {
    fn source_id(&self) -> &str {
        &self.profile.source_id
    }

    fn max_refs(&self) -> Option<usize> {
        Some(self.profile.max_refs)
    }

    async fn list_refs(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
    ) -> Result<Vec<SourceRef>, AdapterError> {
        let mut seen = HashSet::new();
        let mut refs = Vec::new();
        let mut last_error = None;
        let mut pages_ok = 0usize;

        for listing_url in &self.profile.listing_urls {
            let page = match http.fetch_bytes(ctx.run_id, &self.profile.source_id, listing_url).await {
                Ok(page) => page,
                Err(err) => {
                    warn!(source_id = %self.profile.source_id, url = %listing_url, error = %err, "listing fetch failed");
                    last_error = Some(err);
                    continue;
                }
            };
            pages_ok += 1;
            for url in self.parse_listing(&page.final_url, &page.text())? {
                if seen.insert(url.clone()) {
                    refs.push(SourceRef { url });
                }
            }
        }

        if pages_ok == 0 {
            if let Some(err) = last_error {
                return Err(AdapterError::Fetch(err));
            }
        }

        refs.truncate(self.profile.max_refs);
        debug!(source_id = %self.profile.source_id, refs = refs.len(), "listing parsed");
        Ok(refs)
    }

    async fn fetch(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        source_ref: &SourceRef,
    ) -> Result<Option<RawRecord>, AdapterError> {
        let page = match http.fetch_bytes(ctx.run_id, &self.profile.source_id, &source_ref.url).await {
            Ok(page) => page,
            Err(FetchError::HttpStatus { status: 404 | 410, .. }) => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        self.parse_detail(&source_ref.url, &page.text())
    }
}

static SALARY_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"\$[\d,]+(?:\.\d{2})?\s*-?\s*\$?[\d,]*(?:\.\d{2})?\s*(?:per\s+hour|/hr|hourly|annually|per\s+year|/year)?",
        r"[\d,]+\s*-\s*[\d,]+\s*(?:CAD|USD|ZAR|GBP|AED|\$)",
        r"(?i)(?:salary|pay|compensation):\s*[R$£]?[\d,]+(?:\.\d{2})?(?:\s*-\s*[R$£]?[\d,]+(?:\.\d{2})?)?",
        r"\bR\s?\d[\d,]*(?:\.\d{2})?(?:\s*-\s*R?\s?\d[\d,]*(?:\.\d{2})?)?",
    ]
    .iter()
    .filter_map(|pattern| Regex::new(pattern).ok())
    .collect()
});

/// First salary-looking phrase in `text`.
pub fn extract_salary(text: &str) -> Option<String> {
    let text = clean_text(text);
    SALARY_PATTERNS
        .iter()
        .find_map(|re| re.find(&text))
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| s.chars().any(|c| c.is_ascii_digit()))
}

fn parse_selector(selector: &str) -> Result<Selector, AdapterError> {
    Selector::parse(selector).map_err(|e| AdapterError::Message(format!("selector {selector}: {e}")))
}

fn text_or_none(raw: String) -> Option<String> {
    let cleaned = clean_text(&raw);
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned)
    }
}

fn select_first_text(document: &Html, selector: &str) -> Result<Option<String>, AdapterError> {
    let sel = parse_selector(selector)?;
    Ok(document
        .select(&sel)
        .find_map(|n| text_or_none(n.text().collect::<Vec<_>>().join(" "))))
}

fn select_all_texts(document: &Html, selector: &str) -> Result<Vec<String>, AdapterError> {
    let sel = parse_selector(selector)?;
    Ok(document
        .select(&sel)
        .filter_map(|n| text_or_none(n.text().collect::<Vec<_>>().join(" ")))
        .collect())
}

fn select_all_attrs(document: &Html, selector: &str, attr: &str) -> Result<Vec<String>, AdapterError> {
    let sel = parse_selector(selector)?;
    Ok(document
        .select(&sel)
        .filter_map(|n| n.value().attr(attr))
        .filter(|v| !v.trim().is_empty())
        .map(str::to_string)
        .collect())
}

fn first_match(document: &Html, selectors: &[String]) -> Result<Option<String>, AdapterError> {
    for selector in selectors {
        if let Some(text) = select_first_text(document, selector)? {
            return Ok(Some(text));
        }
    }
    Ok(None)
}

fn first_list(document: &Html, selectors: &[String]) -> Result<Vec<String>, AdapterError> {
    for selector in selectors {
        let items = select_all_texts(document, selector)?;
        if !items.is_empty() {
            return Ok(items);
        }
    }
    Ok(Vec::new())
}
