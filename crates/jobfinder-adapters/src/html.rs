use std::sync::Arc;

use async_trait::async_trait;
use jobfinder_core::RawPosting;
use jobfinder_storage::{sha256_hex, HttpFetcher};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::{AdapterContext, AdapterError, RawPayload, SourceAdapter, SourceBatch};

/// CSS selectors for one listing page layout. All but `item` are evaluated
/// relative to each matched item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingSelectors {
    pub item: String,
    pub title: String,
    pub company: String,
    /// Element whose `href` is the posting url.
    pub link: String,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub salary: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Option<String>,
    /// Attribute on the item element carrying the source's own id.
    #[serde(default)]
    pub id_attr: Option<String>,
}

pub struct HtmlListingAdapter {
    source_id: String,
    listing_urls: Vec<String>,
    selectors: ListingSelectors,
    http: Arc<HttpFetcher>,
}

impl HtmlListingAdapter {
    pub fn new(
        source_id: impl Into<String>,
        listing_urls: Vec<String>,
        selectors: ListingSelectors,
        http: Arc<HttpFetcher>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            listing_urls,
            selectors,
            http,
        }
    }
}

#[async_trait]
impl SourceAdapter for HtmlListingAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn fetch(&self, ctx: &AdapterContext) -> Result<SourceBatch, AdapterError> {
        let mut batch = SourceBatch::default();
        for url in &self.listing_urls {
            let page = self.http.get_bytes(url).await?;
            let text = String::from_utf8_lossy(&page.body);
            let postings =
                parse_listing_html(&self.source_id, &page.final_url, &text, &self.selectors)?;
            debug!(
                source = %self.source_id,
                run_id = %ctx.run_id,
                url = %page.final_url,
                postings = postings.len(),
                "parsed listing page"
            );
            batch.postings.extend(postings);
            batch.payloads.push(RawPayload {
                url: page.final_url,
                content_type: page.content_type,
                body: page.body,
            });
        }
        Ok(batch)
    }
}

fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Parse(format!("selector `{css}`: {e}")))
}

fn text_or_none(value: String) -> Option<String> {
    let collapsed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

fn first_text(item: &ElementRef<'_>, sel: &Selector) -> Option<String> {
    item.select(sel)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>()))
}

fn all_texts(item: &ElementRef<'_>, sel: &Selector) -> Vec<String> {
    item.select(sel)
        .filter_map(|n| text_or_none(n.text().collect::<String>()))
        .collect()
}

fn optional_selector(css: Option<&str>) -> Result<Option<Selector>, AdapterError> {
    css.map(selector).transpose()
}

/// Resolve `href` against the page it was found on.
fn absolutize(base: &Url, href: &str) -> Option<String> {
    base.join(href.trim()).ok().map(String::from)
}

/// Pull whole-dollar bounds out of text like `$120k - $150,000`.
pub fn parse_salary_range(text: &str) -> (Option<i64>, Option<i64>) {
    let mut values = Vec::new();
    let mut digits = String::new();
    for ch in text.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
            continue;
        }
        if ch == ',' && !digits.is_empty() {
            continue;
        }
        if !digits.is_empty() {
            let mut value = digits.parse::<i64>().unwrap_or(0);
            if ch == 'k' || ch == 'K' {
                value = value.saturating_mul(1000);
            }
            values.push(value);
            digits.clear();
        }
    }
    if !digits.is_empty() {
        values.push(digits.parse::<i64>().unwrap_or(0));
    }
    values.retain(|v| *v > 0);
    match values.as_slice() {
        [] => (None, None),
        [only] => (Some(*only), None),
        [low, high, ..] => (Some(*low.min(high)), Some(*low.max(high))),
    }
}

/// Parse one listing page into raw postings. Items missing a title, company
/// or link are skipped.
pub fn parse_listing_html(
    source_id: &str,
    page_url: &str,
    html: &str,
    selectors: &ListingSelectors,
) -> Result<Vec<RawPosting>, AdapterError> {
    let item_sel = selector(&selectors.item)?;
    let title_sel = selector(&selectors.title)?;
    let company_sel = selector(&selectors.company)?;
    let link_sel = selector(&selectors.link)?;
    let location_sel = optional_selector(selectors.location.as_deref())?;
    let salary_sel = optional_selector(selectors.salary.as_deref())?;
    let description_sel = optional_selector(selectors.description.as_deref())?;
    let tags_sel = optional_selector(selectors.tags.as_deref())?;
    let base = Url::parse(page_url)
        .map_err(|e| AdapterError::Parse(format!("page url `{page_url}`: {e}")))?;

    let document = Html::parse_document(html);
    let mut postings = Vec::new();
    for item in document.select(&item_sel) {
        let (Some(title), Some(company)) =
            (first_text(&item, &title_sel), first_text(&item, &company_sel))
        else {
            continue;
        };
        let Some(href) = item
            .select(&link_sel)
            .next()
            .and_then(|n| n.value().attr("href"))
            .filter(|h| !h.trim().is_empty())
        else {
            continue;
        };
        let Some(url) = absolutize(&base, href) else {
            debug!(source = %source_id, href, "skipping unresolvable link");
            continue;
        };

        let location = location_sel.as_ref().and_then(|s| first_text(&item, s));
        let (salary_min, salary_max) = salary_sel
            .as_ref()
            .and_then(|s| first_text(&item, s))
            .map(|text| parse_salary_range(&text))
            .unwrap_or((None, None));
        let external_id = selectors
            .id_attr
            .as_deref()
            .and_then(|attr| item.value().attr(attr))
            .map(str::to_string)
            .unwrap_or_else(|| sha256_hex(url.as_bytes()));

        postings.push(RawPosting {
            source: source_id.to_string(),
            external_id,
            title,
            company,
            is_remote: location
                .as_deref()
                .is_some_and(|l| l.to_ascii_lowercase().contains("remote")),
            url,
            location,
            salary_min,
            salary_max,
            description: description_sel.as_ref().and_then(|s| first_text(&item, s)),
            tech_tags: tags_sel
                .as_ref()
                .map(|s| all_texts(&item, s))
                .unwrap_or_default(),
            posted_at: None,
        });
    }
    Ok(postings)
}
