//! Config-driven site strategy
//!
//! One strategy implementation whose behaviour is parameterized entirely by
//! the site's selector table and pagination mode. Selector keys:
//!
//! - `listing_item`: result cards on an index page (also the SERP counter)
//! - `detail_link`: anchor to a detail page, relative to a result card
//! - `next_page`: next-page anchor (cursor pagination)
//! - `external_id`: element whose text is the listing's external id;
//!   falls back to the last URL path segment
//! - field selectors: `title`, `price`, `area`, `rooms`, `city`,
//!   `district`, `description`, `image`, `agency`, `phone`
//!
//! Numbered pagination advances by rewriting the `page` query parameter;
//! cursor pagination follows `next_page`.

use anyhow::{Context, Result, anyhow};
use log::debug;
use scraper::{Html, Selector};
use url::Url;

use crate::config::{PaginationMode, SiteConfig};
use crate::fetch::FetchMode;
use crate::resilience::PageExpectations;
use crate::store::ListingRecord;

use super::{PageClass, SiteStrategy};

/// Selector-table strategy for sites without bespoke code
pub struct GenericStrategy {
    name: String,
    base_url: Url,
    seed_urls: Vec<String>,
    pagination: PaginationMode,
    listing_item: Option<Selector>,
    detail_link: Option<Selector>,
    next_page: Option<Selector>,
    external_id: Option<Selector>,
    title: Option<Selector>,
    price: Option<Selector>,
    area: Option<Selector>,
    rooms: Option<Selector>,
    city: Option<Selector>,
    district: Option<Selector>,
    description: Option<Selector>,
    image: Option<Selector>,
    agency: Option<Selector>,
    phone: Option<Selector>,
}

fn compile(site: &SiteConfig, key: &str) -> Result<Option<Selector>> {
    site.selectors
        .get(key)
        .map(|raw| Selector::parse(raw).map_err(|e| anyhow!("bad selector for {key}: {e}")))
        .transpose()
}

impl GenericStrategy {
    /// Compile the site's selector table once, up front
    pub fn from_config(name: &str, site: &SiteConfig) -> Result<Self> {
        Ok(Self {
            name: name.to_string(),
            base_url: Url::parse(&site.base_url)
                .with_context(|| format!("site {name} has an invalid base_url"))?,
            seed_urls: site.seed_urls.clone(),
            pagination: site.pagination,
            listing_item: compile(site, "listing_item")?,
            detail_link: compile(site, "detail_link")?,
            next_page: compile(site, "next_page")?,
            external_id: compile(site, "external_id")?,
            title: compile(site, "title")?,
            price: compile(site, "price")?,
            area: compile(site, "area")?,
            rooms: compile(site, "rooms")?,
            city: compile(site, "city")?,
            district: compile(site, "district")?,
            description: compile(site, "description")?,
            image: compile(site, "image")?,
            agency: compile(site, "agency")?,
            phone: compile(site, "phone")?,
        })
    }

    /// An index URL is one that matches a seed's path or carries a `page`
    /// query parameter; everything else is a detail page
    fn is_index_url(&self, url: &str) -> bool {
        if let Ok(parsed) = Url::parse(url) {
            if parsed.query_pairs().any(|(k, _)| k == "page" || k == "cursor") {
                return true;
            }
            return self.seed_urls.iter().any(|seed| {
                Url::parse(seed).is_ok_and(|s| s.path() == parsed.path())
            });
        }
        false
    }

    fn select_text(&self, html: &Html, selector: &Option<Selector>) -> Option<String> {
        let selector = selector.as_ref()?;
        let text: String = html
            .select(selector)
            .next()?
            .text()
            .collect::<String>()
            .trim()
            .to_string();
        (!text.is_empty()).then_some(text)
    }

    fn absolutize(&self, href: &str) -> Option<String> {
        self.base_url.join(href).ok().map(Into::into)
    }
}

/// Pull the first number out of a messy scraped string
///
/// Handles `"€ 195 000"`, `"195,000 EUR"`, `"86.5 m²"`, and
/// European-formatted decimals like `"195.000,50"`. After separator
/// normalization the digits fall into dot-separated groups; a final group
/// of one or two digits is the decimal part, every other group is a
/// thousands segment.
#[must_use]
pub fn parse_number(raw: &str) -> Option<f64> {
    let cleaned: String = raw
        .chars()
        .map(|c| if c == ',' { '.' } else { c })
        .filter(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    let groups: Vec<&str> = cleaned.split('.').filter(|g| !g.is_empty()).collect();
    let normalized = match groups.as_slice() {
        [] => return None,
        [single] => (*single).to_string(),
        [init @ .., last] if last.len() <= 2 => format!("{}.{last}", init.concat()),
        groups => groups.concat(),
    };
    normalized.parse().ok()
}

impl SiteStrategy for GenericStrategy {
    fn name(&self) -> &str {
        &self.name
    }

    fn seed_urls(&self) -> Vec<String> {
        self.seed_urls.clone()
    }

    fn classify_page(&self, url: &str) -> PageClass {
        if self.is_index_url(url) {
            PageClass {
                mode: FetchMode::FastHttp,
                expectations: PageExpectations {
                    non_empty: true,
                    min_bytes: 512,
                    // A first results page cannot legitimately be empty
                    // when the site paginates at all
                    results_expected: self.pagination != PaginationMode::None,
                },
            }
        } else {
            PageClass {
                mode: FetchMode::StealthBrowser,
                expectations: PageExpectations {
                    non_empty: true,
                    min_bytes: 1024,
                    results_expected: false,
                },
            }
        }
    }

    fn extract_listing(&self, html: &str, url: &str) -> Result<Option<ListingRecord>> {
        if self.is_index_url(url) {
            return Ok(None);
        }

        let doc = Html::parse_document(html);

        let external_id = self
            .select_text(&doc, &self.external_id)
            .or_else(|| {
                Url::parse(url).ok().and_then(|u| {
                    u.path_segments()?
                        .filter(|s| !s.is_empty())
                        .next_back()
                        .map(str::to_string)
                })
            })
            .ok_or_else(|| anyhow!("extract failed: no external id for {url}"))?;

        let mut record = ListingRecord::new(&self.name, external_id, url);

        record.title = self.select_text(&doc, &self.title);
        record.price = self.select_text(&doc, &self.price).as_deref().and_then(parse_number);
        record.area_sqm = self.select_text(&doc, &self.area).as_deref().and_then(parse_number);
        record.rooms = self
            .select_text(&doc, &self.rooms)
            .as_deref()
            .and_then(parse_number)
            .map(|n| n as u32);
        record.city = self.select_text(&doc, &self.city);
        record.district = self.select_text(&doc, &self.district);
        record.description = self.select_text(&doc, &self.description);
        record.agency = self.select_text(&doc, &self.agency);
        record.contact_phone = self.select_text(&doc, &self.phone);

        if let Some(selector) = &self.image {
            record.images = doc
                .select(selector)
                .filter_map(|el| el.value().attr("src").or_else(|| el.value().attr("data-src")))
                .filter_map(|src| self.absolutize(src))
                .collect();
        }

        if let (Some(price), Some(area)) = (record.price, record.area_sqm)
            && area > 0.0
        {
            record.price_per_sqm = Some(price / area);
        }

        if record.title.is_none() && record.price.is_none() {
            return Err(anyhow!(
                "extract failed: selectors matched neither title nor price on {url}"
            ));
        }

        Ok(Some(record))
    }

    fn extract_pagination(&self, html: &str, url: &str) -> Vec<String> {
        if !self.is_index_url(url) {
            return Vec::new();
        }

        let doc = Html::parse_document(html);
        let mut discovered = Vec::new();

        // Detail links from result cards
        if let Some(link_selector) = &self.detail_link {
            for el in doc.select(link_selector) {
                if let Some(href) = el.value().attr("href")
                    && let Some(absolute) = self.absolutize(href)
                {
                    discovered.push(absolute);
                }
            }
        }

        // The next index page
        match self.pagination {
            PaginationMode::Numbered => {
                if !self.is_last_page(html)
                    && let Some(next) = bump_page_param(url)
                {
                    discovered.push(next);
                }
            }
            PaginationMode::Cursor => {
                if let Some(selector) = &self.next_page
                    && let Some(href) = doc.select(selector).next().and_then(|el| el.value().attr("href"))
                    && let Some(absolute) = self.absolutize(href)
                {
                    discovered.push(absolute);
                }
            }
            PaginationMode::None => {}
        }

        debug!("{}: discovered {} URLs on {url}", self.name, discovered.len());
        discovered
    }

    fn is_last_page(&self, html: &str) -> bool {
        let doc = Html::parse_document(html);
        match self.pagination {
            // Numbered: last page when it holds no result cards
            PaginationMode::Numbered => self
                .listing_item
                .as_ref()
                .is_none_or(|sel| doc.select(sel).next().is_none()),
            // Cursor: last page when there is no next link
            PaginationMode::Cursor => self
                .next_page
                .as_ref()
                .is_none_or(|sel| doc.select(sel).next().is_none()),
            PaginationMode::None => true,
        }
    }

    fn count_results(&self, html: &str) -> usize {
        let Some(selector) = &self.listing_item else {
            return 0;
        };
        Html::parse_document(html).select(selector).count()
    }
}

/// Rewrite `?page=N` to `?page=N+1`
fn bump_page_param(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let current: u32 = parsed
        .query_pairs()
        .find(|(k, _)| k == "page")
        .and_then(|(_, v)| v.parse().ok())?;

    let mut next = parsed.clone();
    let pairs: Vec<(String, String)> = parsed
        .query_pairs()
        .map(|(k, v)| {
            if k == "page" {
                (k.to_string(), (current + 1).to_string())
            } else {
                (k.to_string(), v.to_string())
            }
        })
        .collect();
    next.query_pairs_mut().clear().extend_pairs(pairs);
    Some(next.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn site() -> SiteConfig {
        serde_json::from_value(serde_json::json!({
            "base_url": "https://listings.example",
            "seed_urls": ["https://listings.example/sale?page=1"],
            "pagination": "numbered",
            "selectors": {
                "listing_item": "div.offer",
                "detail_link": "div.offer a.more",
                "title": "h1.title",
                "price": "span.price",
                "area": "span.area",
                "rooms": "span.rooms"
            }
        }))
        .expect("valid site config")
    }

    fn strategy() -> GenericStrategy {
        GenericStrategy::from_config("example", &site()).expect("strategy compiles")
    }

    const INDEX_HTML: &str = r#"
        <html><body>
            <div class="offer"><a class="more" href="/listing/1001">One</a></div>
            <div class="offer"><a class="more" href="/listing/1002">Two</a></div>
        </body></html>
    "#;

    const DETAIL_HTML: &str = r#"
        <html><body>
            <h1 class="title">Two-bedroom near the park</h1>
            <span class="price">€ 195 000</span>
            <span class="area">86.5 m²</span>
            <span class="rooms">2 rooms</span>
        </body></html>
    "#;

    #[test]
    fn test_page_classification() {
        let s = strategy();
        let index = s.classify_page("https://listings.example/sale?page=3");
        assert_eq!(index.mode, FetchMode::FastHttp);
        assert!(index.expectations.results_expected);

        let detail = s.classify_page("https://listings.example/listing/1001");
        assert_eq!(detail.mode, FetchMode::StealthBrowser);
        assert!(!detail.expectations.results_expected);
    }

    #[test]
    fn test_extract_listing_fields() {
        let s = strategy();
        let record = s
            .extract_listing(DETAIL_HTML, "https://listings.example/listing/1001")
            .expect("extract")
            .expect("is a listing");

        assert_eq!(record.external_id, "1001");
        assert_eq!(record.title.as_deref(), Some("Two-bedroom near the park"));
        assert_eq!(record.price, Some(195_000.0));
        assert_eq!(record.area_sqm, Some(86.5));
        assert_eq!(record.rooms, Some(2));
        let per_sqm = record.price_per_sqm.expect("derived");
        assert!((per_sqm - 195_000.0 / 86.5).abs() < 0.01);
    }

    #[test]
    fn test_index_page_is_not_a_listing() {
        let s = strategy();
        assert!(
            s.extract_listing(INDEX_HTML, "https://listings.example/sale?page=1")
                .expect("ok")
                .is_none()
        );
    }

    #[test]
    fn test_extract_failure_on_empty_detail() {
        let s = strategy();
        assert!(
            s.extract_listing("<html></html>", "https://listings.example/listing/1001")
                .is_err()
        );
    }

    #[test]
    fn test_pagination_discovers_details_and_next_page() {
        let s = strategy();
        let urls = s.extract_pagination(INDEX_HTML, "https://listings.example/sale?page=1");
        assert!(urls.contains(&"https://listings.example/listing/1001".to_string()));
        assert!(urls.contains(&"https://listings.example/listing/1002".to_string()));
        assert!(urls.iter().any(|u| u.contains("page=2")));
    }

    #[test]
    fn test_last_page_stops_pagination() {
        let s = strategy();
        let empty = "<html><body>no offers here</body></html>";
        assert!(s.is_last_page(empty));
        let urls = s.extract_pagination(empty, "https://listings.example/sale?page=9");
        assert!(!urls.iter().any(|u| u.contains("page=10")));
    }

    #[test]
    fn test_count_results() {
        let s = strategy();
        assert_eq!(s.count_results(INDEX_HTML), 2);
        assert_eq!(s.count_results("<html></html>"), 0);
    }

    #[test]
    fn test_parse_number() {
        assert_eq!(parse_number("€ 195 000"), Some(195_000.0));
        assert_eq!(parse_number("195,000 EUR"), Some(195_000.0));
        assert_eq!(parse_number("86.5 m²"), Some(86.5));
        assert_eq!(parse_number("no digits"), None);
    }

    #[test]
    fn test_parse_number_european_decimal() {
        assert_eq!(parse_number("195.000,50"), Some(195_000.5));
        assert_eq!(parse_number("1.195.000"), Some(1_195_000.0));
        assert_eq!(parse_number("1.195.000,99 лв."), Some(1_195_000.99));
    }
}
