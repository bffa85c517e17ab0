use std::collections::HashSet;

use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::debug;
use url::Url;

use crate::error::EngineError;
use crate::extract::parse::{parse_count, parse_percentage, parse_price, parse_rating};
use crate::extract::profile::PlatformProfile;
use crate::storage::model::PriceFields;

const MAX_PAYLOAD_TEXT: usize = 2_000;

/// One product as seen on a page. Everything but the id is optional; a
/// missing field is stored as absent rather than failing the record.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RawRecord {
    pub external_id: String,
    pub name: Option<String>,
    pub price: Option<f64>,
    pub original_price: Option<f64>,
    pub discount_percentage: Option<i32>,
    pub sold_count: Option<i64>,
    pub rating: Option<f64>,
    pub review_count: Option<i64>,
    pub shop_id: Option<String>,
    pub shop_name: Option<String>,
    pub shop_location: Option<String>,
    pub url: Option<String>,
    pub image_urls: Vec<String>,
    pub description: Option<String>,
    pub category: Option<String>,
    pub raw_payload: Value,
}

impl RawRecord {
    pub fn new(external_id: &str) -> Self {
        Self {
            external_id: external_id.to_string(),
            raw_payload: Value::Object(Map::new()),
            ..Default::default()
        }
    }

    pub fn price_fields(&self) -> PriceFields {
        PriceFields {
            price: self.price,
            discount_percentage: self.discount_percentage,
            sold_count: self.sold_count,
            rating: self.rating,
        }
    }
}

/// Records pulled from one page plus the number of items skipped
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractionReport {
    pub records: Vec<RawRecord>,

    /// Items that matched but carried no usable id
    pub dropped: usize,
}

impl ExtractionReport {
    pub fn empty() -> Self {
        Self::default()
    }
}

fn compile(selector: &str) -> Result<Selector, EngineError> {
    Selector::parse(selector)
        .map_err(|e| EngineError::configuration(format!("invalid selector '{}': {:?}", selector, e)))
}

fn compile_opt(selector: &Option<String>) -> Result<Option<Selector>, EngineError> {
    selector.as_deref().map(compile).transpose()
}

fn compile_pattern(pattern: &Option<String>) -> Result<Option<Regex>, EngineError> {
    pattern
        .as_deref()
        .map(|p| Regex::new(p).map_err(|e| EngineError::configuration(format!("invalid pattern '{}': {}", p, e))))
        .transpose()
}

fn clean_text(element: ElementRef<'_>) -> Option<String> {
    let text = element.text().collect::<Vec<_>>().join(" ");
    let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
    (!text.is_empty()).then_some(text)
}

/// A platform profile with its selectors compiled, turning page HTML into
/// raw records
#[derive(Debug)]
pub struct RecordExtractor {
    platform: String,
    item: Selector,
    id_attribute: String,
    id_carrier: Option<Selector>,
    id_link: Option<Regex>,
    shop_id_link: Option<Regex>,
    link: Option<Selector>,
    name: Option<Selector>,
    price: Option<Selector>,
    original_price: Option<Selector>,
    discount: Option<Selector>,
    sold: Option<Selector>,
    rating: Option<Selector>,
    review_count: Option<Selector>,
    shop_name: Option<Selector>,
    shop_location: Option<Selector>,
    image: Option<Selector>,
    description: Option<Selector>,
    category: Option<Selector>,
}

impl RecordExtractor {
    pub fn compile(profile: &PlatformProfile) -> Result<Self, EngineError> {
        let fields = &profile.fields;

        if fields.id_attribute.is_empty() && fields.id_link_pattern.is_none() {
            return Err(EngineError::configuration(format!(
                "platform {} has no way to read product ids",
                profile.name
            )));
        }

        let id_carrier = if fields.id_attribute.is_empty() {
            None
        } else {
            Some(compile(&format!("[{}]", fields.id_attribute))?)
        };

        Ok(Self {
            platform: profile.name.clone(),
            item: compile(&profile.item_selector)?,
            id_attribute: fields.id_attribute.clone(),
            id_carrier,
            id_link: compile_pattern(&fields.id_link_pattern)?,
            shop_id_link: compile_pattern(&fields.shop_id_link_pattern)?,
            link: compile_opt(&fields.link)?,
            name: compile_opt(&fields.name)?,
            price: compile_opt(&fields.price)?,
            original_price: compile_opt(&fields.original_price)?,
            discount: compile_opt(&fields.discount)?,
            sold: compile_opt(&fields.sold)?,
            rating: compile_opt(&fields.rating)?,
            review_count: compile_opt(&fields.review_count)?,
            shop_name: compile_opt(&fields.shop_name)?,
            shop_location: compile_opt(&fields.shop_location)?,
            image: compile_opt(&fields.image)?,
            description: compile_opt(&fields.description)?,
            category: compile_opt(&fields.category)?,
        })
    }

    /// Extract every result item on a page, keeping at most `cap` records.
    /// Items without an id are dropped; repeated ids keep the first sighting.
    pub fn extract_page(&self, html: &str, page_url: &Url, cap: Option<usize>) -> ExtractionReport {
        let document = Html::parse_document(html);
        let mut report = ExtractionReport::empty();
        let mut seen = HashSet::new();

        for item in document.select(&self.item) {
            if cap.map_or(false, |cap| report.records.len() >= cap) {
                break;
            }

            match self.extract_item(item, page_url) {
                Some(record) => {
                    if seen.insert(record.external_id.clone()) {
                        report.records.push(record);
                    } else {
                        debug!("Skipping repeated {} item {}", self.platform, record.external_id);
                    }
                }
                None => report.dropped += 1,
            }
        }

        if report.dropped > 0 {
            debug!("Dropped {} {} items without an id on {}", report.dropped, self.platform, page_url);
        }

        report
    }

    fn extract_item(&self, item: ElementRef<'_>, page_url: &Url) -> Option<RawRecord> {
        let link = self.item_link(item, page_url);
        let external_id = self.item_id(item, link.as_deref())?;

        let text_of = |selector: &Option<Selector>| {
            selector
                .as_ref()
                .and_then(|sel| item.select(sel).next())
                .and_then(clean_text)
        };

        let shop_id = match (&self.shop_id_link, link.as_deref()) {
            (Some(pattern), Some(href)) => pattern
                .captures(href)
                .and_then(|caps| caps.get(1))
                .map(|m| m.as_str().trim())
                .filter(|id| !id.is_empty())
                .map(str::to_string),
            _ => None,
        };

        let price_text = text_of(&self.price);
        let mut record = RawRecord {
            external_id,
            name: text_of(&self.name),
            price: price_text.as_deref().and_then(parse_price),
            original_price: text_of(&self.original_price).as_deref().and_then(parse_price),
            discount_percentage: text_of(&self.discount).as_deref().and_then(parse_percentage),
            sold_count: text_of(&self.sold).as_deref().and_then(parse_count),
            rating: text_of(&self.rating).as_deref().and_then(parse_rating),
            review_count: text_of(&self.review_count).as_deref().and_then(parse_count),
            shop_id,
            shop_name: text_of(&self.shop_name),
            shop_location: text_of(&self.shop_location),
            url: link,
            image_urls: self.item_images(item, page_url),
            description: text_of(&self.description),
            category: text_of(&self.category),
            raw_payload: Value::Null,
        };

        // Derive the discount when the page shows both prices but no badge
        if record.discount_percentage.is_none() {
            if let (Some(price), Some(original)) = (record.price, record.original_price) {
                if original > price && original > 0.0 {
                    record.discount_percentage = Some(((1.0 - price / original) * 100.0).round() as i32);
                }
            }
        }

        record.raw_payload = self.payload(item, page_url);
        Some(record)
    }

    fn item_id(&self, item: ElementRef<'_>, link: Option<&str>) -> Option<String> {
        let from_attribute = if self.id_attribute.is_empty() {
            None
        } else {
            item.value()
                .attr(&self.id_attribute)
                .or_else(|| {
                    self.id_carrier
                        .as_ref()
                        .and_then(|carrier| item.select(carrier).next())
                        .and_then(|el| el.value().attr(&self.id_attribute))
                })
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(str::to_string)
        };

        from_attribute.or_else(|| {
            let pattern = self.id_link.as_ref()?;
            let caps = pattern.captures(link?)?;
            caps.get(1)
                .map(|m| m.as_str().trim())
                .filter(|id| !id.is_empty())
                .map(str::to_string)
        })
    }

    fn item_link(&self, item: ElementRef<'_>, page_url: &Url) -> Option<String> {
        let href = if item.value().name() == "a" {
            item.value().attr("href")
        } else {
            None
        };

        let href = href.or_else(|| {
            self.link
                .as_ref()
                .and_then(|sel| item.select(sel).find_map(|el| el.value().attr("href")))
        })?;

        page_url.join(href.trim()).ok().map(String::from)
    }

    fn item_images(&self, item: ElementRef<'_>, page_url: &Url) -> Vec<String> {
        let Some(selector) = &self.image else {
            return Vec::new();
        };

        let mut images = Vec::new();
        for img in item.select(selector) {
            let src = img.value().attr("src").or_else(|| img.value().attr("data-src"));
            let Some(src) = src.map(str::trim).filter(|s| !s.is_empty() && !s.starts_with("data:")) else {
                continue;
            };

            if let Ok(resolved) = page_url.join(src) {
                let resolved = String::from(resolved);
                if !images.contains(&resolved) {
                    images.push(resolved);
                }
            }
        }
        images
    }

    fn payload(&self, item: ElementRef<'_>, page_url: &Url) -> Value {
        let attributes: Map<String, Value> = item
            .value()
            .attrs()
            .map(|(name, value)| (name.to_string(), Value::String(value.to_string())))
            .collect();

        let text: String = clean_text(item)
            .unwrap_or_default()
            .chars()
            .take(MAX_PAYLOAD_TEXT)
            .collect();

        json!({
            "platform": self.platform,
            "source_url": page_url.as_str(),
            "attributes": attributes,
            "text": text,
        })
    }
}
