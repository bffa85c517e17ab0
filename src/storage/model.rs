use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::extract::record::RawRecord;

/// Natural identity of a product; unique per store
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProductKey {
    pub platform: String,
    pub external_id: String,
    pub owner_id: i64,
}

impl ProductKey {
    pub fn new(platform: &str, external_id: &str, owner_id: i64) -> Self {
        Self {
            platform: platform.to_string(),
            external_id: external_id.to_string(),
            owner_id,
        }
    }
}

impl fmt::Display for ProductKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.platform, self.external_id, self.owner_id)
    }
}

/// The mutable fields whose change produces a price snapshot
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PriceFields {
    pub price: Option<f64>,
    pub discount_percentage: Option<i32>,
    pub sold_count: Option<i64>,
    pub rating: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductStatus {
    Active,
    Inactive,
    Deleted,
}

impl ProductStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Deleted => "deleted",
        }
    }
}

impl FromStr for ProductStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "inactive" => Ok(Self::Inactive),
            "deleted" => Ok(Self::Deleted),
            other => Err(format!("unknown product status: {}", other)),
        }
    }
}

impl fmt::Display for ProductStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted, deduplicated listing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: i64,
    pub owner_id: i64,
    pub platform: String,
    pub external_id: String,

    /// Task that first saw this product; kept on later sightings
    pub source_task_id: Option<i64>,

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
    pub status: ProductStatus,
    pub raw_payload: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Product {
    /// Build the row for a first sighting
    pub fn from_record(id: i64, key: &ProductKey, source_task_id: Option<i64>, record: &RawRecord, now: DateTime<Utc>) -> Self {
        let mut product = Self {
            id,
            owner_id: key.owner_id,
            platform: key.platform.clone(),
            external_id: key.external_id.clone(),
            source_task_id,
            name: None,
            price: None,
            original_price: None,
            discount_percentage: None,
            sold_count: None,
            rating: None,
            review_count: None,
            shop_id: None,
            shop_name: None,
            shop_location: None,
            url: None,
            image_urls: Vec::new(),
            description: None,
            category: None,
            status: ProductStatus::Active,
            raw_payload: Value::Null,
            created_at: now,
            updated_at: now,
        };
        product.apply_observation(record, now);
        product
    }

    pub fn key(&self) -> ProductKey {
        ProductKey::new(&self.platform, &self.external_id, self.owner_id)
    }

    pub fn price_fields(&self) -> PriceFields {
        PriceFields {
            price: self.price,
            discount_percentage: self.discount_percentage,
            sold_count: self.sold_count,
            rating: self.rating,
        }
    }

    /// Overwrite every observed field with the latest record. A sighting is
    /// also a sign of life, so the product becomes active again.
    pub fn apply_observation(&mut self, record: &RawRecord, now: DateTime<Utc>) {
        self.name = record.name.clone();
        self.price = record.price;
        self.original_price = record.original_price;
        self.discount_percentage = record.discount_percentage;
        self.sold_count = record.sold_count;
        self.rating = record.rating;
        self.review_count = record.review_count;
        self.shop_id = record.shop_id.clone();
        self.shop_name = record.shop_name.clone();
        self.shop_location = record.shop_location.clone();
        self.url = record.url.clone();
        self.image_urls = record.image_urls.clone();
        self.description = record.description.clone();
        self.category = record.category.clone();
        self.raw_payload = record.raw_payload.clone();
        self.status = ProductStatus::Active;
        self.updated_at = now;
    }
}

/// Append-only history entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceSnapshot {
    pub id: i64,
    pub product_id: i64,
    pub owner_id: i64,
    pub price: Option<f64>,
    pub discount_percentage: Option<i32>,
    pub sold_count: Option<i64>,
    pub rating: Option<f64>,
    pub recorded_at: DateTime<Utc>,
}

impl PriceSnapshot {
    pub fn of(id: i64, product: &Product, recorded_at: DateTime<Utc>) -> Self {
        let fields = product.price_fields();
        Self {
            id,
            product_id: product.id,
            owner_id: product.owner_id,
            price: fields.price,
            discount_percentage: fields.discount_percentage,
            sold_count: fields.sold_count,
            rating: fields.rating,
            recorded_at,
        }
    }

    pub fn fields(&self) -> PriceFields {
        PriceFields {
            price: self.price,
            discount_percentage: self.discount_percentage,
            sold_count: self.sold_count,
            rating: self.rating,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, price: Option<f64>) -> RawRecord {
        let mut record = RawRecord::new(id);
        record.name = Some("Phone".to_string());
        record.price = price;
        record
    }

    #[test]
    fn test_observation_overwrites_fields() {
        let key = ProductKey::new("shopee", "A", 7);
        let now = Utc::now();
        let mut product = Product::from_record(1, &key, Some(3), &record("A", Some(50000.0)), now);

        assert_eq!(product.status, ProductStatus::Active);
        assert_eq!(product.price, Some(50000.0));
        assert_eq!(product.key(), key);

        product.status = ProductStatus::Inactive;
        let mut next = record("A", None);
        next.sold_count = Some(10);
        product.apply_observation(&next, now);

        assert_eq!(product.price, None);
        assert_eq!(product.sold_count, Some(10));
        assert_eq!(product.status, ProductStatus::Active);
        assert_eq!(product.source_task_id, Some(3));
    }

    #[test]
    fn test_snapshot_captures_current_fields() {
        let key = ProductKey::new("shopee", "A", 7);
        let product = Product::from_record(5, &key, None, &record("A", Some(45000.0)), Utc::now());
        let snapshot = PriceSnapshot::of(1, &product, Utc::now());

        assert_eq!(snapshot.product_id, 5);
        assert_eq!(snapshot.owner_id, 7);
        assert_eq!(snapshot.fields(), product.price_fields());
    }

    #[test]
    fn test_status_parsing() {
        assert_eq!("deleted".parse::<ProductStatus>().unwrap(), ProductStatus::Deleted);
        assert!("gone".parse::<ProductStatus>().is_err());
    }
}
