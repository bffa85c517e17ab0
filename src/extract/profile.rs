use serde::{Deserialize, Serialize};

/// Maximum records kept from one keyword search page
pub const DEFAULT_RESULT_CAP: usize = 50;

/// How to tell that a results page has rendered
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Readiness {
    /// Wait for a result marker to appear; give up after `timeout_ms`
    WaitForSelector { selector: String, timeout_ms: u64 },

    /// Sleep a fixed time, for pages without a reliable marker
    FixedDelay { delay_ms: u64 },
}

/// Where each field of a result item lives in the DOM. Selectors are
/// relative to the item element.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldSelectors {
    /// Attribute holding the external id, read from the item element or
    /// its first descendant carrying it
    pub id_attribute: String,

    /// Fallback: regex over the item link whose first group is the id
    pub id_link_pattern: Option<String>,

    /// Regex over the item link whose first group is the shop id
    pub shop_id_link_pattern: Option<String>,

    pub link: Option<String>,
    pub name: Option<String>,
    pub price: Option<String>,
    pub original_price: Option<String>,
    pub discount: Option<String>,
    pub sold: Option<String>,
    pub rating: Option<String>,
    pub review_count: Option<String>,
    pub shop_name: Option<String>,
    pub shop_location: Option<String>,
    pub image: Option<String>,
    pub description: Option<String>,
    pub category: Option<String>,
}

/// Declarative description of one marketplace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatformProfile {
    pub name: String,

    /// Search page, `{keyword}` is replaced with the encoded keyword
    pub search_url: String,

    /// Shop page, `{shop_id}` is replaced; empty when unsupported
    #[serde(default)]
    pub shop_url: String,

    pub item_selector: String,
    pub readiness: Readiness,

    #[serde(default = "default_result_cap")]
    pub result_cap: usize,

    #[serde(default)]
    pub fields: FieldSelectors,
}

fn default_result_cap() -> usize {
    DEFAULT_RESULT_CAP
}

impl PlatformProfile {
    pub fn shopee() -> Self {
        Self {
            name: "shopee".to_string(),
            search_url: "https://shopee.co.id/search?keyword={keyword}".to_string(),
            shop_url: "https://shopee.co.id/shop/{shop_id}".to_string(),
            item_selector: "[data-sqe=\"product\"]".to_string(),
            readiness: Readiness::WaitForSelector {
                selector: "[data-sqe=\"product\"]".to_string(),
                timeout_ms: 10_000,
            },
            result_cap: DEFAULT_RESULT_CAP,
            fields: FieldSelectors {
                id_attribute: "data-itemid".to_string(),
                id_link_pattern: Some(r"-i\.\d+\.(\d+)".to_string()),
                shop_id_link_pattern: Some(r"-i\.(\d+)\.\d+".to_string()),
                link: Some("a".to_string()),
                name: Some(".product-name, [data-sqe=\"name\"]".to_string()),
                price: Some(".product-price, [data-sqe=\"price\"]".to_string()),
                original_price: Some(".original-price".to_string()),
                discount: Some(".discount-badge".to_string()),
                sold: Some(".sold-count".to_string()),
                rating: Some(".rating".to_string()),
                review_count: None,
                shop_name: None,
                shop_location: Some(".shop-location".to_string()),
                image: Some("img".to_string()),
                description: None,
                category: None,
            },
        }
    }

    pub fn tiktok_shop() -> Self {
        Self {
            name: "tiktok_shop".to_string(),
            search_url: "https://www.tiktok.com/search?q={keyword}".to_string(),
            shop_url: "https://www.tiktok.com/@{shop_id}".to_string(),
            item_selector: "[data-e2e=\"search-product-card\"], [data-product-id]".to_string(),
            readiness: Readiness::FixedDelay { delay_ms: 3_000 },
            result_cap: DEFAULT_RESULT_CAP,
            fields: FieldSelectors {
                id_attribute: "data-product-id".to_string(),
                id_link_pattern: Some(r"/product/(\d+)".to_string()),
                shop_id_link_pattern: None,
                link: Some("a".to_string()),
                name: Some("[data-e2e=\"product-title\"], .product-title".to_string()),
                price: Some("[data-e2e=\"product-price\"], .product-price".to_string()),
                original_price: Some(".original-price".to_string()),
                discount: Some(".discount".to_string()),
                sold: Some("[data-e2e=\"product-sold\"], .sold-count".to_string()),
                rating: Some(".rating".to_string()),
                review_count: None,
                shop_name: Some(".shop-name".to_string()),
                shop_location: None,
                image: Some("img".to_string()),
                description: None,
                category: None,
            },
        }
    }

    pub fn tokopedia() -> Self {
        Self {
            name: "tokopedia".to_string(),
            search_url: "https://www.tokopedia.com/search?st=product&q={keyword}".to_string(),
            shop_url: "https://www.tokopedia.com/{shop_id}/product".to_string(),
            item_selector: "[data-testid=\"divProductWrapper\"], [data-testid=\"master-product-card\"]".to_string(),
            readiness: Readiness::WaitForSelector {
                selector: "[data-testid=\"divProductWrapper\"], [data-testid=\"master-product-card\"]".to_string(),
                timeout_ms: 10_000,
            },
            result_cap: DEFAULT_RESULT_CAP,
            fields: FieldSelectors {
                id_attribute: "data-product-id".to_string(),
                id_link_pattern: None,
                shop_id_link_pattern: None,
                link: Some("a".to_string()),
                name: Some("[data-testid=\"spnSRPProdName\"], [data-testid=\"linkProductName\"]".to_string()),
                price: Some("[data-testid=\"spnSRPProdPrice\"], [data-testid=\"linkProductPrice\"]".to_string()),
                original_price: Some("[data-testid=\"lblProductSlashPrice\"]".to_string()),
                discount: Some("[data-testid=\"lblProductDiscount\"]".to_string()),
                sold: Some("[data-testid=\"spnIntegrityProductSold\"]".to_string()),
                rating: Some("[data-testid=\"spnSRPProdRating\"]".to_string()),
                review_count: None,
                shop_name: Some("[data-testid=\"spnSRPProdTabShopName\"]".to_string()),
                shop_location: Some("[data-testid=\"spnSRPProdTabShopLoc\"]".to_string()),
                image: Some("img".to_string()),
                description: None,
                category: None,
            },
        }
    }

    /// Profiles shipped with the crate
    pub fn builtin() -> Vec<Self> {
        vec![Self::shopee(), Self::tiktok_shop(), Self::tokopedia()]
    }

    pub fn supports_shops(&self) -> bool {
        !self.shop_url.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_profiles() {
        let profiles = PlatformProfile::builtin();
        let names: Vec<&str> = profiles.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["shopee", "tiktok_shop", "tokopedia"]);

        for profile in &profiles {
            assert!(profile.search_url.contains("{keyword}"));
            assert!(profile.supports_shops());
            assert_eq!(profile.result_cap, 50);
        }

        assert!(matches!(PlatformProfile::tiktok_shop().readiness, Readiness::FixedDelay { delay_ms: 3_000 }));
    }

    #[test]
    fn test_profile_from_yaml() {
        let yaml = r#"
name: lazada
search_url: "https://www.lazada.co.id/catalog/?q={keyword}"
item_selector: "[data-qa-locator=product-item]"
readiness:
  kind: wait_for_selector
  selector: "[data-qa-locator=product-item]"
  timeout_ms: 8000
fields:
  id_attribute: data-item-id
  name: ".title"
"#;
        let profile: PlatformProfile = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(profile.result_cap, DEFAULT_RESULT_CAP);
        assert!(!profile.supports_shops());
        assert_eq!(profile.fields.name.as_deref(), Some(".title"));
        assert!(profile.fields.price.is_none());
        assert!(matches!(profile.readiness, Readiness::WaitForSelector { timeout_ms: 8000, .. }));
    }
}
