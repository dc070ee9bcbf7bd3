//! Core catalog model shared by the feed parser, the transformation pipeline and the sync engine.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "catsync-core";

/// Identifies a variant inside its product by its option values.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct VariantKey {
    pub color: Option<String>,
    pub size: Option<String>,
}

impl VariantKey {
    pub fn new(color: Option<String>, size: Option<String>) -> Self {
        Self {
            color: color.filter(|c| !c.trim().is_empty()),
            size: size.filter(|s| !s.trim().is_empty()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.color.is_none() && self.size.is_none()
    }

    /// Stable textual form used as hash input. Never changes across releases.
    pub fn canonical(&self) -> String {
        format!(
            "color={};size={}",
            self.color.as_deref().unwrap_or_default(),
            self.size.as_deref().unwrap_or_default()
        )
    }
}

impl fmt::Display for VariantKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.color, &self.size) {
            (Some(c), Some(s)) => write!(f, "{c} / {s}"),
            (Some(c), None) => write!(f, "{c}"),
            (None, Some(s)) => write!(f, "{s}"),
            (None, None) => write!(f, "default"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceVariant {
    pub key: VariantKey,
    /// `None` means the variant inherits the product price.
    pub price: Option<f64>,
    pub stock: Option<u32>,
    pub barcode: Option<String>,
}

/// A validated product as read from the supplier feed. Immutable for the rest of a cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceProduct {
    pub id: String,
    pub title: String,
    pub brand: Option<String>,
    pub category: Option<String>,
    pub price: f64,
    pub stock: u32,
    pub currency: Option<String>,
    pub tax_rate: Option<String>,
    pub barcode: Option<String>,
    pub description: Option<String>,
    pub variants: Vec<SourceVariant>,
    pub images: Vec<String>,
    pub attributes: BTreeMap<String, String>,
}

impl SourceProduct {
    /// Distinct colors in first-seen order.
    pub fn colors(&self) -> Vec<&str> {
        distinct(self.variants.iter().filter_map(|v| v.key.color.as_deref()))
    }

    /// Distinct sizes in first-seen order.
    pub fn sizes(&self) -> Vec<&str> {
        distinct(self.variants.iter().filter_map(|v| v.key.size.as_deref()))
    }

    pub fn variant(&self, key: &VariantKey) -> Option<&SourceVariant> {
        self.variants.iter().find(|v| &v.key == key)
    }
}

fn distinct<'a>(values: impl Iterator<Item = &'a str>) -> Vec<&'a str> {
    let mut out: Vec<&str> = Vec::new();
    for value in values {
        if !out.contains(&value) {
            out.push(value);
        }
    }
    out
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetVariant {
    pub code: String,
    pub barcode: String,
    pub key: VariantKey,
    pub price: f64,
    pub stock: u32,
}

/// Marketplace-facing product derived from a [`SourceProduct`] by the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetProduct {
    pub id: String,
    pub title: String,
    pub brand: String,
    pub category: String,
    pub price: f64,
    pub stock: u32,
    pub currency: String,
    pub tax_rate: String,
    pub barcode: String,
    pub description: String,
    pub images: Vec<String>,
    pub bullets: Vec<String>,
    pub variants: Vec<TargetVariant>,
}

/// A product the parser had to skip. Collected, never fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
pub enum ValidationError {
    #[error("product #{index} ({}) is missing required field `{field}`", .product_id.as_deref().unwrap_or("<no id>"))]
    MissingField {
        index: usize,
        product_id: Option<String>,
        field: &'static str,
    },
    #[error("product #{index} ({}) has invalid `{field}` value {value:?}", .product_id.as_deref().unwrap_or("<no id>"))]
    InvalidNumber {
        index: usize,
        product_id: Option<String>,
        field: &'static str,
        value: String,
    },
}

/// Per-component digests kept next to the overall fingerprint for change reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct FingerprintParts {
    pub price: String,
    pub stock: String,
    pub variants: String,
    pub title: String,
    pub images: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub digest: String,
    #[serde(default)]
    pub parts: Option<FingerprintParts>,
}

impl Fingerprint {
    pub fn same_content(&self, other: &Fingerprint) -> bool {
        self.digest == other.digest
    }
}

/// What the storefront already holds for one product.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRecord {
    pub external_id: String,
    pub fingerprint: Fingerprint,
    pub last_synced_at: DateTime<Utc>,
    /// Variant SKU -> storefront variant id.
    #[serde(default)]
    pub variant_ids: BTreeMap<String, String>,
}
