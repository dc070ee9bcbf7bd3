//! Source-to-marketplace catalog transformation.

pub mod barcode;
pub mod buybox;

use std::fmt;

use catsync_core::{SourceProduct, TargetProduct, TargetVariant, VariantKey};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

pub use barcode::BarcodeAllocator;

pub const CRATE_NAME: &str = "catsync-transform";

const DEFAULT_CURRENCY: &str = "TL";
const MAX_BULLETS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BarcodeStrategy {
    /// Use the feed's barcode, falling back to the first variant barcode.
    Keep,
    Blank,
    #[default]
    Synthetic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CategorySelection {
    /// Subcategory picked from a hash of the product id.
    #[default]
    Stable,
    /// Subcategory drawn from the run's random source.
    PerRun,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuyboxConfig {
    pub enabled: bool,
    pub title_prefix_pool: Vec<String>,
    pub synthetic_brand: bool,
    pub category_selection: CategorySelection,
    pub subcategory_pool: Vec<String>,
    /// Label of the hidden description paragraph; no marker when unset.
    pub description_marker: Option<String>,
    /// Fixes the random source. Leave unset in production.
    pub seed: Option<u64>,
}

impl Default for BuyboxConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            title_prefix_pool: [
                "Premium", "Elite", "Luxury", "Classic", "Modern", "Style", "Trend", "Fashion",
                "Comfort", "Quality", "Best", "Top",
            ]
            .map(String::from)
            .to_vec(),
            synthetic_brand: true,
            category_selection: CategorySelection::Stable,
            subcategory_pool: ["Premium", "Comfort", "Sport", "Casual", "Classic", "Modern"]
                .map(String::from)
                .to_vec(),
            description_marker: None,
            seed: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransformConfig {
    pub barcode_strategy: BarcodeStrategy,
    pub barcode_prefix: String,
    pub barcode_length: usize,
    pub variant_mode: bool,
    pub title_template: String,
    pub brand_override: Option<String>,
    pub add_bullets: bool,
    pub sanitize_images: bool,
    pub exclude_code_prefixes: Vec<String>,
    pub buybox: BuyboxConfig,
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            barcode_strategy: BarcodeStrategy::Synthetic,
            barcode_prefix: "2199".to_string(),
            barcode_length: 13,
            variant_mode: false,
            title_template: "{title}".to_string(),
            brand_override: None,
            add_bullets: false,
            sanitize_images: true,
            exclude_code_prefixes: vec!["WG".to_string()],
            buybox: BuyboxConfig::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("invalid transform config: {0}")]
    InvalidConfig(String),
    #[error(
        "no free {length}-digit barcode with prefix {prefix} left for product {product_id} ({variant})"
    )]
    BarcodeSpaceExhausted {
        product_id: String,
        variant: String,
        prefix: String,
        length: usize,
    },
}

/// Something the pipeline worked around without dropping the product.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransformWarning {
    MissingPlaceholder { product_id: String, placeholder: String },
}

impl fmt::Display for TransformWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingPlaceholder { product_id, placeholder } => {
                write!(f, "{product_id}: title placeholder {{{placeholder}}} has no value")
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TransformOutput {
    pub products: Vec<TargetProduct>,
    pub warnings: Vec<TransformWarning>,
}

/// One pipeline per run. Owns the random source so that a seeded pipeline replays exactly.
pub struct Pipeline {
    config: TransformConfig,
    rng: StdRng,
}

impl Pipeline {
    pub fn new(config: TransformConfig) -> Result<Self, TransformError> {
        let rng = match config.buybox.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self::with_rng(config, rng)
    }

    pub fn with_rng(config: TransformConfig, rng: StdRng) -> Result<Self, TransformError> {
        // Surfaces barcode settings errors before any product is touched.
        BarcodeAllocator::new(&config.barcode_prefix, config.barcode_length)?;
        if config.title_template.trim().is_empty() {
            return Err(TransformError::InvalidConfig("title_template is empty".to_string()));
        }
        Ok(Self { config, rng })
    }

    pub fn config(&self) -> &TransformConfig {
        &self.config
    }

    /// Transforms the whole catalog. Barcode uniqueness holds across everything returned.
    pub fn run(&mut self, products: &[SourceProduct]) -> Result<TransformOutput, TransformError> {
        let mut allocator = BarcodeAllocator::new(&self.config.barcode_prefix, self.config.barcode_length)?;
        let mut output = TransformOutput::default();

        for product in products {
            let target = self.transform_product(product, &mut allocator, &mut output.warnings)?;
            output.products.push(target);
        }

        for warning in &output.warnings {
            warn!(%warning, "transform warning");
        }
        debug!(
            products = output.products.len(),
            barcodes = allocator.allocated(),
            "catalog transformed"
        );
        Ok(output)
    }

    fn transform_product(
        &mut self,
        product: &SourceProduct,
        allocator: &mut BarcodeAllocator,
        warnings: &mut Vec<TransformWarning>,
    ) -> Result<TargetProduct, TransformError> {
        let config = &self.config;
        let noise = &config.buybox;

        let variants = if config.variant_mode && !product.variants.is_empty() {
            expand_variants(product, config.barcode_strategy, allocator)?
        } else {
            Vec::new()
        };
        let stock = if variants.is_empty() {
            product.stock
        } else {
            variants.iter().map(|v| v.stock).sum()
        };

        let barcode = match config.barcode_strategy {
            BarcodeStrategy::Synthetic => allocator.allocate(&product.id, &VariantKey::default())?,
            BarcodeStrategy::Keep => product
                .barcode
                .clone()
                .or_else(|| product.variants.iter().find_map(|v| v.barcode.clone()))
                .unwrap_or_default(),
            BarcodeStrategy::Blank => String::new(),
        };

        let mut title = render_title(&config.title_template, product, warnings);
        if noise.enabled {
            title = buybox::prefix_title(&mut self.rng, &title, &noise.title_prefix_pool);
        }

        let stem = config
            .brand_override
            .clone()
            .or_else(|| product.brand.clone())
            .unwrap_or_default();
        let brand = if noise.enabled && noise.synthetic_brand && !stem.is_empty() {
            buybox::synthetic_brand(&product.id, &stem)
        } else {
            stem
        };

        let mut category = product.category.clone().unwrap_or_default();
        if noise.enabled {
            category = buybox::obfuscate_category(
                &mut self.rng,
                &product.id,
                &category,
                &noise.subcategory_pool,
                noise.category_selection,
            );
        }

        let mut description = product.description.clone().unwrap_or_default();
        if let (true, Some(label)) = (noise.enabled, noise.description_marker.as_deref()) {
            description = buybox::mark_description(&mut self.rng, &description, label);
        }

        let images = if config.sanitize_images {
            product
                .images
                .iter()
                .map(|raw| buybox::sanitize_image_url(&mut self.rng, raw))
                .collect()
        } else {
            product.images.clone()
        };

        let bullets = if config.add_bullets {
            bullets_for(product, &brand)
        } else {
            Vec::new()
        };

        Ok(TargetProduct {
            id: product.id.clone(),
            title,
            brand,
            category,
            price: product.price,
            stock,
            currency: product
                .currency
                .clone()
                .unwrap_or_else(|| DEFAULT_CURRENCY.to_string()),
            tax_rate: product.tax_rate.clone().unwrap_or_default(),
            barcode,
            description,
            images,
            bullets,
            variants,
        })
    }
}

/// Colors x sizes. A dimension the product does not use counts as one empty value.
fn expand_variants(
    product: &SourceProduct,
    strategy: BarcodeStrategy,
    allocator: &mut BarcodeAllocator,
) -> Result<Vec<TargetVariant>, TransformError> {
    let colors = product.colors();
    let sizes = product.sizes();

    // Variant codes number colors by their sorted position.
    let mut sorted_colors = colors.clone();
    sorted_colors.sort_unstable();

    let color_dim: Vec<Option<&str>> = if colors.is_empty() {
        vec![None]
    } else {
        colors.iter().copied().map(Some).collect()
    };
    let size_dim: Vec<Option<&str>> = if sizes.is_empty() {
        vec![None]
    } else {
        sizes.iter().copied().map(Some).collect()
    };

    let mut out = Vec::with_capacity(color_dim.len() * size_dim.len());
    for color in &color_dim {
        for size in &size_dim {
            let key = VariantKey::new(color.map(str::to_string), size.map(str::to_string));
            let source = product.variant(&key);
            let source_barcode = source.and_then(|v| v.barcode.clone());

            let code = match &source_barcode {
                Some(code) => code.clone(),
                None => {
                    let color_idx = color
                        .and_then(|c| sorted_colors.iter().position(|s| *s == c))
                        .map_or(1, |i| i + 1);
                    match size {
                        Some(size) => format!("{}_{color_idx}_{size}", product.id),
                        None => format!("{}_{color_idx}", product.id),
                    }
                }
            };

            let barcode = match strategy {
                BarcodeStrategy::Synthetic => allocator.allocate(&product.id, &key)?,
                BarcodeStrategy::Keep => source_barcode.unwrap_or_default(),
                BarcodeStrategy::Blank => String::new(),
            };

            out.push(TargetVariant {
                code,
                barcode,
                price: source.and_then(|v| v.price).unwrap_or(product.price),
                stock: source.and_then(|v| v.stock).unwrap_or(product.stock),
                key,
            });
        }
    }
    Ok(out)
}

/// Substitutes `{name}` placeholders. Unknown names stay in the output verbatim.
fn render_title(template: &str, product: &SourceProduct, warnings: &mut Vec<TransformWarning>) -> String {
    let mut out = String::with_capacity(template.len() + product.title.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let Some(close) = after.find('}') else {
            out.push_str(&rest[open..]);
            return out;
        };
        let name = &after[..close];
        match placeholder_value(name, product) {
            Some(value) => out.push_str(&value),
            None => {
                warnings.push(TransformWarning::MissingPlaceholder {
                    product_id: product.id.clone(),
                    placeholder: name.to_string(),
                });
                out.push('{');
                out.push_str(name);
                out.push('}');
            }
        }
        rest = &after[close + 1..];
    }
    out.push_str(rest);
    out
}

fn placeholder_value(name: &str, product: &SourceProduct) -> Option<String> {
    let joined = |values: Vec<&str>| (!values.is_empty()).then(|| values.join(", "));
    match name {
        "title" => Some(product.title.clone()),
        "product_id" => Some(product.id.clone()),
        "brand" => product.brand.clone(),
        "category" => product
            .category
            .as_deref()
            .and_then(|c| c.rsplit('>').next())
            .map(|c| c.trim().to_string()),
        "color" => joined(product.colors()),
        "size" => joined(product.sizes()),
        other => product.attributes.get(other).cloned(),
    }
}

fn bullets_for(product: &SourceProduct, brand: &str) -> Vec<String> {
    let mut bullets = Vec::new();
    let colors = product.colors();
    if !colors.is_empty() {
        bullets.push(format!("Renk: {}", colors.join(", ")));
    }
    let sizes = product.sizes();
    if !sizes.is_empty() {
        bullets.push(format!("Beden: {}", sizes.join(", ")));
    }
    if !brand.is_empty() {
        bullets.push(format!("Marka: {brand}"));
    }
    bullets.extend(product.attributes.iter().map(|(k, v)| format!("{k}: {v}")));
    bullets.truncate(MAX_BULLETS);
    bullets
}
