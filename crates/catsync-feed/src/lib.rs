//! Supplier feed parsing and marketplace feed rendering.

mod render;

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::Context;
use catsync_core::{SourceProduct, SourceVariant, ValidationError, VariantKey};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use thiserror::Error;
use tracing::{debug, warn};

pub use render::render_target_feed;

pub const CRATE_NAME: &str = "catsync-feed";

const COLOR_SPECS: &[&str] = &["Renk", "Color", "Colour", "color"];
const SIZE_SPECS: &[&str] = &["Beden", "Size", "size", "Numara"];
const IMAGE_SLOTS: usize = 5;

const KNOWN_PRODUCT_FIELDS: &[&str] = &[
    "Product_code",
    "Product_id",
    "Name",
    "Price",
    "Stock",
    "Brand",
    "mainCategory",
    "category",
    "subCategory",
    "Category",
    "Barcode",
    "CurrencyType",
    "Tax",
    "Description",
    "Image1",
    "Image2",
    "Image3",
    "Image4",
    "Image5",
    "images",
    "variants",
];

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("malformed feed XML near byte {position}: {message}")]
    Parse { position: u64, message: String },
    #[error("rendering marketplace feed")]
    Render(#[from] quick_xml::Error),
}

impl FeedError {
    fn parse(position: u64, message: impl Into<String>) -> Self {
        Self::Parse {
            position,
            message: message.into(),
        }
    }
}

/// Products that passed validation, in feed order, plus the ones that were skipped.
#[derive(Debug, Clone, Default)]
pub struct ParsedCatalog {
    pub products: Vec<SourceProduct>,
    pub issues: Vec<ValidationError>,
}

#[derive(Debug, Clone, Default)]
struct XmlNode {
    name: String,
    attrs: Vec<(String, String)>,
    text: String,
    children: Vec<XmlNode>,
}

impl XmlNode {
    fn child(&self, name: &str) -> Option<&XmlNode> {
        self.children.iter().find(|c| c.name == name)
    }

    fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a XmlNode> + 'a {
        self.children.iter().filter(move |c| c.name == name)
    }

    fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    fn text(&self) -> Option<&str> {
        let trimmed = self.text.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed)
        }
    }

    fn child_text(&self, name: &str) -> Option<&str> {
        self.child(name).and_then(XmlNode::text)
    }
}

fn node_from_start(start: &BytesStart<'_>, position: u64) -> Result<XmlNode, FeedError> {
    let mut attrs = Vec::new();
    for attr in start.attributes() {
        let attr = attr.map_err(|e| FeedError::parse(position, e.to_string()))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|e| FeedError::parse(position, e.to_string()))?
            .into_owned();
        attrs.push((key, value));
    }
    Ok(XmlNode {
        name: String::from_utf8_lossy(start.name().as_ref()).into_owned(),
        attrs,
        ..XmlNode::default()
    })
}

fn attach(
    stack: &mut Vec<XmlNode>,
    root: &mut Option<XmlNode>,
    node: XmlNode,
    position: u64,
) -> Result<(), FeedError> {
    if let Some(parent) = stack.last_mut() {
        parent.children.push(node);
        return Ok(());
    }
    if root.is_some() {
        return Err(FeedError::parse(position, "document has more than one root element"));
    }
    *root = Some(node);
    Ok(())
}

fn read_tree(bytes: &[u8]) -> Result<XmlNode, FeedError> {
    let mut reader = Reader::from_reader(bytes);
    reader.config_mut().trim_text(true);

    let mut buf = Vec::new();
    let mut stack: Vec<XmlNode> = Vec::new();
    let mut root: Option<XmlNode> = None;

    loop {
        let position = reader.buffer_position() as u64;
        let event = reader
            .read_event_into(&mut buf)
            .map_err(|e| FeedError::parse(position, e.to_string()))?;
        match event {
            Event::Start(start) => stack.push(node_from_start(&start, position)?),
            Event::Empty(start) => {
                let node = node_from_start(&start, position)?;
                attach(&mut stack, &mut root, node, position)?;
            }
            Event::End(_) => {
                let node = stack
                    .pop()
                    .ok_or_else(|| FeedError::parse(position, "closing tag without opening tag"))?;
                attach(&mut stack, &mut root, node, position)?;
            }
            Event::Text(text) => {
                if let Some(top) = stack.last_mut() {
                    let text = text
                        .unescape()
                        .map_err(|e| FeedError::parse(position, e.to_string()))?;
                    top.text.push_str(&text);
                }
            }
            Event::CData(cdata) => {
                if let Some(top) = stack.last_mut() {
                    top.text.push_str(&String::from_utf8_lossy(&cdata.into_inner()));
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    let position = reader.buffer_position() as u64;
    if let Some(open) = stack.last() {
        return Err(FeedError::parse(
            position,
            format!("document ended inside <{}>", open.name),
        ));
    }
    root.ok_or_else(|| FeedError::parse(position, "document has no root element"))
}

/// Parse a supplier feed. A malformed document fails as a whole; a product with missing or
/// unreadable required fields is skipped and reported in [`ParsedCatalog::issues`].
pub fn parse_source_feed(bytes: &[u8]) -> Result<ParsedCatalog, FeedError> {
    let root = read_tree(bytes)?;
    let mut catalog = ParsedCatalog::default();

    for (index, node) in root.children_named("Product").enumerate() {
        match parse_product(index, node) {
            Ok(product) => catalog.products.push(product),
            Err(issue) => {
                warn!(%issue, "skipping product");
                catalog.issues.push(issue);
            }
        }
    }

    debug!(
        products = catalog.products.len(),
        skipped = catalog.issues.len(),
        "parsed source feed"
    );
    Ok(catalog)
}

pub fn parse_source_file(path: impl AsRef<Path>) -> anyhow::Result<ParsedCatalog> {
    let path = path.as_ref();
    let bytes = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    parse_source_feed(&bytes).with_context(|| format!("parsing {}", path.display()))
}

/// Drops products whose id starts with any of `prefixes`. Returns how many were removed.
pub fn exclude_by_code_prefix(products: &mut Vec<SourceProduct>, prefixes: &[String]) -> usize {
    if prefixes.is_empty() {
        return 0;
    }
    let before = products.len();
    products.retain(|p| !prefixes.iter().any(|prefix| p.id.starts_with(prefix.as_str())));
    before - products.len()
}

fn parse_product(index: usize, node: &XmlNode) -> Result<SourceProduct, ValidationError> {
    let id = node
        .child_text("Product_code")
        .or_else(|| node.child_text("Product_id"))
        .map(ToString::to_string);
    let Some(id) = id else {
        return Err(ValidationError::MissingField {
            index,
            product_id: None,
            field: "id",
        });
    };

    let missing = |field: &'static str| ValidationError::MissingField {
        index,
        product_id: Some(id.clone()),
        field,
    };
    let invalid = |field: &'static str, value: &str| ValidationError::InvalidNumber {
        index,
        product_id: Some(id.clone()),
        field,
        value: value.to_string(),
    };

    let title = node.child_text("Name").ok_or_else(|| missing("title"))?;
    let price_raw = node.child_text("Price").ok_or_else(|| missing("price"))?;
    let price = parse_decimal(price_raw).ok_or_else(|| invalid("price", price_raw))?;
    let stock_raw = node.child_text("Stock").ok_or_else(|| missing("stock"))?;
    let stock = parse_quantity(stock_raw).ok_or_else(|| invalid("stock", stock_raw))?;

    let mut images: Vec<String> = (1..=IMAGE_SLOTS)
        .filter_map(|i| node.child_text(&format!("Image{i}")))
        .map(ToString::to_string)
        .collect();
    if let Some(list) = node.child("images") {
        images.extend(list.children_named("image").filter_map(XmlNode::text).map(ToString::to_string));
    }

    let mut variants = Vec::new();
    if let Some(list) = node.child("variants") {
        for variant in list.children_named("variant") {
            variants.push(parse_variant(variant).map_err(|(field, value)| invalid(field, &value))?);
        }
    }

    let attributes = node
        .children
        .iter()
        .filter(|c| c.children.is_empty() && !KNOWN_PRODUCT_FIELDS.contains(&c.name.as_str()))
        .filter_map(|c| c.text().map(|t| (c.name.clone(), t.to_string())))
        .collect::<BTreeMap<_, _>>();

    Ok(SourceProduct {
        title: title.to_string(),
        brand: node.child_text("Brand").map(ToString::to_string),
        category: category_path(node),
        price,
        stock,
        currency: node.child_text("CurrencyType").map(normalize_currency),
        tax_rate: node.child_text("Tax").map(ToString::to_string),
        barcode: node.child_text("Barcode").map(ToString::to_string),
        description: node.child_text("Description").map(ToString::to_string),
        variants,
        images,
        attributes,
        id,
    })
}

/// A variant with an unreadable price or quantity fails with the offending field and value.
fn parse_variant(node: &XmlNode) -> Result<SourceVariant, (&'static str, String)> {
    let mut color = None;
    let mut size = None;
    for spec in node.children_named("spec") {
        let Some(name) = spec.attr("name") else {
            continue;
        };
        if COLOR_SPECS.contains(&name) {
            color = spec.text().map(ToString::to_string);
        } else if SIZE_SPECS.contains(&name) {
            size = spec.text().map(ToString::to_string);
        }
    }

    // An empty or zero price means "same as the product".
    let price = match node.child_text("price") {
        Some(raw) => parse_decimal(raw)
            .ok_or_else(|| ("variant.price", raw.to_string()))
            .map(|p| Some(p).filter(|p| *p > 0.0))?,
        None => None,
    };
    let stock = match node.child_text("quantity") {
        Some(raw) => parse_quantity(raw).ok_or_else(|| ("variant.quantity", raw.to_string()))?,
        None => 0,
    };
    let barcode = node
        .child_text("barcode")
        .or_else(|| node.child_text("productCode"))
        .or_else(|| node.child_text("variantId"))
        .map(ToString::to_string);

    Ok(SourceVariant {
        key: VariantKey::new(color, size),
        price,
        stock: Some(stock),
        barcode,
    })
}

fn category_path(node: &XmlNode) -> Option<String> {
    let parts: Vec<&str> = ["mainCategory", "category", "subCategory"]
        .iter()
        .filter_map(|tag| node.child_text(tag))
        .collect();
    if parts.is_empty() {
        node.child_text("Category").map(ToString::to_string)
    } else {
        Some(parts.join(" > "))
    }
}

fn normalize_currency(raw: &str) -> String {
    match raw.to_ascii_uppercase().as_str() {
        "TRL" | "TRY" | "TL" => "TL".to_string(),
        other => other.to_string(),
    }
}

/// Accepts `1299.90`, the comma-decimal `1299,90` and grouped forms such as `1.299,90` or
/// `1,299.90`, where the last separator is the decimal one.
fn parse_decimal(raw: &str) -> Option<f64> {
    let raw = raw.trim();
    let normalized = match (raw.rfind('.'), raw.rfind(',')) {
        (Some(dot), Some(comma)) => {
            let (decimal, grouping) = if comma > dot { (',', '.') } else { ('.', ',') };
            if raw.matches(decimal).count() > 1 {
                return None;
            }
            raw.replace(grouping, "").replace(decimal, ".")
        }
        (None, Some(_)) => {
            if raw.matches(',').count() > 1 {
                return None;
            }
            raw.replace(',', ".")
        }
        _ => raw.to_string(),
    };
    normalized
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite() && *v >= 0.0)
}

/// Whole units; fractional quantities are truncated and negative ones clamp to zero.
fn parse_quantity(raw: &str) -> Option<u32> {
    let value = raw.trim().replace(',', ".").parse::<f64>().ok()?;
    if !value.is_finite() {
        return None;
    }
    Some(value.max(0.0).min(u32::MAX as f64) as u32)
}
