//! Change detection over buyer-visible source fields.
//!
//! Fingerprints are always taken from [`SourceProduct`]s. Nothing the transform pipeline
//! randomizes can reach the hash, so a noisy re-run never looks like a content change.

use catsync_core::{Fingerprint, FingerprintParts, SourceProduct, SyncRecord};
use catsync_storage::{sha256_hex, SyncState};
use serde::Serialize;

/// Field order is also the sort order, so duplicate keys still hash independently of feed order.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Serialize)]
struct CanonicalVariant<'a> {
    color: Option<&'a str>,
    size: Option<&'a str>,
    price: String,
    stock: u32,
}

/// Field order here is the hash input order and must not change.
#[derive(Debug, Serialize)]
struct CanonicalProduct<'a> {
    price: String,
    stock: u32,
    variants: Vec<CanonicalVariant<'a>>,
    title: &'a str,
    images: Vec<&'a str>,
}

fn money(value: f64) -> String {
    format!("{value:.2}")
}

fn canonical(product: &SourceProduct) -> CanonicalProduct<'_> {
    let mut variants: Vec<CanonicalVariant<'_>> = product
        .variants
        .iter()
        .map(|v| CanonicalVariant {
            color: v.key.color.as_deref(),
            size: v.key.size.as_deref(),
            price: money(v.price.unwrap_or(product.price)),
            stock: v.stock.unwrap_or(product.stock),
        })
        .collect();
    variants.sort_unstable();

    let mut images: Vec<&str> = product.images.iter().map(String::as_str).collect();
    images.sort_unstable();
    images.dedup();

    CanonicalProduct {
        price: money(product.price),
        stock: product.stock,
        variants,
        title: product.title.trim(),
        images,
    }
}

fn digest_of<T: Serialize + ?Sized>(value: &T) -> String {
    // Serializing plain strings, integers and vectors cannot fail.
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    sha256_hex(&bytes)
}

pub fn fingerprint(product: &SourceProduct) -> Fingerprint {
    let canonical = canonical(product);
    let parts = FingerprintParts {
        price: digest_of(&canonical.price),
        stock: digest_of(&canonical.stock),
        variants: digest_of(&canonical.variants),
        title: digest_of(canonical.title),
        images: digest_of(&canonical.images),
    };
    Fingerprint {
        digest: digest_of(&canonical),
        parts: Some(parts),
    }
}

/// Which components moved. All flags are set when the prior record predates part digests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
pub struct ChangeSet {
    pub price: bool,
    pub stock: bool,
    pub variants: bool,
    pub title: bool,
    pub images: bool,
}

impl ChangeSet {
    fn between(old: Option<&FingerprintParts>, new: Option<&FingerprintParts>) -> Self {
        match (old, new) {
            (Some(old), Some(new)) => Self {
                price: old.price != new.price,
                stock: old.stock != new.stock,
                variants: old.variants != new.variants,
                title: old.title != new.title,
                images: old.images != new.images,
            },
            _ => Self {
                price: true,
                stock: true,
                variants: true,
                title: true,
                images: true,
            },
        }
    }

    pub fn labels(&self) -> Vec<&'static str> {
        [
            (self.price, "price"),
            (self.stock, "stock"),
            (self.variants, "variants"),
            (self.title, "title"),
            (self.images, "images"),
        ]
        .into_iter()
        .filter_map(|(set, label)| set.then_some(label))
        .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DiffKind {
    NewProduct,
    Unchanged,
    Changed(ChangeSet),
}

impl DiffKind {
    pub fn needs_push(&self) -> bool {
        !matches!(self, DiffKind::Unchanged)
    }
}

#[derive(Debug, Clone)]
pub struct DiffEntry {
    pub product_id: String,
    pub fingerprint: Fingerprint,
    pub kind: DiffKind,
}

pub fn classify(current: &Fingerprint, prior: Option<&SyncRecord>) -> DiffKind {
    match prior {
        None => DiffKind::NewProduct,
        Some(record) if record.fingerprint.same_content(current) => DiffKind::Unchanged,
        Some(record) => DiffKind::Changed(ChangeSet::between(
            record.fingerprint.parts.as_ref(),
            current.parts.as_ref(),
        )),
    }
}

/// One entry per product, in feed order.
pub fn diff_catalog(products: &[SourceProduct], state: &SyncState) -> Vec<DiffEntry> {
    products
        .iter()
        .map(|product| {
            let fingerprint = fingerprint(product);
            let kind = classify(&fingerprint, state.get(&product.id));
            DiffEntry {
                product_id: product.id.clone(),
                fingerprint,
                kind,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use catsync_core::{SourceVariant, VariantKey};
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn product(id: &str, price: f64, stock: u32) -> SourceProduct {
        SourceProduct {
            id: id.into(),
            title: format!("Product {id}"),
            brand: None,
            category: None,
            price,
            stock,
            currency: None,
            tax_rate: None,
            barcode: None,
            description: None,
            variants: vec![SourceVariant {
                key: VariantKey::new(Some("red".into()), None),
                price: None,
                stock: Some(2),
                barcode: None,
            }],
            images: vec!["https://cdn.example.com/b.jpg".into(), "https://cdn.example.com/a.jpg".into()],
            attributes: BTreeMap::new(),
        }
    }

    fn state_for(products: &[SourceProduct]) -> SyncState {
        let mut state = SyncState::default();
        for p in products {
            state.upsert(
                p.id.clone(),
                SyncRecord {
                    external_id: format!("ext-{}", p.id),
                    fingerprint: fingerprint(p),
                    last_synced_at: Utc::now(),
                    variant_ids: BTreeMap::new(),
                },
            );
        }
        state
    }

    #[test]
    fn fingerprint_ignores_order_and_non_visible_fields() {
        let a = product("P1", 100.0, 5);
        let mut b = a.clone();
        b.images.reverse();
        b.description = Some("<p>changed copy</p>".into());
        b.brand = Some("Other".into());
        b.attributes.insert("Material".into(), "Deri".into());
        assert_eq!(fingerprint(&a), fingerprint(&b));
        assert_eq!(fingerprint(&a).digest.len(), 64);
    }

    #[test]
    fn duplicate_variant_keys_hash_independently_of_feed_order() {
        let mut a = product("P1", 100.0, 5);
        a.variants = vec![
            SourceVariant {
                key: VariantKey::new(Some("red".into()), Some("38".into())),
                price: Some(120.0),
                stock: Some(1),
                barcode: None,
            },
            SourceVariant {
                key: VariantKey::new(Some("red".into()), Some("38".into())),
                price: Some(90.0),
                stock: Some(4),
                barcode: None,
            },
        ];
        let mut b = a.clone();
        b.variants.reverse();
        assert_eq!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn price_change_is_the_only_diff() {
        let before = vec![product("P1", 100.0, 5), product("P2", 50.0, 1), product("P3", 10.0, 0)];
        let state = state_for(&before);

        let mut after = before.clone();
        after[0].price = 110.0;
        let diff = diff_catalog(&after, &state);

        let expected = ChangeSet {
            price: true,
            // P1's variant inherits the product price.
            variants: true,
            ..ChangeSet::default()
        };
        assert_eq!(diff[0].kind, DiffKind::Changed(expected));
        assert!(diff[0].kind.needs_push());
        assert_eq!(diff[1].kind, DiffKind::Unchanged);
        assert_eq!(diff[2].kind, DiffKind::Unchanged);
        assert_eq!(expected.labels(), vec!["price", "variants"]);
    }

    #[test]
    fn unknown_products_are_new() {
        let state = state_for(&[product("P1", 1.0, 1)]);
        let diff = diff_catalog(&[product("P1", 1.0, 1), product("P9", 1.0, 1)], &state);
        assert_eq!(diff[1].kind, DiffKind::NewProduct);
        assert_eq!(diff.iter().map(|d| d.product_id.as_str()).collect::<Vec<_>>(), vec!["P1", "P9"]);
    }

    #[test]
    fn records_without_parts_report_everything_changed() {
        let p = product("P1", 1.0, 1);
        let mut state = state_for(&[p.clone()]);
        if let Some(record) = state.products.get_mut("P1") {
            record.fingerprint = Fingerprint {
                digest: "legacy".into(),
                parts: None,
            };
        }
        let diff = diff_catalog(&[p], &state);
        match &diff[0].kind {
            DiffKind::Changed(changes) => assert_eq!(changes.labels().len(), 5),
            other => panic!("expected changed, got {other:?}"),
        }
    }
}
