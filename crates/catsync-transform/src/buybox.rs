//! Marketplace-facing noise applied on top of the converted catalog.
//!
//! Title prefixes, description markers and image tokens are drawn from the run's random
//! source and change every run. The synthetic brand never does, and the category
//! subsegment only does when `category_selection` is `per_run`.

use rand::distributions::Alphanumeric;
use rand::seq::SliceRandom;
use rand::Rng;
use sha2::{Digest, Sha256};
use url::Url;

use crate::CategorySelection;

const HIDDEN_OPEN: &str = "<p style=\"display:none;\">";
pub const IMAGE_TOKEN_PARAM: &str = "rnd";

pub fn random_token<R: Rng + ?Sized>(rng: &mut R, len: usize) -> String {
    (0..len).map(|_| char::from(rng.sample(Alphanumeric))).collect()
}

/// Drops a `"<Pool>-<token> | "` prefix left by an earlier run.
pub fn strip_title_prefix<'a>(title: &'a str, pool: &[String]) -> &'a str {
    let Some((head, rest)) = title.split_once(" | ") else {
        return title;
    };
    let Some((word, token)) = head.split_once('-') else {
        return title;
    };
    let looks_generated = pool.iter().any(|p| p == word)
        && !token.is_empty()
        && token.chars().all(|c| c.is_ascii_alphanumeric());
    if looks_generated {
        rest
    } else {
        title
    }
}

pub fn prefix_title<R: Rng + ?Sized>(rng: &mut R, title: &str, pool: &[String]) -> String {
    let base = strip_title_prefix(title, pool);
    match pool.choose(rng) {
        Some(word) => format!("{word}-{} | {base}", random_token(rng, 4)),
        None => base.to_string(),
    }
}

/// Inserts a subcategory before the last segment of a `>`-separated path.
pub fn obfuscate_category<R: Rng + ?Sized>(
    rng: &mut R,
    product_id: &str,
    category: &str,
    pool: &[String],
    selection: CategorySelection,
) -> String {
    let mut parts: Vec<&str> = category
        .split('>')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect();
    if parts.len() < 2 || pool.is_empty() {
        return category.to_string();
    }
    let pick = match selection {
        CategorySelection::Stable => {
            let idx = (stable_u64(product_id) % pool.len() as u64) as usize;
            pool[idx].as_str()
        }
        CategorySelection::PerRun => pool[rng.gen_range(0..pool.len())].as_str(),
    };
    parts.insert(parts.len() - 1, pick);
    parts.join(" > ")
}

/// `<stem>-<4 hex>` where the suffix depends only on the product id and the stem.
pub fn synthetic_brand(product_id: &str, stem: &str) -> String {
    let digest = hex::encode(Sha256::digest(format!("{product_id}:{stem}").as_bytes()));
    format!("{stem}-{}", digest[..4].to_ascii_uppercase())
}

/// Appends a hidden `<label>-<token>` paragraph, replacing any earlier one.
pub fn mark_description<R: Rng + ?Sized>(rng: &mut R, description: &str, label: &str) -> String {
    let visible = description
        .split_once(HIDDEN_OPEN)
        .map_or(description, |(head, _)| head);
    format!("{visible}{HIDDEN_OPEN}{label}-{}</p>", random_token(rng, 16))
}

/// Replaces the `rnd` query parameter with a fresh token. Other parameters are kept in order.
/// Relative or scheme-less references are rewritten as plain strings, so every image survives.
pub fn sanitize_image_url<R: Rng + ?Sized>(rng: &mut R, raw: &str) -> String {
    let token = random_token(rng, 8);
    match Url::parse(raw) {
        Ok(url) => with_token(url, &token),
        Err(_) => with_token_raw(raw, &token),
    }
}

fn with_token(mut url: Url, token: &str) -> String {
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| *k != IMAGE_TOKEN_PARAM)
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    url.set_query(None);
    {
        let mut query = url.query_pairs_mut();
        for (k, v) in &kept {
            query.append_pair(k, v);
        }
        query.append_pair(IMAGE_TOKEN_PARAM, token);
    }
    url.into()
}

fn with_token_raw(raw: &str, token: &str) -> String {
    let (base, fragment) = match raw.split_once('#') {
        Some((base, fragment)) => (base, Some(fragment)),
        None => (raw, None),
    };
    let (path, query) = base.split_once('?').unwrap_or((base, ""));
    let mut params: Vec<String> = query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .filter(|pair| pair.split('=').next() != Some(IMAGE_TOKEN_PARAM))
        .map(ToString::to_string)
        .collect();
    params.push(format!("{IMAGE_TOKEN_PARAM}={token}"));

    let mut out = format!("{path}?{}", params.join("&"));
    if let Some(fragment) = fragment {
        out.push('#');
        out.push_str(fragment);
    }
    out
}

fn stable_u64(value: &str) -> u64 {
    let digest = Sha256::digest(value.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}
