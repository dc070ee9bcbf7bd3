use std::collections::HashSet;

use catsync_core::VariantKey;
use sha2::{Digest, Sha256};

use crate::TransformError;

pub const MIN_BARCODE_LENGTH: usize = 8;
const MAX_BARCODE_LENGTH: usize = 32;
const MAX_DISAMBIGUATION_ATTEMPTS: u32 = 10_000;

/// Hands out synthetic barcodes that are unique within one generated catalog.
///
/// The first candidate for `(product_id, variant_key)` depends only on those two values and
/// the prefix. When it is already taken, `#1`, `#2`, ... are appended to the hash input until
/// a free code turns up, so the outcome is a pure function of the allocation order.
#[derive(Debug, Clone)]
pub struct BarcodeAllocator {
    prefix: String,
    length: usize,
    capacity: u64,
    used: HashSet<String>,
}

impl BarcodeAllocator {
    pub fn new(prefix: &str, length: usize) -> Result<Self, TransformError> {
        if !prefix.chars().all(|c| c.is_ascii_digit()) {
            return Err(TransformError::InvalidConfig(format!(
                "barcode_prefix must contain only digits, got {prefix:?}"
            )));
        }
        if !(MIN_BARCODE_LENGTH..=MAX_BARCODE_LENGTH).contains(&length) {
            return Err(TransformError::InvalidConfig(format!(
                "barcode_length must be between {MIN_BARCODE_LENGTH} and {MAX_BARCODE_LENGTH}, got {length}"
            )));
        }
        if prefix.len() >= length {
            return Err(TransformError::InvalidConfig(format!(
                "barcode_prefix {prefix:?} leaves no room in a {length}-digit barcode"
            )));
        }

        // Digits left between the prefix and the check digit.
        let free = (length - 1).saturating_sub(prefix.len()) as u32;
        let capacity = 10u64.checked_pow(free).unwrap_or(u64::MAX);

        Ok(Self {
            prefix: prefix.to_string(),
            length,
            capacity,
            used: HashSet::new(),
        })
    }

    pub fn allocated(&self) -> usize {
        self.used.len()
    }

    pub fn allocate(&mut self, product_id: &str, key: &VariantKey) -> Result<String, TransformError> {
        if self.used.len() as u64 >= self.capacity {
            return Err(self.exhausted(product_id, key));
        }
        for attempt in 0..MAX_DISAMBIGUATION_ATTEMPTS {
            let candidate = synthesize(&self.prefix, self.length, product_id, key, attempt);
            if self.used.insert(candidate.clone()) {
                if attempt > 0 {
                    tracing::debug!(product_id, variant = %key, attempt, "barcode collision resolved");
                }
                return Ok(candidate);
            }
        }
        Err(self.exhausted(product_id, key))
    }

    fn exhausted(&self, product_id: &str, key: &VariantKey) -> TransformError {
        TransformError::BarcodeSpaceExhausted {
            product_id: product_id.to_string(),
            variant: key.to_string(),
            prefix: self.prefix.clone(),
            length: self.length,
        }
    }
}

/// The `attempt`-th candidate barcode for a product/variant pair.
pub fn synthesize(prefix: &str, length: usize, product_id: &str, key: &VariantKey, attempt: u32) -> String {
    let mut input = format!("{product_id}|{}", key.canonical());
    if attempt > 0 {
        input.push_str(&format!("#{attempt}"));
    }
    let digest = hex::encode(Sha256::digest(input.as_bytes()));

    let mut body: String = prefix.to_string();
    body.extend(
        digest
            .chars()
            .filter_map(|c| c.to_digit(16))
            .map(|d| char::from(b'0' + (d % 10) as u8)),
    );
    body.truncate(length - 1);
    while body.len() < length - 1 {
        body.insert(0, '0');
    }

    let check = check_digit(&body);
    body.push(check);
    body
}

/// EAN style check digit: every second digit from the left weighs 3.
pub fn check_digit(body: &str) -> char {
    let total: u32 = body
        .chars()
        .filter_map(|c| c.to_digit(10))
        .enumerate()
        .map(|(idx, n)| if idx % 2 == 1 { n * 3 } else { n })
        .sum();
    char::from(b'0' + ((10 - total % 10) % 10) as u8)
}
