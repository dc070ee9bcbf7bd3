//! Storefront API surface and its Shopify Admin REST implementation.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use catsync_core::{TargetProduct, TargetVariant};
use catsync_storage::{classify_reqwest_error, retry_after_from_headers, RetryDisposition};
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

const MAX_ERROR_BODY: usize = 512;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum StorefrontError {
    #[error("network error: {0}")]
    Network(String),
    #[error("rate limited by storefront (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },
    #[error("storefront server error {status}")]
    Server { status: u16 },
    #[error("storefront rejected the request ({status}): {message}")]
    Api { status: u16, message: String },
    #[error("unexpected storefront response: {0}")]
    Decode(String),
}

impl StorefrontError {
    /// Network trouble, 5xx and 429 are worth another attempt. Everything else is final.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::RateLimited { .. } | Self::Server { .. }
        )
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImagePayload {
    pub src: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OptionPayload {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VariantPayload {
    pub sku: String,
    pub price: String,
    pub inventory_quantity: u32,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub barcode: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub option1: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub option2: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProductPayload {
    pub title: String,
    pub body_html: String,
    pub vendor: String,
    pub product_type: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    pub images: Vec<ImagePayload>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<OptionPayload>,
    pub variants: Vec<VariantPayload>,
}

impl ProductPayload {
    /// A product without variants is pushed with one default variant carrying its SKU.
    pub fn from_target(product: &TargetProduct) -> Self {
        let has_color = product.variants.iter().any(|v| v.key.color.is_some());
        let has_size = product.variants.iter().any(|v| v.key.size.is_some());

        let mut options = Vec::new();
        if has_color {
            options.push(OptionPayload { name: "Renk".into() });
        }
        if has_size {
            options.push(OptionPayload { name: "Beden".into() });
        }

        let variants = if product.variants.is_empty() {
            vec![VariantPayload {
                sku: product.id.clone(),
                price: format!("{:.2}", product.price),
                inventory_quantity: product.stock,
                barcode: product.barcode.clone(),
                option1: None,
                option2: None,
            }]
        } else {
            product
                .variants
                .iter()
                .map(|v| variant_payload(v, has_color))
                .collect()
        };

        let product_type = product
            .category
            .rsplit('>')
            .next()
            .map(str::trim)
            .unwrap_or_default()
            .to_string();

        Self {
            title: product.title.clone(),
            body_html: product.description.clone(),
            vendor: product.brand.clone(),
            product_type,
            tags: product.bullets.clone(),
            images: product
                .images
                .iter()
                .map(|src| ImagePayload { src: src.clone() })
                .collect(),
            options,
            variants,
        }
    }
}

fn variant_payload(variant: &TargetVariant, has_color: bool) -> VariantPayload {
    let (option1, option2) = if has_color {
        (variant.key.color.clone(), variant.key.size.clone())
    } else {
        (variant.key.size.clone(), None)
    };
    VariantPayload {
        sku: variant.code.clone(),
        price: format!("{:.2}", variant.price),
        inventory_quantity: variant.stock,
        barcode: variant.barcode.clone(),
        option1,
        option2,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RemoteVariant {
    pub id: String,
    pub sku: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RemoteProduct {
    pub id: String,
    pub variants: Vec<RemoteVariant>,
}

#[async_trait]
pub trait StorefrontApi: Send + Sync {
    async fn create_product(&self, product: &ProductPayload) -> Result<RemoteProduct, StorefrontError>;

    async fn update_product(
        &self,
        external_id: &str,
        product: &ProductPayload,
    ) -> Result<RemoteProduct, StorefrontError>;

    async fn create_variant(
        &self,
        external_id: &str,
        variant: &VariantPayload,
    ) -> Result<RemoteVariant, StorefrontError>;

    async fn update_variant(
        &self,
        variant_id: &str,
        variant: &VariantPayload,
    ) -> Result<RemoteVariant, StorefrontError>;
}

/// Shopify Admin REST client. Each call is a single attempt; retries belong to the caller.
#[derive(Debug, Clone)]
pub struct ShopifyClient {
    client: reqwest::Client,
    base_url: String,
    access_token: String,
}

#[derive(Serialize)]
struct ProductEnvelope<'a, T: Serialize> {
    product: &'a T,
}

#[derive(Serialize)]
struct VariantEnvelope<'a> {
    variant: &'a VariantPayload,
}

/// Product fields sent on update. Variants are updated one by one so their ids survive.
#[derive(Serialize)]
struct ProductUpdate<'a> {
    id: &'a str,
    title: &'a str,
    body_html: &'a str,
    vendor: &'a str,
    product_type: &'a str,
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    tags: &'a [String],
    images: &'a [ImagePayload],
}

impl ShopifyClient {
    pub fn new(
        shop_domain: &str,
        api_version: &str,
        access_token: &str,
        timeout: Duration,
        user_agent: &str,
    ) -> anyhow::Result<Self> {
        let domain = shop_domain
            .trim()
            .trim_start_matches("https://")
            .trim_end_matches('/');
        Self::with_base_url(
            format!("https://{domain}/admin/api/{api_version}"),
            access_token,
            timeout,
            user_agent,
        )
    }

    pub fn with_base_url(
        base_url: impl Into<String>,
        access_token: &str,
        timeout: Duration,
        user_agent: &str,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()
            .context("building storefront http client")?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            access_token: access_token.to_string(),
        })
    }

    async fn send<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: &B,
    ) -> Result<Value, StorefrontError> {
        let url = format!("{}/{path}", self.base_url);
        debug!(%method, %url, "storefront request");
        let resp = self
            .client
            .request(method, &url)
            .header("X-Shopify-Access-Token", &self.access_token)
            .json(body)
            .send()
            .await
            .map_err(|err| match classify_reqwest_error(&err) {
                RetryDisposition::Retryable => StorefrontError::Network(err.to_string()),
                RetryDisposition::NonRetryable => StorefrontError::Decode(err.to_string()),
            })?;

        let status = resp.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(StorefrontError::RateLimited {
                retry_after: retry_after_from_headers(resp.headers()),
            });
        }
        if status.is_server_error() {
            return Err(StorefrontError::Server {
                status: status.as_u16(),
            });
        }

        let text = resp
            .text()
            .await
            .map_err(|err| StorefrontError::Network(err.to_string()))?;
        if !status.is_success() {
            let mut message = text;
            if message.len() > MAX_ERROR_BODY {
                let mut cut = MAX_ERROR_BODY;
                while !message.is_char_boundary(cut) {
                    cut -= 1;
                }
                message.truncate(cut);
            }
            return Err(StorefrontError::Api {
                status: status.as_u16(),
                message,
            });
        }
        serde_json::from_str(&text).map_err(|err| StorefrontError::Decode(err.to_string()))
    }
}

/// Shopify ids arrive as JSON numbers; fakes and older API versions may send strings.
fn id_string(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

fn decode_variant(value: &Value) -> Result<RemoteVariant, StorefrontError> {
    let id = id_string(value.get("id"))
        .ok_or_else(|| StorefrontError::Decode("variant without id".to_string()))?;
    let sku = value
        .get("sku")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    Ok(RemoteVariant { id, sku })
}

fn decode_product(body: &Value) -> Result<RemoteProduct, StorefrontError> {
    let product = body
        .get("product")
        .ok_or_else(|| StorefrontError::Decode("missing `product` object".to_string()))?;
    let id = id_string(product.get("id"))
        .ok_or_else(|| StorefrontError::Decode("product without id".to_string()))?;
    let variants = product
        .get("variants")
        .and_then(Value::as_array)
        .map(|list| list.iter().map(decode_variant).collect::<Result<Vec<_>, _>>())
        .transpose()?
        .unwrap_or_default();
    Ok(RemoteProduct { id, variants })
}

fn decode_variant_envelope(body: &Value) -> Result<RemoteVariant, StorefrontError> {
    let variant = body
        .get("variant")
        .ok_or_else(|| StorefrontError::Decode("missing `variant` object".to_string()))?;
    decode_variant(variant)
}

#[async_trait]
impl StorefrontApi for ShopifyClient {
    async fn create_product(&self, product: &ProductPayload) -> Result<RemoteProduct, StorefrontError> {
        let body = self
            .send(Method::POST, "products.json", &ProductEnvelope { product })
            .await?;
        decode_product(&body)
    }

    async fn update_product(
        &self,
        external_id: &str,
        product: &ProductPayload,
    ) -> Result<RemoteProduct, StorefrontError> {
        let update = ProductUpdate {
            id: external_id,
            title: &product.title,
            body_html: &product.body_html,
            vendor: &product.vendor,
            product_type: &product.product_type,
            tags: &product.tags,
            images: &product.images,
        };
        let body = self
            .send(
                Method::PUT,
                &format!("products/{external_id}.json"),
                &ProductEnvelope { product: &update },
            )
            .await?;
        decode_product(&body)
    }

    async fn create_variant(
        &self,
        external_id: &str,
        variant: &VariantPayload,
    ) -> Result<RemoteVariant, StorefrontError> {
        let body = self
            .send(
                Method::POST,
                &format!("products/{external_id}/variants.json"),
                &VariantEnvelope { variant },
            )
            .await?;
        decode_variant_envelope(&body)
    }

    async fn update_variant(
        &self,
        variant_id: &str,
        variant: &VariantPayload,
    ) -> Result<RemoteVariant, StorefrontError> {
        let body = self
            .send(
                Method::PUT,
                &format!("variants/{variant_id}.json"),
                &VariantEnvelope { variant },
            )
            .await?;
        decode_variant_envelope(&body)
    }
}
