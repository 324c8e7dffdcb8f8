//! Product catalog service
//!
//! A bus participant that answers catalog requests from an in-memory product
//! list. Every request gets a reply: malformed or unknown commands are answered
//! with an error payload rather than dropped.

use std::future::Future;
use std::path::Path;

use super::messages::{CatalogRequest, CatalogResponse, Filters, Product, Variation};
use super::{CatalogError, CatalogResult};
use crate::network::{BusClient, BusError, BusEvent, BusResult, LoopExit};
use crate::protocol::MAX_BODY_LEN;

/// Answers catalog commands
#[derive(Debug, Clone, Default)]
pub struct CatalogService {
    products: Vec<Product>,
}

impl CatalogService {
    pub fn new(products: Vec<Product>) -> Self {
        Self { products }
    }

    /// Load the product list from a JSON array on disk
    pub fn load(path: &Path) -> CatalogResult<Self> {
        let contents = std::fs::read(path)?;
        let products: Vec<Product> = serde_json::from_slice(&contents)?;
        tracing::info!("Loaded {} products from {}", products.len(), path.display());
        Ok(Self::new(products))
    }

    pub fn products(&self) -> &[Product] {
        &self.products
    }

    /// Handle one raw request body
    pub fn handle(&self, body: &[u8]) -> CatalogResponse {
        let request = match CatalogRequest::from_body(body) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!("Rejecting request: {}", e);
                return CatalogResponse::error(e.to_string());
            }
        };

        tracing::debug!("Command: {:?}", request);

        match self.execute(&request) {
            Ok(data) => CatalogResponse::Success { data },
            Err(e) => CatalogResponse::error(e.to_string()),
        }
    }

    /// Handle one raw request and encode the reply for the wire
    ///
    /// A reply that would not fit in a single frame is replaced by an error
    /// payload, so the requester always hears back.
    pub fn reply(&self, body: &[u8]) -> CatalogResult<Vec<u8>> {
        let encoded = self.handle(body).to_body()?;
        if encoded.len() <= MAX_BODY_LEN {
            return Ok(encoded);
        }

        tracing::warn!(
            "Reply of {} bytes exceeds the {} byte frame limit",
            encoded.len(),
            MAX_BODY_LEN
        );
        CatalogResponse::error(format!(
            "response too large ({} bytes, max {}); narrow the query with buscar or filtrar",
            encoded.len(),
            MAX_BODY_LEN
        ))
        .to_body()
    }

    pub fn execute(&self, request: &CatalogRequest) -> CatalogResult<Vec<Product>> {
        match request {
            CatalogRequest::VerCatalogo => Ok(self.products.clone()),
            CatalogRequest::Buscar { termino } => self.search(termino),
            CatalogRequest::Filtrar { filtros } => self.filter(filtros),
        }
    }

    /// Case-insensitive search across product text and variation attributes
    pub fn search(&self, term: &str) -> CatalogResult<Vec<Product>> {
        let term = term.trim().to_lowercase();
        if term.is_empty() {
            return Err(CatalogError::InvalidArgument(
                "search term must not be empty".to_string(),
            ));
        }

        Ok(self
            .products
            .iter()
            .filter(|p| product_matches_term(p, &term))
            .cloned()
            .collect())
    }

    /// Product-level filters plus variation filters
    ///
    /// A product matches when at least one of its variations satisfies every
    /// variation filter at once.
    pub fn filter(&self, filters: &Filters) -> CatalogResult<Vec<Product>> {
        let min = parse_price("precio_min", filters.precio_min.as_deref())?;
        let max = parse_price("precio_max", filters.precio_max.as_deref())?;
        let color = lowered(filters.color.as_deref());
        let talla = lowered(filters.talla.as_deref());
        let marca = lowered(filters.marca.as_deref());
        let categoria = lowered(filters.categoria.as_deref());

        let has_variation_filter =
            color.is_some() || talla.is_some() || min.is_some() || max.is_some();

        let variation_ok = |v: &Variation| {
            color
                .as_deref()
                .map_or(true, |c| contains(v.color.as_deref(), c))
                && talla
                    .as_deref()
                    .map_or(true, |t| contains(v.talla.as_deref(), t))
                && min.map_or(true, |m| v.precio >= m)
                && max.map_or(true, |m| v.precio <= m)
        };

        Ok(self
            .products
            .iter()
            .filter(|p| marca.as_deref().map_or(true, |m| contains(Some(p.marca.as_str()), m)))
            .filter(|p| {
                categoria
                    .as_deref()
                    .map_or(true, |c| contains(Some(p.categoria.as_str()), c))
            })
            .filter(|p| !has_variation_filter || p.variaciones.iter().any(|v| variation_ok(v)))
            .cloned()
            .collect())
    }

    /// Answer requests arriving on `client` until the link drops or `shutdown` resolves
    pub async fn serve<S>(&self, mut client: BusClient, shutdown: S) -> BusResult<LoopExit>
    where
        S: Future<Output = ()>,
    {
        let mut messages = client.take_message_receiver().ok_or(BusError::NotConnected)?;
        let mut events = client.take_event_receiver().ok_or(BusError::NotConnected)?;
        tokio::pin!(shutdown);

        tracing::info!("Catalog service '{}' waiting for requests", client.address());

        loop {
            tokio::select! {
                Some(frame) = messages.recv() => {
                    tracing::info!("Request from '{}'", frame.address);
                    let body = match self.reply(&frame.body) {
                        Ok(body) => body,
                        Err(e) => {
                            tracing::error!("Failed to encode reply: {}", e);
                            continue;
                        }
                    };
                    if let Err(e) = client.send(&frame.address, &body).await {
                        tracing::error!("Reply to '{}' failed: {}", frame.address, e);
                        if e.is_link_lost() {
                            break;
                        }
                    }
                }
                Some(event) = events.recv() => {
                    match event {
                        BusEvent::Registered { .. } => {
                            tracing::info!("Catalog service registered as '{}'", client.address());
                        }
                        BusEvent::Error { message } => {
                            tracing::error!("Bus error: {}", message);
                        }
                        BusEvent::Disconnected { reason } => {
                            tracing::warn!("Disconnected from bus: {}", reason);
                            break;
                        }
                    }
                }
                _ = &mut shutdown => {
                    tracing::info!("Catalog service shutting down");
                    break;
                }
            }
        }

        client.shutdown().await
    }
}

fn lowered(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_lowercase)
}

fn contains(haystack: Option<&str>, needle_lower: &str) -> bool {
    haystack.is_some_and(|h| h.to_lowercase().contains(needle_lower))
}

fn parse_price(field: &str, value: Option<&str>) -> CatalogResult<Option<f64>> {
    match value.map(str::trim).filter(|v| !v.is_empty()) {
        None => Ok(None),
        Some(v) => v
            .parse::<f64>()
            .map(Some)
            .map_err(|_| {
                CatalogError::InvalidArgument(format!("{} is not a number: {:?}", field, v))
            }),
    }
}

fn product_matches_term(product: &Product, term: &str) -> bool {
    contains(Some(product.nombre.as_str()), term)
        || contains(Some(product.marca.as_str()), term)
        || contains(Some(product.categoria.as_str()), term)
        || contains(product.descripcion.as_deref(), term)
        || product.tags.iter().any(|t| contains(Some(t.as_str()), term))
        || product.variaciones.iter().any(|v| {
            contains(v.color.as_deref(), term) || contains(v.talla.as_deref(), term)
        })
}
