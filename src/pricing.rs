//! The pricing table mapping endpoints to prices.
//!
//! Lookup is exact-match on the `"METHOD path"` endpoint identifier; path
//! parameters are not wildcarded. Paths absent from the table are unpriced
//! and bypass payment enforcement entirely. The table is immutable after
//! construction and shared read-only across request workers.

use std::collections::BTreeMap;

use crate::money::{InvalidAmount, MoneyAmount};
use crate::types::{DiscoveryEndpoint, TokenDescriptor};

/// One priced endpoint: display price plus optional metadata.
#[derive(Debug, Clone)]
pub struct PriceEntry {
    /// Display-unit decimal price, e.g. `"0.005"`.
    pub price: String,
    pub description: Option<String>,
    /// Token override for this endpoint; `None` uses the gateway token.
    pub token: Option<TokenDescriptor>,
}

impl PriceEntry {
    pub fn new(price: impl Into<String>) -> Self {
        PriceEntry {
            price: price.into(),
            description: None,
            token: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_token(mut self, token: TokenDescriptor) -> Self {
        self.token = Some(token);
        self
    }
}

/// Builds the canonical endpoint identifier, `"METHOD path"`.
pub fn endpoint_key(method: &str, path: &str) -> String {
    format!("{} {}", method.to_ascii_uppercase(), path)
}

/// Immutable map from endpoint identifier to [`PriceEntry`].
#[derive(Debug, Clone, Default)]
pub struct PricingTable {
    entries: BTreeMap<String, PriceEntry>,
}

impl PricingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a priced endpoint. The key must already be in `"METHOD path"`
    /// form, e.g. via [`endpoint_key`].
    pub fn with_price(mut self, endpoint: impl Into<String>, entry: PriceEntry) -> Self {
        self.entries.insert(endpoint.into(), entry);
        self
    }

    /// Checks that every price in the table parses as a positive decimal.
    ///
    /// Run once at construction so malformed configuration fails at startup
    /// instead of on the first paid request.
    pub fn validate(&self) -> Result<(), InvalidAmount> {
        for entry in self.entries.values() {
            MoneyAmount::parse(&entry.price)?;
        }
        Ok(())
    }

    /// Exact-match lookup. Unlisted endpoints are unpriced.
    pub fn lookup(&self, endpoint: &str) -> Option<&PriceEntry> {
        self.entries.get(endpoint)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Renders the table into discovery-document endpoint entries.
    pub fn discovery_endpoints(&self) -> Vec<DiscoveryEndpoint> {
        self.entries
            .iter()
            .map(|(endpoint, entry)| {
                let (method, path) = endpoint
                    .split_once(' ')
                    .unwrap_or(("GET", endpoint.as_str()));
                DiscoveryEndpoint {
                    method: method.to_string(),
                    path: path.to_string(),
                    price: entry.price.clone(),
                    description: entry.description.clone(),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> PricingTable {
        PricingTable::new()
            .with_price(
                endpoint_key("post", "/api/chat"),
                PriceEntry::new("0.005").with_description("Chat completion"),
            )
            .with_price(endpoint_key("GET", "/api/scrape"), PriceEntry::new("0.01"))
    }

    #[test]
    fn test_exact_match_lookup() {
        let table = table();
        assert!(table.lookup("POST /api/chat").is_some());
        assert!(table.lookup("GET /api/scrape").is_some());
        // No wildcarding, no method coercion at lookup time.
        assert!(table.lookup("POST /api/chat/extra").is_none());
        assert!(table.lookup("GET /api/chat").is_none());
        assert!(table.lookup("GET /public").is_none());
    }

    #[test]
    fn test_endpoint_key_uppercases_method() {
        assert_eq!(endpoint_key("post", "/api/chat"), "POST /api/chat");
    }

    #[test]
    fn test_validate_rejects_malformed_price() {
        let table = PricingTable::new()
            .with_price("GET /bad", PriceEntry::new("free"));
        assert!(table.validate().is_err());
        assert!(self::table().validate().is_ok());
    }

    #[test]
    fn test_discovery_endpoints() {
        let endpoints = table().discovery_endpoints();
        assert_eq!(endpoints.len(), 2);
        let chat = endpoints
            .iter()
            .find(|e| e.path == "/api/chat")
            .unwrap();
        assert_eq!(chat.method, "POST");
        assert_eq!(chat.price, "0.005");
        assert_eq!(chat.description.as_deref(), Some("Chat completion"));
    }
}
