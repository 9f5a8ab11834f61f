//! Property listing and market data abstraction.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ServiceResult;

/// A single listing as reported by the data provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PropertyRecord {
    pub id: String,
    #[serde(default)]
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub days_on_market: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bedrooms: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bathrooms: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub square_feet: Option<u32>,
}

/// Aggregate market figures for an area.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MarketStats {
    pub area: String,
    #[serde(default)]
    pub median_price: Option<f64>,
    #[serde(default)]
    pub avg_price_sqft: Option<f64>,
    #[serde(default)]
    pub inventory: Option<f64>,
    #[serde(default)]
    pub avg_days_on_market: Option<f64>,
}

#[async_trait]
pub trait PropertyDataService: Send + Sync {
    /// Look up a listing by provider id. `None` when the provider has no record.
    async fn property_details(&self, property_id: &str) -> ServiceResult<Option<PropertyRecord>>;

    /// Run a listing search. Criteria are provider-defined JSON.
    async fn search_listings(&self, criteria: &Value) -> ServiceResult<Vec<PropertyRecord>>;

    /// Current market statistics for an area.
    async fn market_statistics(&self, area: &str) -> ServiceResult<Option<MarketStats>>;
}
