use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Orders,
    Customers,
    Products,
    AdInsights,
}

impl EntityType {
    pub const ALL: [EntityType; 4] = [
        EntityType::Orders,
        EntityType::Customers,
        EntityType::Products,
        EntityType::AdInsights,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Orders => "orders",
            Self::Customers => "customers",
            Self::Products => "products",
            Self::AdInsights => "ad_insights",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "orders" => Ok(Self::Orders),
            "customers" => Ok(Self::Customers),
            "products" => Ok(Self::Products),
            "ad_insights" => Ok(Self::AdInsights),
            _ => Err(format!("unknown entity type: {value}")),
        }
    }
}

/// Coarseness of a time-series row.
///
/// For a given `(connection, entity_type, date)` slot, a `Granular` row
/// dominates: no `Aggregate` row may be stored alongside it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    Aggregate,
    Granular,
}

impl Granularity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Aggregate => "aggregate",
            Self::Granular => "granular",
        }
    }
}

impl FromStr for Granularity {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "aggregate" => Ok(Self::Aggregate),
            "granular" => Ok(Self::Granular),
            _ => Err(format!("unknown granularity: {value}")),
        }
    }
}

/// A platform record as persisted, keyed by `(connection_id, entity_type, natural_key)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredRecord {
    pub connection_id: Uuid,
    pub entity_type: EntityType,
    pub natural_key: String,
    pub record_date: Option<NaiveDate>,
    pub granularity: Option<Granularity>,
    pub payload: serde_json::Value,
    pub synced_at: DateTime<Utc>,
}
