//! Typed views over raw platform records.
//!
//! Each entity type has a record struct that names the fields needed to derive
//! its natural key. Decoding validates those fields; the raw JSON is kept as the
//! stored payload so vendor-specific fields survive untouched.

use chrono::{DateTime, NaiveDate, Utc};
use serde::de::{DeserializeOwned, Error as _};
use serde::{Deserialize, Deserializer};
use uuid::Uuid;

use lumen_db::records::models::{EntityType, Granularity, StoredRecord};

/// Vendor-assigned identity of a record. Time-series rows also carry their day.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NaturalKey {
    pub date: Option<NaiveDate>,
    pub entity_id: String,
}

impl NaturalKey {
    pub fn id(entity_id: impl Into<String>) -> Self {
        Self {
            date: None,
            entity_id: entity_id.into(),
        }
    }

    pub fn dated(date: NaiveDate, entity_id: impl Into<String>) -> Self {
        Self {
            date: Some(date),
            entity_id: entity_id.into(),
        }
    }

    /// Storage form: `entity_id`, or `YYYY-MM-DD:entity_id` for dated keys.
    pub fn encode(&self) -> String {
        match self.date {
            Some(date) => format!("{date}:{}", self.entity_id),
            None => self.entity_id.clone(),
        }
    }
}

pub trait RemoteRecord: DeserializeOwned {
    const ENTITY_TYPE: EntityType;

    fn natural_key(&self) -> NaturalKey;

    fn granularity(&self) -> Option<Granularity> {
        None
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrderRecord {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub total_price: Option<String>,
    #[serde(default)]
    pub currency: Option<String>,
}

impl RemoteRecord for OrderRecord {
    const ENTITY_TYPE: EntityType = EntityType::Orders;

    fn natural_key(&self) -> NaturalKey {
        NaturalKey::id(&self.id)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CustomerRecord {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl RemoteRecord for CustomerRecord {
    const ENTITY_TYPE: EntityType = EntityType::Customers;

    fn natural_key(&self) -> NaturalKey {
        NaturalKey::id(&self.id)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProductRecord {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

impl RemoteRecord for ProductRecord {
    const ENTITY_TYPE: EntityType = EntityType::Products;

    fn natural_key(&self) -> NaturalKey {
        NaturalKey::id(&self.id)
    }
}

/// Reporting level of an insights row. `Ad` is the leaf; every other level
/// sums the ads beneath it, so a feed mixing levels must not add them up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InsightLevel {
    Account,
    Campaign,
    Adset,
    Ad,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(try_from = "RawAdInsight")]
pub struct AdInsightRecord {
    pub date: NaiveDate,
    pub level: InsightLevel,
    /// Id of the object at `level` (account, campaign, ad set or ad).
    pub entity_id: String,
    pub spend: Option<String>,
    pub impressions: Option<i64>,
}

#[derive(Deserialize)]
struct RawAdInsight {
    date_start: NaiveDate,
    level: InsightLevel,
    #[serde(deserialize_with = "string_or_number")]
    account_id: String,
    #[serde(default, deserialize_with = "opt_string_or_number")]
    campaign_id: Option<String>,
    #[serde(default, deserialize_with = "opt_string_or_number")]
    adset_id: Option<String>,
    #[serde(default, deserialize_with = "opt_string_or_number")]
    ad_id: Option<String>,
    #[serde(default, deserialize_with = "opt_string_or_number")]
    spend: Option<String>,
    #[serde(default, deserialize_with = "opt_int_or_string")]
    impressions: Option<i64>,
}

impl TryFrom<RawAdInsight> for AdInsightRecord {
    type Error = String;

    fn try_from(raw: RawAdInsight) -> Result<Self, Self::Error> {
        let entity_id = match raw.level {
            InsightLevel::Account => Some(raw.account_id),
            InsightLevel::Campaign => raw.campaign_id,
            InsightLevel::Adset => raw.adset_id,
            InsightLevel::Ad => raw.ad_id,
        }
        .ok_or_else(|| format!("insight at level {:?} is missing its object id", raw.level))?;

        Ok(Self {
            date: raw.date_start,
            level: raw.level,
            entity_id,
            spend: raw.spend,
            impressions: raw.impressions,
        })
    }
}

impl RemoteRecord for AdInsightRecord {
    const ENTITY_TYPE: EntityType = EntityType::AdInsights;

    fn natural_key(&self) -> NaturalKey {
        NaturalKey::dated(self.date, &self.entity_id)
    }

    fn granularity(&self) -> Option<Granularity> {
        Some(match self.level {
            InsightLevel::Ad => Granularity::Granular,
            InsightLevel::Account | InsightLevel::Campaign | InsightLevel::Adset => {
                Granularity::Aggregate
            }
        })
    }
}

/// A decoded record ready for the writer.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedRecord {
    pub entity_type: EntityType,
    pub key: NaturalKey,
    pub granularity: Option<Granularity>,
    pub payload: serde_json::Value,
}

impl FetchedRecord {
    pub fn into_stored(self, connection_id: Uuid, synced_at: DateTime<Utc>) -> StoredRecord {
        StoredRecord {
            connection_id,
            entity_type: self.entity_type,
            natural_key: self.key.encode(),
            record_date: self.key.date,
            granularity: self.granularity,
            payload: self.payload,
            synced_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cannot decode {entity_type} record: {reason}")]
pub struct DecodeError {
    pub entity_type: EntityType,
    pub reason: String,
}

pub fn decode_as<R: RemoteRecord>(value: serde_json::Value) -> Result<FetchedRecord, DecodeError> {
    let record = R::deserialize(&value).map_err(|e| DecodeError {
        entity_type: R::ENTITY_TYPE,
        reason: e.to_string(),
    })?;
    Ok(FetchedRecord {
        entity_type: R::ENTITY_TYPE,
        key: record.natural_key(),
        granularity: record.granularity(),
        payload: value,
    })
}

/// Decode one raw record of `entity_type`.
pub fn decode(entity_type: EntityType, value: serde_json::Value) -> Result<FetchedRecord, DecodeError> {
    match entity_type {
        EntityType::Orders => decode_as::<OrderRecord>(value),
        EntityType::Customers => decode_as::<CustomerRecord>(value),
        EntityType::Products => decode_as::<ProductRecord>(value),
        EntityType::AdInsights => decode_as::<AdInsightRecord>(value),
    }
}

/// Decode one NDJSON line.
pub fn decode_line(entity_type: EntityType, line: &[u8]) -> Result<FetchedRecord, DecodeError> {
    let value: serde_json::Value = serde_json::from_slice(line).map_err(|e| DecodeError {
        entity_type,
        reason: e.to_string(),
    })?;
    decode(entity_type, value)
}

fn string_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) if !s.trim().is_empty() => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(D::Error::custom(format!("expected a string or numeric id, got {other}"))),
    }
}

pub(crate) fn opt_string_or_number<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<String>, D::Error> {
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::Null => Ok(None),
        serde_json::Value::String(s) => Ok(Some(s)),
        serde_json::Value::Number(n) => Ok(Some(n.to_string())),
        other => Err(D::Error::custom(format!("expected a string or number, got {other}"))),
    }
}

/// The insights API reports counters as strings.
fn opt_int_or_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<i64>, D::Error> {
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::Null => Ok(None),
        serde_json::Value::Number(n) => n
            .as_i64()
            .map(Some)
            .ok_or_else(|| D::Error::custom("counter out of range")),
        serde_json::Value::String(s) => s.trim().parse().map(Some).map_err(D::Error::custom),
        other => Err(D::Error::custom(format!("expected an integer, got {other}"))),
    }
}
