//! Canonical event model.
//!
//! An [`Event`] is immutable once recorded. Producers hand the ingestion
//! service a [`CandidateEvent`]; the service assigns the identity and the
//! ingestion timestamp.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

/// The only schema version currently produced.
pub const SCHEMA_VERSION_V1: &str = "v1";

const MAX_SCHEMA_VERSION_LEN: usize = 10;
const MAX_DEDUPE_KEY_LEN: usize = 255;
const MAX_SYMBOL_LEN: usize = 16;
const MAX_ENTITY_ID_LEN: usize = 64;
const MAX_URI_LEN: usize = 512;
const MAX_HASH_LEN: usize = 64;

/// Classification of what an event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    /// A regulatory filing (8-K, 10-Q, Form 4, ...).
    #[serde(rename = "DISCLOSURE.FILING")]
    DisclosureFiling,
    /// Social media mentions of a symbol.
    #[serde(rename = "SOCIAL.MENTIONS")]
    SocialMentions,
    /// A market price bar.
    #[serde(rename = "MARKET.BAR")]
    MarketBar,
    /// Output of a model run.
    #[serde(rename = "MODEL.INSIGHT")]
    ModelInsight,
    /// Platform health signal.
    #[serde(rename = "SYSTEM.HEALTH")]
    SystemHealth,
}

impl EventType {
    /// Wire and storage representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DisclosureFiling => "DISCLOSURE.FILING",
            Self::SocialMentions => "SOCIAL.MENTIONS",
            Self::MarketBar => "MARKET.BAR",
            Self::ModelInsight => "MODEL.INSIGHT",
            Self::SystemHealth => "SYSTEM.HEALTH",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DISCLOSURE.FILING" => Ok(Self::DisclosureFiling),
            "SOCIAL.MENTIONS" => Ok(Self::SocialMentions),
            "MARKET.BAR" => Ok(Self::MarketBar),
            "MODEL.INSIGHT" => Ok(Self::ModelInsight),
            "SYSTEM.HEALTH" => Ok(Self::SystemHealth),
            other => Err(DomainError::Validation(format!("unknown event type: {other}"))),
        }
    }
}

/// The external system an event was collected from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    /// SEC EDGAR filings.
    Edgar,
    /// The wallstreetbets feed.
    Wsb,
    /// General Reddit feed.
    Reddit,
    /// Market data vendor.
    Market,
    /// Language-model generated insight.
    Llm,
    /// The platform itself.
    System,
}

impl Source {
    /// Wire and storage representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Edgar => "edgar",
            Self::Wsb => "wsb",
            Self::Reddit => "reddit",
            Self::Market => "market",
            Self::Llm => "llm",
            Self::System => "system",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Source {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "edgar" => Ok(Self::Edgar),
            "wsb" => Ok(Self::Wsb),
            "reddit" => Ok(Self::Reddit),
            "market" => Ok(Self::Market),
            "llm" => Ok(Self::Llm),
            "system" => Ok(Self::System),
            other => Err(DomainError::Validation(format!("unknown source: {other}"))),
        }
    }
}

/// A fully-formed event proposed by a producer, not yet recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateEvent {
    /// Payload schema version.
    #[serde(default = "default_schema_version")]
    pub schema_version: String,
    /// What the event describes.
    pub event_type: EventType,
    /// Where the event came from.
    pub source: Source,
    /// Ticker symbol, when the event concerns one.
    #[serde(default)]
    pub symbol: Option<String>,
    /// Source-specific entity (author, CIK, ...).
    #[serde(default)]
    pub entity_id: Option<String>,
    /// When the real-world fact occurred.
    pub ts_event: DateTime<Utc>,
    /// Deterministic natural key of the real-world occurrence.
    pub dedupe_key: String,
    /// Opaque severity in `[0, 100]`.
    pub severity: i32,
    /// Opaque confidence in `[0, 1]`.
    #[serde(default)]
    pub confidence: Option<f64>,
    /// Canonical, schema-versioned event body.
    #[serde(default = "empty_object")]
    pub payload_json: serde_json::Value,
    /// Pointer to the archived raw copy.
    #[serde(default)]
    pub raw_s3_uri: Option<String>,
    /// Pointer to the archived normalized copy.
    #[serde(default)]
    pub normalized_s3_uri: Option<String>,
    /// Content checksum of the archived copy.
    #[serde(default)]
    pub hash: Option<String>,
}

fn default_schema_version() -> String {
    SCHEMA_VERSION_V1.to_owned()
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

impl CandidateEvent {
    /// Checks field-level constraints before ingestion.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` naming the first violated constraint.
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.schema_version.is_empty() || self.schema_version.len() > MAX_SCHEMA_VERSION_LEN {
            return Err(DomainError::Validation(format!(
                "schema_version must be 1..={MAX_SCHEMA_VERSION_LEN} characters"
            )));
        }
        if self.dedupe_key.trim().is_empty() {
            return Err(DomainError::Validation("dedupe_key must not be empty".into()));
        }
        if self.dedupe_key.len() > MAX_DEDUPE_KEY_LEN {
            return Err(DomainError::Validation(format!(
                "dedupe_key exceeds {MAX_DEDUPE_KEY_LEN} characters"
            )));
        }
        if let Some(symbol) = &self.symbol {
            if !is_valid_symbol(symbol) {
                return Err(DomainError::Validation(format!(
                    "symbol {symbol:?} must match ^[A-Z.-]{{1,{MAX_SYMBOL_LEN}}}$"
                )));
            }
        }
        if !(0..=100).contains(&self.severity) {
            return Err(DomainError::Validation(format!(
                "severity {} outside [0, 100]",
                self.severity
            )));
        }
        if let Some(confidence) = self.confidence {
            if !(0.0..=1.0).contains(&confidence) {
                return Err(DomainError::Validation(format!(
                    "confidence {confidence} outside [0, 1]"
                )));
            }
        }
        check_len("entity_id", self.entity_id.as_deref(), MAX_ENTITY_ID_LEN)?;
        check_len("raw_s3_uri", self.raw_s3_uri.as_deref(), MAX_URI_LEN)?;
        check_len("normalized_s3_uri", self.normalized_s3_uri.as_deref(), MAX_URI_LEN)?;
        check_len("hash", self.hash.as_deref(), MAX_HASH_LEN)?;
        Ok(())
    }

    /// Binds the candidate to its assigned identity and ingestion time.
    #[must_use]
    pub fn into_event(self, event_id: Uuid, ts_ingested: DateTime<Utc>) -> Event {
        Event {
            event_id,
            schema_version: self.schema_version,
            event_type: self.event_type,
            source: self.source,
            symbol: self.symbol,
            entity_id: self.entity_id,
            ts_event: self.ts_event,
            ts_ingested,
            dedupe_key: self.dedupe_key,
            severity: self.severity,
            confidence: self.confidence,
            payload_json: self.payload_json,
            raw_s3_uri: self.raw_s3_uri,
            normalized_s3_uri: self.normalized_s3_uri,
            hash: self.hash,
        }
    }
}

fn is_valid_symbol(symbol: &str) -> bool {
    !symbol.is_empty()
        && symbol.len() <= MAX_SYMBOL_LEN
        && symbol
            .chars()
            .all(|c| c.is_ascii_uppercase() || c == '.' || c == '-')
}

fn check_len(field: &str, value: Option<&str>, max: usize) -> Result<(), DomainError> {
    match value {
        Some(v) if v.len() > max => Err(DomainError::Validation(format!(
            "{field} exceeds {max} characters"
        ))),
        _ => Ok(()),
    }
}

/// A recorded event. Never mutated after insert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Globally unique identifier, assigned once.
    pub event_id: Uuid,
    /// Payload schema version.
    pub schema_version: String,
    /// What the event describes.
    pub event_type: EventType,
    /// Where the event came from.
    pub source: Source,
    /// Ticker symbol, when the event concerns one.
    pub symbol: Option<String>,
    /// Source-specific entity.
    pub entity_id: Option<String>,
    /// When the real-world fact occurred.
    pub ts_event: DateTime<Utc>,
    /// When the system first durably recorded the event.
    pub ts_ingested: DateTime<Utc>,
    /// Unique across all time.
    pub dedupe_key: String,
    /// Opaque severity.
    pub severity: i32,
    /// Opaque confidence.
    pub confidence: Option<f64>,
    /// Canonical event body.
    pub payload_json: serde_json::Value,
    /// Pointer to the archived raw copy.
    pub raw_s3_uri: Option<String>,
    /// Pointer to the archived normalized copy.
    pub normalized_s3_uri: Option<String>,
    /// Content checksum of the archived copy.
    pub hash: Option<String>,
}
