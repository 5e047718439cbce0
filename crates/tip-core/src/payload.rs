//! Typed view of `payload_json` at the consumer boundary.
//!
//! The store and the dispatcher treat the payload as opaque. Consumers decode
//! it into [`TypedPayload`], keyed by `schema_version` and `event_type`.

use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::event::{EventType, SCHEMA_VERSION_V1};

/// Body of a `SOCIAL.MENTIONS` v1 event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SocialMentionsV1 {
    /// Post identifier at the source.
    #[serde(default)]
    pub post_id: Option<String>,
    /// Post text.
    #[serde(default)]
    pub text: Option<String>,
    /// Engagement score.
    #[serde(default)]
    pub upvotes: i64,
    /// Tickers mentioned in the post.
    #[serde(default)]
    pub tickers: Vec<String>,
    /// Sentiment label, when scored upstream.
    #[serde(default)]
    pub sentiment: Option<String>,
}

/// Body of a `DISCLOSURE.FILING` v1 event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisclosureFilingV1 {
    /// Filing form, e.g. `8-K`.
    pub form: String,
    /// Filer CIK, zero padded.
    #[serde(default)]
    pub cik: Option<String>,
    /// EDGAR accession number.
    #[serde(default)]
    pub accession_number: Option<String>,
    /// Link to the primary document.
    #[serde(default)]
    pub url: Option<String>,
}

/// Body of a `MARKET.BAR` v1 event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketBarV1 {
    /// Open price.
    pub open: f64,
    /// High price.
    pub high: f64,
    /// Low price.
    pub low: f64,
    /// Close price.
    pub close: f64,
    /// Traded volume.
    #[serde(default)]
    pub volume: f64,
}

/// Decoded payload, tagged by schema version and event type.
#[derive(Debug, Clone, PartialEq)]
pub enum TypedPayload {
    /// `v1` / `SOCIAL.MENTIONS`.
    SocialMentionsV1(SocialMentionsV1),
    /// `v1` / `DISCLOSURE.FILING`.
    DisclosureFilingV1(DisclosureFilingV1),
    /// `v1` / `MARKET.BAR`.
    MarketBarV1(MarketBarV1),
    /// A known version whose event type has no typed body; kept as raw JSON.
    Untyped {
        /// The event type.
        event_type: EventType,
        /// The raw body.
        body: serde_json::Value,
    },
}

impl TypedPayload {
    /// Decodes `body` according to `schema_version` and `event_type`.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` for an unknown schema version or a
    /// body that does not match the typed shape.
    pub fn decode(
        schema_version: &str,
        event_type: EventType,
        body: &serde_json::Value,
    ) -> Result<Self, DomainError> {
        if schema_version != SCHEMA_VERSION_V1 {
            return Err(DomainError::Validation(format!(
                "unsupported schema version: {schema_version}"
            )));
        }
        let invalid = |e: serde_json::Error| {
            DomainError::Validation(format!("invalid {event_type} payload: {e}"))
        };
        match event_type {
            EventType::SocialMentions => serde_json::from_value(body.clone())
                .map(Self::SocialMentionsV1)
                .map_err(invalid),
            EventType::DisclosureFiling => serde_json::from_value(body.clone())
                .map(Self::DisclosureFilingV1)
                .map_err(invalid),
            EventType::MarketBar => serde_json::from_value(body.clone())
                .map(Self::MarketBarV1)
                .map_err(invalid),
            EventType::ModelInsight | EventType::SystemHealth => Ok(Self::Untyped {
                event_type,
                body: body.clone(),
            }),
        }
    }
}
