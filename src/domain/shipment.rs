//! Shipment read model as returned by the commerce API.
//!
//! The flow only ever observes these values; they are produced and mutated
//! server-side (quote jobs, purchases) and delivered through a
//! [`ShipmentRepository`](crate::repository::ShipmentRepository).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

/// Generic notice shown for a carrier failure without a usable message.
pub const GENERIC_RATE_ERROR: &str = "Unable to get rates";

/// Discriminator of the only carrier error variant the quote job emits today.
const RATE_ERROR_TAG: &str = "rate_error";

/// Opaque identifier of a shipment in the commerce API.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShipmentId(pub String);

impl ShipmentId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// An empty id means the route carried no shipment at all.
    pub fn is_absent(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl std::fmt::Display for ShipmentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ShipmentId {
    fn from(id: &str) -> Self {
        ShipmentId(id.to_string())
    }
}

impl From<String> for ShipmentId {
    fn from(id: String) -> Self {
        ShipmentId(id)
    }
}

/// Identifier of a rate quote, unique within one shipment's rate set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RateId(pub String);

impl RateId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RateId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RateId {
    fn from(id: &str) -> Self {
        RateId(id.to_string())
    }
}

impl From<String> for RateId {
    fn from(id: String) -> Self {
        RateId(id)
    }
}

/// Identifier of one flow instance (one user-facing run for one shipment).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct FlowId(pub Uuid);

impl std::fmt::Display for FlowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Display only first 8 characters for readability in logs
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

impl From<Uuid> for FlowId {
    fn from(uuid: Uuid) -> Self {
        FlowId(uuid)
    }
}

impl std::ops::Deref for FlowId {
    type Target = Uuid;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// A shipment and the rate quotes embedded in it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shipment {
    pub id: ShipmentId,

    /// Once set, the shipment can no longer be purchased.
    #[serde(default)]
    pub purchase_completed_at: Option<DateTime<Utc>>,

    /// Set by the remote system when its last purchase attempt failed.
    #[serde(default)]
    pub purchase_failed_at: Option<DateTime<Utc>>,

    /// Human-readable reason for the last failed purchase, as reported remotely.
    #[serde(default)]
    pub purchase_error_message: Option<String>,

    #[serde(default, deserialize_with = "null_as_empty")]
    pub rates: Vec<RateQuote>,

    #[serde(default, rename = "get_rates_errors", deserialize_with = "null_as_empty")]
    pub rate_errors: Vec<CarrierError>,
}

impl Shipment {
    /// A shipment with no quotes, errors or purchase history.
    pub fn new(id: impl Into<ShipmentId>) -> Self {
        Self {
            id: id.into(),
            purchase_completed_at: None,
            purchase_failed_at: None,
            purchase_error_message: None,
            rates: Vec::new(),
            rate_errors: Vec::new(),
        }
    }

    pub fn is_purchased(&self) -> bool {
        self.purchase_completed_at.is_some()
    }

    /// The remote failure reason, if the last purchase attempt failed and
    /// nothing has been bought since.
    pub fn purchase_failure(&self) -> Option<&str> {
        if self.is_purchased() {
            return None;
        }
        match (&self.purchase_error_message, self.purchase_failed_at) {
            (Some(message), _) if !message.trim().is_empty() => Some(message.as_str()),
            (_, Some(_)) => Some(crate::error::GENERIC_PURCHASE_ERROR),
            _ => None,
        }
    }
}

/// One carrier + service price option returned by the quote job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateQuote {
    pub id: RateId,

    /// Absent for aggregated or unbranded services.
    #[serde(default)]
    pub carrier: Option<String>,

    #[serde(default)]
    pub service: String,

    /// Monetary amount already formatted for display (e.g. "$5.00").
    #[serde(default)]
    pub formatted_rate: String,

    /// Logo reference for the carrier, when the API provides one.
    #[serde(default)]
    pub avatar_src: Option<String>,
}

/// Per-carrier failure reported by the quote job.
///
/// Payloads are validated on the way in: anything that does not carry the
/// `rate_error` discriminator and a carrier name lands in
/// [`CarrierError::Unrecognized`] instead of failing the whole shipment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CarrierError {
    RateError {
        carrier: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Unrecognized {
        #[serde(skip_serializing_if = "Option::is_none")]
        kind: Option<String>,
    },
}

impl CarrierError {
    /// Narrow an arbitrary JSON value into a carrier error.
    pub fn from_value(value: &serde_json::Value) -> Self {
        let kind = value.get("type").and_then(|v| v.as_str());
        let carrier = value.get("carrier").and_then(|v| v.as_str());

        match (kind, carrier) {
            (Some(RATE_ERROR_TAG), Some(carrier)) => CarrierError::RateError {
                carrier: carrier.to_string(),
                message: value
                    .get("message")
                    .and_then(|v| v.as_str())
                    .map(str::to_string),
            },
            _ => CarrierError::Unrecognized {
                kind: kind.map(str::to_string),
            },
        }
    }

    /// Display line for this error: `"{carrier}: {message}"`, falling back to
    /// the generic notice.
    pub fn display_message(&self) -> String {
        match self {
            CarrierError::RateError { carrier, message } => format!(
                "{}: {}",
                carrier,
                message.as_deref().unwrap_or(GENERIC_RATE_ERROR)
            ),
            CarrierError::Unrecognized { .. } => GENERIC_RATE_ERROR.to_string(),
        }
    }
}

impl<'de> Deserialize<'de> for CarrierError {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        Ok(CarrierError::from_value(&value))
    }
}

fn null_as_empty<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}
