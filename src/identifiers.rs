//! Scan tokens.
//!
//! Every physical label and every printed request slip carries one of these
//! strings (usually rendered as a QR code by the client):
//!
//! | Token | Refers to |
//! |---|---|
//! | `SUPPLY-{id}` | a supply |
//! | `INSTANCE-{id}` | one equipment instance |
//! | `BORROW-{req}-{user}-{supply}` | a loan request |
//! | `SUPPLY-REQ-{req}-{user}-{supply}` | a consumption request |
//! | `BORROW-BATCH-{user}-{timestamp}` | a batch of loan requests |
//! | `SUPPLY-REQ-BATCH-{user}-{timestamp}` | a batch of consumption requests |
//!
//! Prefixes are case-sensitive. Longer prefixes are tried first, so
//! `SUPPLY-REQ-7-1-2` is never mistaken for a supply token.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use utoipa::ToSchema;

use crate::entities::{supply_request, RequestKind};
use crate::errors::ServiceError;

const SUPPLY_REQ_BATCH: &str = "SUPPLY-REQ-BATCH-";
const SUPPLY_REQ: &str = "SUPPLY-REQ-";
const BORROW_BATCH: &str = "BORROW-BATCH-";
const BORROW: &str = "BORROW-";
const SUPPLY: &str = "SUPPLY-";
const INSTANCE: &str = "INSTANCE-";

/// Minimum digits in a batch timestamp (`YYYYMMDDHHMM`).
const MIN_TIMESTAMP_DIGITS: usize = 12;

/// Format of the timestamp half of a batch group id.
pub const BATCH_TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S%3f";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScanToken {
    Supply {
        supply_id: i32,
    },
    Instance {
        instance_id: i32,
    },
    Request {
        kind: RequestKind,
        request_id: i32,
        user_id: i32,
        supply_id: i32,
    },
    BatchRequest {
        kind: RequestKind,
        user_id: i32,
        timestamp_key: String,
    },
}

impl ScanToken {
    pub fn for_supply(supply_id: i32) -> Self {
        ScanToken::Supply { supply_id }
    }

    pub fn for_instance(instance_id: i32) -> Self {
        ScanToken::Instance { instance_id }
    }

    pub fn for_request(request: &supply_request::Model) -> Self {
        ScanToken::Request {
            kind: request.kind,
            request_id: request.id,
            user_id: request.user_id,
            supply_id: request.supply_id,
        }
    }

    /// Token for a whole batch, from its stored `batch_group_id`.
    pub fn for_batch(kind: RequestKind, batch_group_id: &str) -> Result<Self, ServiceError> {
        let (user_id, timestamp_key) = split_batch_group_id(batch_group_id)?;
        Ok(ScanToken::BatchRequest {
            kind,
            user_id,
            timestamp_key,
        })
    }

    pub fn decode(raw: &str) -> Result<Self, ServiceError> {
        raw.parse()
    }

    /// The `batch_group_id` a batch token resolves to.
    pub fn batch_group_id(&self) -> Option<String> {
        match self {
            ScanToken::BatchRequest {
                user_id,
                timestamp_key,
                ..
            } => Some(format!("{}-{}", user_id, timestamp_key)),
            _ => None,
        }
    }
}

impl fmt::Display for ScanToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanToken::Supply { supply_id } => write!(f, "{}{}", SUPPLY, supply_id),
            ScanToken::Instance { instance_id } => write!(f, "{}{}", INSTANCE, instance_id),
            ScanToken::Request {
                kind,
                request_id,
                user_id,
                supply_id,
            } => write!(
                f,
                "{}{}-{}-{}",
                request_prefix(*kind),
                request_id,
                user_id,
                supply_id
            ),
            ScanToken::BatchRequest {
                kind,
                user_id,
                timestamp_key,
            } => write!(f, "{}{}-{}", batch_prefix(*kind), user_id, timestamp_key),
        }
    }
}

impl FromStr for ScanToken {
    type Err = ServiceError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let token = raw.trim();

        if let Some(rest) = token.strip_prefix(SUPPLY_REQ_BATCH) {
            return decode_batch(RequestKind::Consumption, rest, token);
        }
        if let Some(rest) = token.strip_prefix(SUPPLY_REQ) {
            return decode_request(RequestKind::Consumption, rest, token);
        }
        if let Some(rest) = token.strip_prefix(BORROW_BATCH) {
            return decode_batch(RequestKind::Loan, rest, token);
        }
        if let Some(rest) = token.strip_prefix(BORROW) {
            return decode_request(RequestKind::Loan, rest, token);
        }
        if let Some(rest) = token.strip_prefix(SUPPLY) {
            let [supply_id] = numeric_segments::<1>(rest, token)?;
            return Ok(ScanToken::Supply { supply_id });
        }
        if let Some(rest) = token.strip_prefix(INSTANCE) {
            let [instance_id] = numeric_segments::<1>(rest, token)?;
            return Ok(ScanToken::Instance { instance_id });
        }

        Err(malformed(token, "unrecognized prefix"))
    }
}

/// `{user_id}-{YYYYMMDDHHMMSSmmm}` for a batch created by `user_id` at `at`.
pub fn generate_batch_group_id(user_id: i32, at: DateTime<Utc>) -> String {
    format!("{}-{}", user_id, at.format(BATCH_TIMESTAMP_FORMAT))
}

fn request_prefix(kind: RequestKind) -> &'static str {
    match kind {
        RequestKind::Loan => BORROW,
        RequestKind::Consumption => SUPPLY_REQ,
    }
}

fn batch_prefix(kind: RequestKind) -> &'static str {
    match kind {
        RequestKind::Loan => BORROW_BATCH,
        RequestKind::Consumption => SUPPLY_REQ_BATCH,
    }
}

fn decode_request(kind: RequestKind, rest: &str, token: &str) -> Result<ScanToken, ServiceError> {
    let [request_id, user_id, supply_id] = numeric_segments::<3>(rest, token)?;
    Ok(ScanToken::Request {
        kind,
        request_id,
        user_id,
        supply_id,
    })
}

fn decode_batch(kind: RequestKind, rest: &str, token: &str) -> Result<ScanToken, ServiceError> {
    let (user_id, timestamp_key) =
        split_batch_group_id(rest).map_err(|_| malformed(token, "bad batch segments"))?;
    Ok(ScanToken::BatchRequest {
        kind,
        user_id,
        timestamp_key,
    })
}

fn split_batch_group_id(value: &str) -> Result<(i32, String), ServiceError> {
    let mut parts = value.split('-');
    let (user, timestamp) = match (parts.next(), parts.next(), parts.next()) {
        (Some(user), Some(timestamp), None) => (user, timestamp),
        _ => return Err(malformed(value, "expected {user}-{timestamp}")),
    };
    let user_id = parse_id(user).ok_or_else(|| malformed(value, "non-numeric user id"))?;
    if timestamp.len() < MIN_TIMESTAMP_DIGITS || !timestamp.bytes().all(|b| b.is_ascii_digit()) {
        return Err(malformed(value, "timestamp must be at least 12 digits"));
    }
    Ok((user_id, timestamp.to_string()))
}

fn numeric_segments<const N: usize>(rest: &str, token: &str) -> Result<[i32; N], ServiceError> {
    let mut out = [0i32; N];
    let mut parts = rest.split('-');
    for slot in out.iter_mut() {
        let part = parts
            .next()
            .ok_or_else(|| malformed(token, "missing segment"))?;
        *slot = parse_id(part).ok_or_else(|| malformed(token, "non-numeric segment"))?;
    }
    if parts.next().is_some() {
        return Err(malformed(token, "too many segments"));
    }
    Ok(out)
}

// Plain ascii digits only; `str::parse` would also accept a leading `+`.
fn parse_id(segment: &str) -> Option<i32> {
    if segment.is_empty() || !segment.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    segment.parse().ok()
}

fn malformed(token: &str, why: &str) -> ServiceError {
    ServiceError::MalformedToken(format!("{} ({})", token, why))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    #[test]
    fn decodes_every_prefix() {
        assert_eq!(
            ScanToken::decode("SUPPLY-12").unwrap(),
            ScanToken::Supply { supply_id: 12 }
        );
        assert_eq!(
            ScanToken::decode("INSTANCE-7").unwrap(),
            ScanToken::Instance { instance_id: 7 }
        );
        assert_eq!(
            ScanToken::decode("BORROW-3-41-12").unwrap(),
            ScanToken::Request {
                kind: RequestKind::Loan,
                request_id: 3,
                user_id: 41,
                supply_id: 12
            }
        );
        assert_eq!(
            ScanToken::decode("SUPPLY-REQ-3-41-12").unwrap(),
            ScanToken::Request {
                kind: RequestKind::Consumption,
                request_id: 3,
                user_id: 41,
                supply_id: 12
            }
        );

        let batch = ScanToken::decode("BORROW-BATCH-41-20250114093015123").unwrap();
        assert_eq!(
            batch.batch_group_id().as_deref(),
            Some("41-20250114093015123")
        );
        let batch = ScanToken::decode("SUPPLY-REQ-BATCH-41-202501140930").unwrap();
        assert!(matches!(
            batch,
            ScanToken::BatchRequest {
                kind: RequestKind::Consumption,
                ..
            }
        ));
    }

    #[test]
    fn rejects_malformed_tokens() {
        for raw in [
            "",
            "supply-1",
            "SUPPLY-",
            "SUPPLY-abc",
            "SUPPLY-1-2",
            "SUPPLY-+1",
            "INSTANCE-x",
            "BORROW-1-2",
            "BORROW-1-2-3-4",
            "SUPPLY-REQ-1-two-3",
            "BORROW-BATCH-41-2025",
            "BORROW-BATCH-41",
            "BORROW-BATCH-x-202501140930",
            "SUPPLY-REQ-BATCH-41-2025011409301a",
            "PALLET-9",
        ] {
            let err = ScanToken::decode(raw).unwrap_err();
            assert!(
                matches!(err, ServiceError::MalformedToken(_)),
                "{raw} should be malformed, got {err:?}"
            );
        }
    }

    #[test]
    fn surrounding_whitespace_is_ignored() {
        assert_eq!(
            ScanToken::decode("  INSTANCE-4\n").unwrap(),
            ScanToken::for_instance(4)
        );
    }

    #[test]
    fn batch_group_id_uses_millisecond_timestamp() {
        let at = Utc.with_ymd_and_hms(2025, 1, 14, 9, 30, 15).unwrap()
            + chrono::Duration::milliseconds(123);
        let id = generate_batch_group_id(41, at);
        assert_eq!(id, "41-20250114093015123");

        let token = ScanToken::for_batch(RequestKind::Loan, &id).unwrap();
        assert_eq!(token.to_string(), "BORROW-BATCH-41-20250114093015123");
    }

    proptest! {
        #[test]
        fn display_then_decode_is_identity(
            request_id in 0..i32::MAX,
            user_id in 0..i32::MAX,
            supply_id in 0..i32::MAX,
            loan in any::<bool>(),
            digits in "[0-9]{12,17}",
        ) {
            let kind = if loan { RequestKind::Loan } else { RequestKind::Consumption };
            let tokens = [
                ScanToken::for_supply(supply_id),
                ScanToken::for_instance(request_id),
                ScanToken::Request { kind, request_id, user_id, supply_id },
                ScanToken::BatchRequest { kind, user_id, timestamp_key: digits.clone() },
            ];
            for token in tokens {
                prop_assert_eq!(ScanToken::decode(&token.to_string()).unwrap(), token);
            }
        }

        #[test]
        fn lowercase_prefixes_never_decode(id in 0..i32::MAX) {
            let lowered = ScanToken::for_supply(id).to_string().to_lowercase();
            prop_assert!(ScanToken::decode(&lowered).is_err());
        }
    }
}
