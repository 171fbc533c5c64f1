// Stock and equipment bookkeeping
pub mod allocator;
pub mod ledger;
pub mod supplies;

// Request / loan lifecycle
pub mod batches;
pub mod loans;
pub mod reconciler;
pub mod requests;

// Front doors and side channels
pub mod notifications;
pub mod scanner;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::auth::Actor;
use crate::errors::ServiceError;

/// Outcome of one member of a bulk operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct MemberResult {
    pub id: i32,
    pub ok: bool,
    /// Status of the member after the operation was attempted
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl MemberResult {
    pub fn succeeded(id: i32, status: impl ToString) -> Self {
        Self {
            id,
            ok: true,
            status: Some(status.to_string()),
            error_code: None,
            error: None,
        }
    }

    pub fn failed(id: i32, status: Option<String>, err: &ServiceError) -> Self {
        Self {
            id,
            ok: false,
            status,
            error_code: Some(err.code().to_string()),
            error: Some(err.response_message()),
        }
    }
}

/// Appends one audit line to a free-text notes column.
///
/// Lines look like `[user 7 - 2025-01-14 09:30] DAMAGED: cracked screen`.
pub(crate) fn append_note(
    existing: Option<&str>,
    actor: Actor,
    at: DateTime<Utc>,
    outcome: &str,
    note: Option<&str>,
) -> String {
    let mut line = format!(
        "[{} - {}] {}",
        actor.label(),
        at.format("%Y-%m-%d %H:%M"),
        outcome.to_uppercase()
    );
    if let Some(note) = note.map(str::trim).filter(|n| !n.is_empty()) {
        line.push_str(": ");
        line.push_str(note);
    }

    match existing.map(str::trim_end).filter(|n| !n.is_empty()) {
        Some(previous) => format!("{}\n{}", previous, line),
        None => line,
    }
}

pub(crate) fn today() -> NaiveDate {
    Utc::now().date_naive()
}
