//! Scanner gateway: resolves a scanned token and performs the requested
//! action against it.

use chrono::{DateTime, Duration, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, QueryOrder, QuerySelect, Set,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use utoipa::{IntoParams, ToSchema};
use validator::Validate;

pub use crate::entities::ScanAction;
use crate::{
    auth::Actor,
    db::DbPool,
    entities::{
        borrowed_item,
        equipment_instance::Entity as EquipmentInstance,
        scan_log::{self, Entity as ScanLog},
        supply::{self, Entity as Supply},
        supply_request::{self, Entity as SupplyRequest},
        ReturnStatus,
    },
    errors::ServiceError,
    identifiers::ScanToken,
    services::{
        batches::{BatchCoordinator, BatchReport, BatchReturnInput, BatchSummary},
        loans::{self, LoanService, ReturnLoanInput, ReturnOutcome},
        requests::{self, ReleaseOutcome, RequestDetails, RequestService},
        supplies::{InstanceDetails, SupplyDetails, SupplyService},
        today, MemberResult,
    },
};

#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
pub struct ScanInput {
    #[validate(length(min = 1, max = 128))]
    pub token: String,
    pub action: ScanAction,
    /// Commits a return when present; without it `return` only previews
    pub return_status: Option<ReturnStatus>,
    #[validate(length(max = 1000))]
    pub note: Option<String>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct LoanPreview {
    pub loan: borrowed_item::Model,
    pub days_overdue: i64,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ReturnPreview {
    pub token: String,
    pub loans: Vec<LoanPreview>,
    /// Outstanding loans left in the batch, for batch members
    pub remaining_in_batch: Option<usize>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ScanResult {
    Supply(SupplyDetails),
    Instance(InstanceDetails),
    Request(RequestDetails),
    Batch(BatchSummary),
    Released(ReleaseOutcome),
    BatchProcessed(BatchReport),
    ReturnPreview(ReturnPreview),
    Returned(ReturnOutcome),
    ReturnedMany { results: Vec<MemberResult> },
}

const DEFAULT_FEED_LENGTH: u64 = 10;
const MAX_FEED_LENGTH: u64 = 50;
/// Batch scans closer together than this collapse into one feed entry.
const FEED_GROUP_WINDOW_SECS: i64 = 60;

#[derive(Debug, Clone, Default, Deserialize, IntoParams, ToSchema)]
#[into_params(parameter_in = Query)]
pub struct RecentScansQuery {
    /// Feed entries to return, 10 when omitted
    pub limit: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct ScanFeedItem {
    pub supply_id: i32,
    pub name: String,
}

/// One line of the recent-scans feed. Scans of the same batch with the same
/// action in quick succession share a line.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ScanFeedEntry {
    pub action: ScanAction,
    pub token: String,
    pub batch_group_id: Option<String>,
    pub is_batch: bool,
    pub succeeded: bool,
    pub error_code: Option<String>,
    pub scanned_at: DateTime<Utc>,
    /// Log rows folded into this entry
    pub scans: usize,
    pub items: Vec<ScanFeedItem>,
}

#[derive(Clone)]
pub struct ScannerService {
    db_pool: Arc<DbPool>,
    supplies: SupplyService,
    requests: RequestService,
    loans: LoanService,
    batches: BatchCoordinator,
}

impl ScannerService {
    pub fn new(
        db_pool: Arc<DbPool>,
        supplies: SupplyService,
        requests: RequestService,
        loans: LoanService,
        batches: BatchCoordinator,
    ) -> Self {
        Self {
            db_pool,
            supplies,
            requests,
            loans,
            batches,
        }
    }

    /// Performs one scanner action and writes it to the scan log, whether
    /// it succeeded or not.
    #[instrument(skip(self, input), fields(token = %input.token, action = ?input.action))]
    pub async fn handle(&self, input: ScanInput, actor: Actor) -> Result<ScanResult, ServiceError> {
        input.validate()?;
        let action = input.action;
        let raw = input.token.trim().to_string();

        let result = self.dispatch(input, actor).await;
        self.record(actor, action, &raw, result.as_ref().err()).await;
        result
    }

    /// The caller's latest scans, newest first, batch scans grouped.
    pub async fn recent(
        &self,
        actor: Actor,
        query: RecentScansQuery,
    ) -> Result<Vec<ScanFeedEntry>, ServiceError> {
        let limit = query
            .limit
            .unwrap_or(DEFAULT_FEED_LENGTH)
            .clamp(1, MAX_FEED_LENGTH) as usize;
        let db = self.db_pool.as_ref();

        let rows = ScanLog::find()
            .filter(scan_log::Column::ScannedBy.eq(actor.id))
            .order_by_desc(scan_log::Column::CreatedAt)
            .order_by_desc(scan_log::Column::Id)
            .limit((limit * 4) as u64)
            .all(db)
            .await?;

        let supply_ids: Vec<i32> = rows.iter().filter_map(|r| r.supply_id).collect();
        let names: HashMap<i32, String> = if supply_ids.is_empty() {
            HashMap::new()
        } else {
            Supply::find()
                .filter(supply::Column::Id.is_in(supply_ids))
                .all(db)
                .await?
                .into_iter()
                .map(|s| (s.id, s.name))
                .collect()
        };

        Ok(group_feed(rows, &names, limit))
    }

    async fn dispatch(&self, input: ScanInput, actor: Actor) -> Result<ScanResult, ServiceError> {
        let token = ScanToken::decode(&input.token)?;
        info!(token = %token, "scanner token resolved");

        match input.action {
            ScanAction::Scan => self.scan(&token).await,
            ScanAction::Issue => self.issue(&token, actor).await,
            ScanAction::Return => match input.return_status {
                None => self.preview_return(&token).await.map(ScanResult::ReturnPreview),
                Some(outcome) => self.commit_return(&token, outcome, input.note, actor).await,
            },
        }
    }

    async fn scan(&self, token: &ScanToken) -> Result<ScanResult, ServiceError> {
        Ok(match token {
            ScanToken::Supply { supply_id } => ScanResult::Supply(self.supplies.get(*supply_id).await?),
            ScanToken::Instance { instance_id } => {
                ScanResult::Instance(self.supplies.get_instance(*instance_id).await?)
            }
            ScanToken::Request { request_id, .. } => {
                self.resolve_request(token).await?;
                ScanResult::Request(self.requests.get(*request_id).await?)
            }
            ScanToken::BatchRequest { .. } => {
                ScanResult::Batch(self.resolve_batch(token).await?)
            }
        })
    }

    async fn issue(&self, token: &ScanToken, actor: Actor) -> Result<ScanResult, ServiceError> {
        match token {
            ScanToken::Request { request_id, .. } => {
                self.resolve_request(token).await?;
                Ok(ScanResult::Released(
                    self.requests.release(*request_id, actor).await?,
                ))
            }
            ScanToken::BatchRequest { .. } => {
                let summary = self.resolve_batch(token).await?;
                Ok(ScanResult::BatchProcessed(
                    self.batches
                        .release_batch(&summary.batch_group_id, actor)
                        .await?,
                ))
            }
            _ => Err(ServiceError::InvalidOperation(format!(
                "{} cannot be issued; scan a request or batch slip",
                token
            ))),
        }
    }

    /// Outstanding loans a return of `token` would close.
    async fn preview_return(&self, token: &ScanToken) -> Result<ReturnPreview, ServiceError> {
        let db = self.db_pool.as_ref();
        let on = today();

        let (outstanding, batch_group_id) = match token {
            ScanToken::Instance { instance_id } => {
                let loan = loans::outstanding_for_instance(db, *instance_id)
                    .await?
                    .ok_or_else(|| no_outstanding(token))?;
                let batch = loan.batch_group_id.clone();
                (vec![loan], batch)
            }
            ScanToken::Request { request_id, .. } => {
                let request = self.resolve_request(token).await?;
                let open: Vec<_> = loans::for_request(db, *request_id)
                    .await?
                    .into_iter()
                    .filter(|l| l.is_outstanding())
                    .collect();
                (open, request.batch_group_id)
            }
            ScanToken::BatchRequest { .. } => {
                let summary = self.resolve_batch(token).await?;
                let open = summary
                    .loans
                    .into_iter()
                    .filter(|l| l.is_outstanding())
                    .collect();
                (open, Some(summary.batch_group_id))
            }
            ScanToken::Supply { .. } => {
                return Err(ServiceError::InvalidOperation(format!(
                    "{} is not a loan; scan an instance, request or batch",
                    token
                )))
            }
        };

        if outstanding.is_empty() {
            return Err(no_outstanding(token));
        }

        let remaining_in_batch = match batch_group_id {
            Some(batch) => Some(
                loans::for_batch(db, &batch)
                    .await?
                    .iter()
                    .filter(|l| l.is_outstanding())
                    .count(),
            ),
            None => None,
        };

        Ok(ReturnPreview {
            token: token.to_string(),
            loans: outstanding
                .into_iter()
                .map(|loan| LoanPreview {
                    days_overdue: loan.days_overdue(on),
                    loan,
                })
                .collect(),
            remaining_in_batch,
        })
    }

    async fn commit_return(
        &self,
        token: &ScanToken,
        outcome: ReturnStatus,
        note: Option<String>,
        actor: Actor,
    ) -> Result<ScanResult, ServiceError> {
        match token {
            ScanToken::BatchRequest { .. } => {
                let summary = self.resolve_batch(token).await?;
                let report = self
                    .batches
                    .return_batch(
                        &summary.batch_group_id,
                        BatchReturnInput {
                            return_status: Some(outcome),
                            note,
                            ..Default::default()
                        },
                        actor,
                    )
                    .await?;
                Ok(ScanResult::BatchProcessed(report))
            }
            _ => {
                let preview = self.preview_return(token).await?;
                if let [single] = preview.loans.as_slice() {
                    let done = self
                        .loans
                        .process_return(
                            single.loan.id,
                            ReturnLoanInput {
                                return_status: outcome,
                                note,
                            },
                            actor,
                        )
                        .await?;
                    return Ok(ScanResult::Returned(done));
                }

                let mut results = Vec::with_capacity(preview.loans.len());
                for entry in preview.loans {
                    let loan_id = entry.loan.id;
                    let input = ReturnLoanInput {
                        return_status: outcome,
                        note: note.clone(),
                    };
                    results.push(match self.loans.process_return(loan_id, input, actor).await {
                        Ok(_) => MemberResult::succeeded(loan_id, outcome),
                        Err(e) => MemberResult::failed(loan_id, Some("outstanding".into()), &e),
                    });
                }
                Ok(ScanResult::ReturnedMany { results })
            }
        }
    }

    async fn record(
        &self,
        actor: Actor,
        action: ScanAction,
        raw: &str,
        error: Option<&ServiceError>,
    ) {
        let (supply_id, batch_group_id) = match ScanToken::decode(raw) {
            Ok(token) => match self.subject(&token).await {
                Ok(subject) => subject,
                Err(e) => {
                    warn!(token = raw, error = %e, "could not resolve scan subject");
                    (None, None)
                }
            },
            Err(_) => (None, None),
        };

        let row = scan_log::ActiveModel {
            scanned_by: Set(actor.id),
            action: Set(action),
            token: Set(raw.to_string()),
            supply_id: Set(supply_id),
            batch_group_id: Set(batch_group_id),
            succeeded: Set(error.is_none()),
            error_code: Set(error.map(|e| e.code().to_string())),
            ..Default::default()
        };
        if let Err(e) = row.insert(self.db_pool.as_ref()).await {
            warn!(token = raw, error = %e, "failed to write scan log");
        }
    }

    /// Supply and batch a token points at, for the scan log.
    async fn subject(
        &self,
        token: &ScanToken,
    ) -> Result<(Option<i32>, Option<String>), ServiceError> {
        let db = self.db_pool.as_ref();
        Ok(match token {
            ScanToken::Supply { supply_id } => (
                Supply::find_by_id(*supply_id).one(db).await?.map(|s| s.id),
                None,
            ),
            ScanToken::Instance { instance_id } => (
                EquipmentInstance::find_by_id(*instance_id)
                    .one(db)
                    .await?
                    .map(|i| i.supply_id),
                None,
            ),
            ScanToken::Request { request_id, .. } => {
                match SupplyRequest::find_by_id(*request_id).one(db).await? {
                    Some(request) => (Some(request.supply_id), request.batch_group_id),
                    None => (None, None),
                }
            }
            ScanToken::BatchRequest { .. } => (None, token.batch_group_id()),
        })
    }

    /// Loads the request a token names and checks the embedded user and
    /// supply still match, so a stale or forged slip is refused.
    async fn resolve_request(
        &self,
        token: &ScanToken,
    ) -> Result<supply_request::Model, ServiceError> {
        let ScanToken::Request {
            kind,
            request_id,
            user_id,
            supply_id,
        } = token
        else {
            return Err(ServiceError::InvalidOperation(format!(
                "{} is not a request token",
                token
            )));
        };

        let request = requests::find_request(self.db_pool.as_ref(), *request_id).await?;
        if request.user_id != *user_id || request.supply_id != *supply_id || request.kind != *kind {
            return Err(ServiceError::NotFound(format!(
                "{} does not match request {}",
                token, request_id
            )));
        }
        Ok(request)
    }

    async fn resolve_batch(&self, token: &ScanToken) -> Result<BatchSummary, ServiceError> {
        let (ScanToken::BatchRequest { kind, .. }, Some(batch_group_id)) =
            (token, token.batch_group_id())
        else {
            return Err(ServiceError::InvalidOperation(format!(
                "{} is not a batch token",
                token
            )));
        };

        let summary = self.batches.batch_summary(&batch_group_id).await?;
        if summary.kind != *kind {
            return Err(ServiceError::NotFound(format!(
                "{} does not match batch {}",
                token, batch_group_id
            )));
        }
        Ok(summary)
    }
}

fn no_outstanding(token: &ScanToken) -> ServiceError {
    ServiceError::NotFound(format!("no outstanding loan for {}", token))
}

/// Folds log rows (newest first) into feed entries. Rows of the same batch
/// and action within a minute of the entry they would join are merged.
fn group_feed(
    rows: Vec<scan_log::Model>,
    names: &HashMap<i32, String>,
    limit: usize,
) -> Vec<ScanFeedEntry> {
    let window = Duration::seconds(FEED_GROUP_WINDOW_SECS);
    let mut feed: Vec<ScanFeedEntry> = Vec::new();
    let mut open_groups: HashMap<(ScanAction, String), usize> = HashMap::new();

    for row in rows {
        let item = row.supply_id.map(|supply_id| ScanFeedItem {
            supply_id,
            name: names.get(&supply_id).cloned().unwrap_or_default(),
        });

        let joined = row.batch_group_id.as_ref().and_then(|batch| {
            open_groups
                .get(&(row.action, batch.clone()))
                .copied()
                .filter(|&idx| feed[idx].scanned_at - row.created_at <= window)
        });

        match joined {
            Some(idx) => {
                let entry = &mut feed[idx];
                entry.scans += 1;
                entry.succeeded &= row.succeeded;
                if let Some(item) = item {
                    if !entry.items.contains(&item) {
                        entry.items.push(item);
                    }
                }
            }
            None => {
                if let Some(batch) = &row.batch_group_id {
                    open_groups.insert((row.action, batch.clone()), feed.len());
                }
                feed.push(ScanFeedEntry {
                    action: row.action,
                    is_batch: row.batch_group_id.is_some(),
                    token: row.token,
                    batch_group_id: row.batch_group_id,
                    succeeded: row.succeeded,
                    error_code: row.error_code,
                    scanned_at: row.created_at,
                    scans: 1,
                    items: item.into_iter().collect(),
                });
            }
        }

        if feed.len() >= limit {
            break;
        }
    }
    feed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(
        id: i32,
        action: ScanAction,
        supply_id: Option<i32>,
        batch: Option<&str>,
        secs_ago: i64,
    ) -> scan_log::Model {
        scan_log::Model {
            id,
            scanned_by: 1,
            action,
            token: format!("T-{}", id),
            supply_id,
            batch_group_id: batch.map(str::to_string),
            succeeded: true,
            error_code: None,
            created_at: Utc::now() - Duration::seconds(secs_ago),
        }
    }

    #[test]
    fn batch_scans_close_together_share_an_entry() {
        let names = HashMap::from([(1, "Paper".to_string()), (2, "Pens".to_string())]);
        let rows = vec![
            row(4, ScanAction::Issue, Some(2), Some("42-1"), 0),
            row(3, ScanAction::Issue, Some(1), Some("42-1"), 5),
            row(2, ScanAction::Scan, Some(1), None, 10),
            row(1, ScanAction::Issue, Some(1), Some("42-1"), 600),
        ];

        let feed = group_feed(rows, &names, 10);
        assert_eq!(feed.len(), 3);
        assert!(feed[0].is_batch);
        assert_eq!(feed[0].scans, 2);
        assert_eq!(
            feed[0].items.iter().map(|i| i.name.as_str()).collect::<Vec<_>>(),
            vec!["Pens", "Paper"]
        );
        assert!(!feed[1].is_batch);
        assert_eq!(feed[2].scans, 1, "outside the window starts a new entry");
    }

    #[test]
    fn feed_stops_at_the_limit() {
        let rows = (1..=5)
            .map(|id| row(id, ScanAction::Scan, None, None, i64::from(id)))
            .collect();
        assert_eq!(group_feed(rows, &HashMap::new(), 2).len(), 2);
    }
}
