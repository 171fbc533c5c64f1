//! Batch coordinator.
//!
//! A batch is every request sharing one `batch_group_id`. Bulk operations
//! apply the single-request operation to each member in id order, each in
//! its own transaction, and report per-member results. One failing member
//! never blocks the others.

use sea_orm::{ColumnTrait, EntityTrait, QueryFilter, QueryOrder};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use utoipa::ToSchema;
use validator::Validate;

use crate::{
    auth::Actor,
    db::DbPool,
    entities::{
        borrowed_item,
        supply_request::{self, Entity as SupplyRequest},
        RequestKind, ReturnStatus,
    },
    errors::ServiceError,
    identifiers::ScanToken,
    services::{
        loans::{self, LoanService, ReturnLoanInput},
        requests::{RejectInput, RequestService},
        MemberResult,
    },
};

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct BatchReport {
    pub batch_group_id: String,
    pub operation: String,
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub results: Vec<MemberResult>,
}

impl BatchReport {
    fn new(batch_group_id: &str, operation: &str, results: Vec<MemberResult>) -> Self {
        let succeeded = results.iter().filter(|r| r.ok).count();
        Self {
            batch_group_id: batch_group_id.to_string(),
            operation: operation.to_string(),
            attempted: results.len(),
            succeeded,
            failed: results.len() - succeeded,
            results,
        }
    }

    /// At least one member went through.
    pub fn is_success(&self) -> bool {
        self.succeeded > 0
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct BatchSummary {
    pub batch_group_id: String,
    pub kind: RequestKind,
    pub user_id: i32,
    pub token: String,
    pub members: Vec<supply_request::Model>,
    /// Member count per request status
    pub status_counts: BTreeMap<String, usize>,
    pub loans: Vec<borrowed_item::Model>,
    pub outstanding_loans: usize,
}

/// Outcome for a batch return: one default, optionally overridden per loan.
#[derive(Debug, Clone, Default, Deserialize, Validate, ToSchema)]
pub struct BatchReturnInput {
    pub return_status: Option<ReturnStatus>,
    #[serde(default)]
    pub per_loan: HashMap<i32, ReturnStatus>,
    #[validate(length(max = 1000))]
    pub note: Option<String>,
}

#[derive(Clone)]
pub struct BatchCoordinator {
    db_pool: Arc<DbPool>,
    requests: RequestService,
    loans: LoanService,
}

impl BatchCoordinator {
    pub fn new(db_pool: Arc<DbPool>, requests: RequestService, loans: LoanService) -> Self {
        Self {
            db_pool,
            requests,
            loans,
        }
    }

    async fn members(
        &self,
        batch_group_id: &str,
    ) -> Result<Vec<supply_request::Model>, ServiceError> {
        let members = SupplyRequest::find()
            .filter(supply_request::Column::BatchGroupId.eq(batch_group_id))
            .order_by_asc(supply_request::Column::Id)
            .all(self.db_pool.as_ref())
            .await?;
        if members.is_empty() {
            return Err(ServiceError::NotFound(format!(
                "Batch {} not found",
                batch_group_id
            )));
        }
        Ok(members)
    }

    pub async fn batch_summary(&self, batch_group_id: &str) -> Result<BatchSummary, ServiceError> {
        let members = self.members(batch_group_id).await?;
        let first = &members[0];

        let mut status_counts = BTreeMap::new();
        for member in &members {
            *status_counts.entry(member.status.to_string()).or_insert(0) += 1;
        }

        let loans = loans::for_batch(self.db_pool.as_ref(), batch_group_id).await?;
        let outstanding_loans = loans.iter().filter(|l| l.is_outstanding()).count();

        Ok(BatchSummary {
            batch_group_id: batch_group_id.to_string(),
            kind: first.kind,
            user_id: first.user_id,
            token: ScanToken::for_batch(first.kind, batch_group_id)?.to_string(),
            status_counts,
            members,
            loans,
            outstanding_loans,
        })
    }

    /// Approves every member on its own; already-decided members are
    /// reported as failures.
    #[instrument(skip(self))]
    pub async fn approve_batch(
        &self,
        batch_group_id: &str,
        actor: Actor,
    ) -> Result<BatchReport, ServiceError> {
        let members = self.members(batch_group_id).await?;
        let mut results = Vec::with_capacity(members.len());
        for member in members {
            results.push(match self.requests.approve_single(member.id, actor).await {
                Ok(updated) => MemberResult::succeeded(updated.id, updated.status),
                Err(e) => MemberResult::failed(member.id, Some(member.status.to_string()), &e),
            });
        }
        Ok(self.finish(batch_group_id, "approve", results))
    }

    #[instrument(skip(self, input))]
    pub async fn reject_batch(
        &self,
        batch_group_id: &str,
        input: RejectInput,
        actor: Actor,
    ) -> Result<BatchReport, ServiceError> {
        input.validate()?;
        let members = self.members(batch_group_id).await?;
        let mut results = Vec::with_capacity(members.len());
        for member in members {
            results.push(
                match self.requests.reject(member.id, input.clone(), actor).await {
                    Ok(updated) => MemberResult::succeeded(updated.id, updated.status),
                    Err(e) => {
                        MemberResult::failed(member.id, Some(member.status.to_string()), &e)
                    }
                },
            );
        }
        Ok(self.finish(batch_group_id, "reject", results))
    }

    /// Releases every member; a member short of stock fails alone.
    #[instrument(skip(self))]
    pub async fn release_batch(
        &self,
        batch_group_id: &str,
        actor: Actor,
    ) -> Result<BatchReport, ServiceError> {
        let members = self.members(batch_group_id).await?;
        let mut results = Vec::with_capacity(members.len());
        for member in members {
            results.push(match self.requests.release(member.id, actor).await {
                Ok(outcome) => MemberResult::succeeded(outcome.request.id, outcome.request.status),
                Err(e) => MemberResult::failed(member.id, Some(member.status.to_string()), &e),
            });
        }
        Ok(self.finish(batch_group_id, "release", results))
    }

    /// Returns every outstanding loan of the batch. Results are keyed by
    /// loan id.
    #[instrument(skip(self, input))]
    pub async fn return_batch(
        &self,
        batch_group_id: &str,
        input: BatchReturnInput,
        actor: Actor,
    ) -> Result<BatchReport, ServiceError> {
        input.validate()?;
        self.members(batch_group_id).await?;

        let outstanding: Vec<_> = loans::for_batch(self.db_pool.as_ref(), batch_group_id)
            .await?
            .into_iter()
            .filter(|l| l.is_outstanding())
            .collect();
        if outstanding.is_empty() {
            return Err(ServiceError::AlreadyProcessed(format!(
                "batch {} has no outstanding loans",
                batch_group_id
            )));
        }

        let mut results = Vec::with_capacity(outstanding.len());
        for loan in outstanding {
            let Some(outcome) = input
                .per_loan
                .get(&loan.id)
                .copied()
                .or(input.return_status)
            else {
                let err = ServiceError::InvalidInput(format!(
                    "no return status given for loan {}",
                    loan.id
                ));
                results.push(MemberResult::failed(loan.id, Some("outstanding".into()), &err));
                continue;
            };

            let result = self
                .loans
                .process_return(
                    loan.id,
                    ReturnLoanInput {
                        return_status: outcome,
                        note: input.note.clone(),
                    },
                    actor,
                )
                .await;
            results.push(match result {
                Ok(_) => MemberResult::succeeded(loan.id, outcome),
                Err(e) => MemberResult::failed(loan.id, Some("outstanding".into()), &e),
            });
        }
        Ok(self.finish(batch_group_id, "return", results))
    }

    fn finish(&self, batch_group_id: &str, operation: &str, results: Vec<MemberResult>) -> BatchReport {
        let report = BatchReport::new(batch_group_id, operation, results);
        if report.is_success() {
            info!(
                batch_group_id,
                operation,
                succeeded = report.succeeded,
                failed = report.failed,
                "batch operation finished"
            );
        } else {
            warn!(
                batch_group_id,
                operation,
                failed = report.failed,
                "batch operation failed for every member"
            );
        }
        report
    }
}
