use chrono::{Duration, Utc};
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, Condition, ConnectionTrait, EntityTrait,
    PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use utoipa::{IntoParams, ToSchema};
use validator::Validate;

use crate::{
    auth::Actor,
    db::DbPool,
    entities::{
        borrowed_item,
        equipment_instance::Entity as EquipmentInstance,
        supply::{self, Entity as Supply},
        supply_request::{self, Entity as SupplyRequest},
        RequestKind, RequestStatus, TransactionType,
    },
    errors::ServiceError,
    events::{Event, EventSender},
    identifiers::{generate_batch_group_id, ScanToken},
    services::{
        allocator,
        ledger::{self, LedgerEntry, LedgerReference, StockMovement},
        loans,
        supplies::SupplyService,
        today,
    },
};

#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
pub struct CreateRequestInput {
    pub supply_id: i32,
    pub kind: RequestKind,
    #[validate(range(min = 1, max = 10000))]
    pub quantity_requested: i32,
    #[validate(length(min = 1, max = 1000))]
    pub purpose: String,
    /// Specific equipment instance asked for
    pub equipment_instance_id: Option<i32>,
    /// Loan length in days; the configured default applies when omitted
    #[validate(range(min = 1, max = 365))]
    pub borrow_duration_days: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
pub struct BatchLineInput {
    pub supply_id: i32,
    #[serde(default = "default_line_quantity")]
    #[validate(range(min = 1, max = 10000))]
    pub quantity: i32,
    pub equipment_instance_id: Option<i32>,
}

fn default_line_quantity() -> i32 {
    1
}

#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
pub struct CreateBatchInput {
    pub kind: RequestKind,
    #[validate(length(min = 1, max = 1000))]
    pub purpose: String,
    #[validate(range(min = 1, max = 365))]
    pub borrow_duration_days: Option<i32>,
    #[validate(length(min = 1, max = 100))]
    pub lines: Vec<BatchLineInput>,
}

#[derive(Debug, Clone, Default, Deserialize, Validate, ToSchema)]
pub struct RejectInput {
    #[validate(length(max = 1000))]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, IntoParams, ToSchema)]
#[into_params(parameter_in = Query)]
pub struct RequestFilter {
    pub user_id: Option<i32>,
    pub status: Option<RequestStatus>,
    pub kind: Option<RequestKind>,
    pub supply_id: Option<i32>,
    pub batch_group_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct RequestDetails {
    pub request: supply_request::Model,
    pub loans: Vec<borrowed_item::Model>,
    pub token: String,
    pub batch_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct BatchCreated {
    pub batch_group_id: String,
    pub token: String,
    pub requests: Vec<supply_request::Model>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ApprovalOutcome {
    pub request: supply_request::Model,
    /// Other pending members of the same batch approved alongside
    pub co_approved: Vec<i32>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ReleaseOutcome {
    pub request: supply_request::Model,
    pub ledger_entry: LedgerEntry,
    pub loans: Vec<borrowed_item::Model>,
    pub allocated_instances: Vec<String>,
    /// Units of an instance-tracked supply released without an instance
    pub shortfall: i32,
    pub substituted_for: Option<String>,
    pub low_stock: bool,
}

/// Request lifecycle: create, approve, reject, release.
#[derive(Clone)]
pub struct RequestService {
    db_pool: Arc<DbPool>,
    event_sender: Arc<EventSender>,
    supplies: SupplyService,
    default_borrow_days: u32,
}

impl RequestService {
    pub fn new(
        db_pool: Arc<DbPool>,
        event_sender: Arc<EventSender>,
        default_borrow_days: u32,
    ) -> Self {
        Self {
            supplies: SupplyService::new(db_pool.clone(), event_sender.clone()),
            db_pool,
            event_sender,
            default_borrow_days,
        }
    }

    #[instrument(skip(self, input), fields(supply_id = input.supply_id, kind = %input.kind))]
    pub async fn create(
        &self,
        input: CreateRequestInput,
        actor: Actor,
    ) -> Result<supply_request::Model, ServiceError> {
        input.validate()?;

        if input.equipment_instance_id.is_some() && input.quantity_requested != 1 {
            return Err(ServiceError::InvalidInput(
                "a request naming an equipment instance must ask for exactly 1 unit".to_string(),
            ));
        }

        let txn = self.db_pool.begin().await?;
        check_line(&txn, input.kind, input.supply_id, input.equipment_instance_id).await?;
        if input.kind == RequestKind::Loan {
            refuse_overdue_borrower(&txn, actor).await?;
        }

        let request = insert_request(
            &txn,
            NewRequest {
                user_id: actor.id,
                supply_id: input.supply_id,
                kind: input.kind,
                quantity: input.quantity_requested,
                purpose: input.purpose.trim().to_string(),
                equipment_instance_id: input.equipment_instance_id,
                borrow_duration_days: input.borrow_duration_days,
                batch_group_id: None,
            },
        )
        .await?;
        txn.commit().await?;

        info!(request_id = request.id, user_id = actor.id, "supply request created");
        self.publish_created(&request).await;
        Ok(request)
    }

    /// Creates one batch of requests under a fresh `batch_group_id`.
    ///
    /// Loan lines naming an instance become one request for that instance;
    /// other loan lines are split into unit requests. Consumption lines map
    /// one-to-one.
    #[instrument(skip(self, input), fields(kind = %input.kind, lines = input.lines.len()))]
    pub async fn create_batch(
        &self,
        input: CreateBatchInput,
        actor: Actor,
    ) -> Result<BatchCreated, ServiceError> {
        input.validate()?;
        for line in &input.lines {
            line.validate()?;
        }

        let txn = self.db_pool.begin().await?;
        if input.kind == RequestKind::Loan {
            refuse_overdue_borrower(&txn, actor).await?;
        }
        let batch_group_id = fresh_batch_group_id(&txn, actor.id).await?;
        let purpose = input.purpose.trim().to_string();

        let mut requests = Vec::new();
        for line in &input.lines {
            check_line(&txn, input.kind, line.supply_id, line.equipment_instance_id).await?;

            let (copies, quantity) = match (input.kind, line.equipment_instance_id) {
                (RequestKind::Loan, Some(_)) => (1, 1),
                (RequestKind::Loan, None) => (line.quantity, 1),
                (RequestKind::Consumption, _) => (1, line.quantity),
            };
            for _ in 0..copies {
                let request = insert_request(
                    &txn,
                    NewRequest {
                        user_id: actor.id,
                        supply_id: line.supply_id,
                        kind: input.kind,
                        quantity,
                        purpose: purpose.clone(),
                        equipment_instance_id: line.equipment_instance_id,
                        borrow_duration_days: input.borrow_duration_days,
                        batch_group_id: Some(batch_group_id.clone()),
                    },
                )
                .await?;
                requests.push(request);
            }
        }
        txn.commit().await?;

        info!(
            batch_group_id = %batch_group_id,
            members = requests.len(),
            "request batch created"
        );
        for request in &requests {
            self.publish_created(request).await;
        }

        Ok(BatchCreated {
            token: ScanToken::for_batch(input.kind, &batch_group_id)?.to_string(),
            batch_group_id,
            requests,
        })
    }

    pub async fn get(&self, request_id: i32) -> Result<RequestDetails, ServiceError> {
        let db = self.db_pool.as_ref();
        let request = find_request(db, request_id).await?;
        let loans = loans::for_request(db, request_id).await?;
        let batch_token = request
            .batch_group_id
            .as_deref()
            .and_then(|id| ScanToken::for_batch(request.kind, id).ok())
            .map(|t| t.to_string());
        Ok(RequestDetails {
            token: ScanToken::for_request(&request).to_string(),
            batch_token,
            request,
            loans,
        })
    }

    pub async fn list(
        &self,
        filter: RequestFilter,
    ) -> Result<Vec<supply_request::Model>, ServiceError> {
        let mut condition = Condition::all();
        if let Some(user_id) = filter.user_id {
            condition = condition.add(supply_request::Column::UserId.eq(user_id));
        }
        if let Some(status) = filter.status {
            condition = condition.add(supply_request::Column::Status.eq(status));
        }
        if let Some(kind) = filter.kind {
            condition = condition.add(supply_request::Column::Kind.eq(kind));
        }
        if let Some(supply_id) = filter.supply_id {
            condition = condition.add(supply_request::Column::SupplyId.eq(supply_id));
        }
        if let Some(batch) = filter.batch_group_id {
            condition = condition.add(supply_request::Column::BatchGroupId.eq(batch));
        }

        Ok(SupplyRequest::find()
            .filter(condition)
            .order_by_desc(supply_request::Column::CreatedAt)
            .order_by_desc(supply_request::Column::Id)
            .all(self.db_pool.as_ref())
            .await?)
    }

    /// Approves a pending request together with every other pending member
    /// of its batch.
    #[instrument(skip(self))]
    pub async fn approve(
        &self,
        request_id: i32,
        actor: Actor,
    ) -> Result<ApprovalOutcome, ServiceError> {
        let txn = self.db_pool.begin().await?;
        let request = approve_in(&txn, request_id, actor).await?;

        let mut co_approved = Vec::new();
        if let Some(batch) = request.batch_group_id.as_deref() {
            let siblings = SupplyRequest::find()
                .filter(supply_request::Column::BatchGroupId.eq(batch))
                .filter(supply_request::Column::Status.eq(RequestStatus::Pending))
                .filter(supply_request::Column::Id.ne(request_id))
                .order_by_asc(supply_request::Column::Id)
                .all(&txn)
                .await?;
            for sibling in siblings {
                approve_in(&txn, sibling.id, actor).await?;
                co_approved.push(sibling.id);
            }
        }
        txn.commit().await?;

        info!(request_id, co_approved = co_approved.len(), "request approved");
        self.event_sender
            .publish(Event::RequestApproved {
                request_id,
                approved_by: actor.id,
                co_approved: co_approved.clone(),
            })
            .await;

        Ok(ApprovalOutcome {
            request,
            co_approved,
        })
    }

    /// Approves exactly one request; batch operations iterate with this.
    pub(crate) async fn approve_single(
        &self,
        request_id: i32,
        actor: Actor,
    ) -> Result<supply_request::Model, ServiceError> {
        let txn = self.db_pool.begin().await?;
        let request = approve_in(&txn, request_id, actor).await?;
        txn.commit().await?;

        self.event_sender
            .publish(Event::RequestApproved {
                request_id,
                approved_by: actor.id,
                co_approved: Vec::new(),
            })
            .await;
        Ok(request)
    }

    /// Rejects one pending request. Other batch members are untouched.
    #[instrument(skip(self, input))]
    pub async fn reject(
        &self,
        request_id: i32,
        input: RejectInput,
        actor: Actor,
    ) -> Result<supply_request::Model, ServiceError> {
        input.validate()?;

        let txn = self.db_pool.begin().await?;
        let request = find_request(&txn, request_id).await?;
        require_status(&request, RequestStatus::Pending)?;

        let reason = input
            .reason
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty());
        let mut active: supply_request::ActiveModel = request.into();
        active.status = Set(RequestStatus::Rejected);
        active.rejected_reason = Set(reason.clone());
        active.approved_by = Set(Some(actor.id));
        active.approved_at = Set(Some(Utc::now()));
        let updated = active.update(&txn).await?;
        txn.commit().await?;

        info!(request_id, "request rejected");
        self.event_sender
            .publish(Event::RequestRejected {
                request_id,
                rejected_by: actor.id,
                reason,
            })
            .await;
        Ok(updated)
    }

    /// Releases an approved request.
    ///
    /// One transaction debits the stock, allocates instances and opens the
    /// loans (loan requests only), and marks the request released. Any
    /// failure rolls the whole release back.
    #[instrument(skip(self))]
    pub async fn release(
        &self,
        request_id: i32,
        actor: Actor,
    ) -> Result<ReleaseOutcome, ServiceError> {
        let txn = self.db_pool.begin().await?;
        let request = SupplyRequest::find_by_id(request_id)
            .lock_exclusive()
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Request {} not found", request_id)))?;

        if request.status.is_released_or_later() {
            return Err(ServiceError::AlreadyProcessed(format!(
                "request {} was already released",
                request_id
            )));
        }
        require_status(&request, RequestStatus::Approved)?;

        let ledger_entry = ledger::apply_delta(
            &txn,
            StockMovement {
                supply_id: request.supply_id,
                delta: -request.quantity_requested,
                transaction_type: TransactionType::Out,
                reason: format!("Released for request #{}", request.id),
                reference: Some(LedgerReference::request(request.id)),
                performed_by: actor,
            },
        )
        .await?;

        let supply = Supply::find_by_id(request.supply_id)
            .one(&txn)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Supply {} not found", request.supply_id))
            })?;

        let (loans, allocated_instances, shortfall, substituted_for) = if request.is_loan() {
            let allocation = allocator::allocate(
                &txn,
                request.supply_id,
                request.quantity_requested,
                request.equipment_instance_id,
            )
            .await?;
            let loans = loans::open_loans(
                &txn,
                &request,
                &supply,
                &allocation,
                self.default_borrow_days,
            )
            .await?;
            let codes = allocation
                .instances
                .iter()
                .map(|i| i.instance_code.clone())
                .collect();
            (loans, codes, allocation.shortfall, allocation.substituted_for)
        } else {
            (Vec::new(), Vec::new(), 0, None)
        };

        let now = Utc::now();
        let marked = SupplyRequest::update_many()
            .col_expr(
                supply_request::Column::Status,
                Expr::value(RequestStatus::Released),
            )
            .col_expr(supply_request::Column::ReleasedBy, Expr::value(actor.id))
            .col_expr(supply_request::Column::ReleasedAt, Expr::value(now))
            .col_expr(supply_request::Column::UpdatedAt, Expr::value(now))
            .filter(supply_request::Column::Id.eq(request_id))
            .filter(supply_request::Column::Status.eq(RequestStatus::Approved))
            .exec(&txn)
            .await?;
        if marked.rows_affected != 1 {
            return Err(ServiceError::AlreadyProcessed(format!(
                "request {} was released concurrently",
                request_id
            )));
        }
        let request = find_request(&txn, request_id).await?;
        txn.commit().await?;

        info!(
            request_id,
            quantity = request.quantity_requested,
            loans = loans.len(),
            shortfall,
            "request released"
        );

        self.event_sender
            .publish(Event::RequestReleased {
                request_id,
                released_by: actor.id,
                quantity: request.quantity_requested,
                loans: loans.len(),
            })
            .await;
        self.event_sender
            .publish(Event::StockAdjusted {
                supply_id: supply.id,
                transaction_id: ledger_entry.id,
                transaction_type: ledger_entry.transaction_type,
                previous_quantity: ledger_entry.previous_quantity,
                new_quantity: ledger_entry.new_quantity,
            })
            .await;
        if shortfall > 0 {
            warn!(request_id, shortfall, "released with an instance shortfall");
            self.event_sender
                .publish(Event::AllocationShortfall {
                    request_id,
                    supply_id: supply.id,
                    requested: request.quantity_requested,
                    allocated: request.quantity_requested - shortfall,
                })
                .await;
        }
        let low_stock = self.supplies.notify_if_low(&supply).await;

        Ok(ReleaseOutcome {
            request,
            ledger_entry,
            loans,
            allocated_instances,
            shortfall,
            substituted_for,
            low_stock,
        })
    }

    async fn publish_created(&self, request: &supply_request::Model) {
        self.event_sender
            .publish(Event::RequestCreated {
                request_id: request.id,
                user_id: request.user_id,
                supply_id: request.supply_id,
                kind: request.kind,
                batch_group_id: request.batch_group_id.clone(),
            })
            .await;
    }
}

struct NewRequest {
    user_id: i32,
    supply_id: i32,
    kind: RequestKind,
    quantity: i32,
    purpose: String,
    equipment_instance_id: Option<i32>,
    borrow_duration_days: Option<i32>,
    batch_group_id: Option<String>,
}

async fn insert_request<C>(conn: &C, new: NewRequest) -> Result<supply_request::Model, ServiceError>
where
    C: ConnectionTrait,
{
    let borrow_duration_days = match new.kind {
        RequestKind::Loan => new.borrow_duration_days,
        RequestKind::Consumption => None,
    };
    let request = supply_request::ActiveModel {
        user_id: Set(new.user_id),
        supply_id: Set(new.supply_id),
        equipment_instance_id: Set(new.equipment_instance_id),
        kind: Set(new.kind),
        quantity_requested: Set(new.quantity),
        purpose: Set(new.purpose),
        borrow_duration_days: Set(borrow_duration_days),
        status: Set(RequestStatus::Pending),
        batch_group_id: Set(new.batch_group_id),
        ..Default::default()
    }
    .insert(conn)
    .await?;
    Ok(request)
}

pub(crate) async fn find_request<C>(
    conn: &C,
    request_id: i32,
) -> Result<supply_request::Model, ServiceError>
where
    C: ConnectionTrait,
{
    SupplyRequest::find_by_id(request_id)
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Request {} not found", request_id)))
}

fn require_status(
    request: &supply_request::Model,
    expected: RequestStatus,
) -> Result<(), ServiceError> {
    if request.status == expected {
        Ok(())
    } else {
        Err(ServiceError::InvalidStatus(format!(
            "request {} is {}, expected {}",
            request.id, request.status, expected
        )))
    }
}

async fn approve_in<C>(
    conn: &C,
    request_id: i32,
    actor: Actor,
) -> Result<supply_request::Model, ServiceError>
where
    C: ConnectionTrait,
{
    let request = find_request(conn, request_id).await?;
    require_status(&request, RequestStatus::Pending)?;

    let mut active: supply_request::ActiveModel = request.into();
    active.status = Set(RequestStatus::Approved);
    active.approved_by = Set(Some(actor.id));
    active.approved_at = Set(Some(Utc::now()));
    Ok(active.update(conn).await?)
}

/// The supply exists, suits the request kind, and a named instance belongs
/// to it. Consumables are only consumed; equipment is only lent.
async fn check_line<C>(
    conn: &C,
    kind: RequestKind,
    supply_id: i32,
    equipment_instance_id: Option<i32>,
) -> Result<supply::Model, ServiceError>
where
    C: ConnectionTrait,
{
    let supply = Supply::find_by_id(supply_id)
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Supply {} not found", supply_id)))?;

    match (kind, supply.is_consumable) {
        (RequestKind::Loan, true) => {
            return Err(ServiceError::InvalidInput(format!(
                "{} is a consumable and cannot be borrowed",
                supply.name
            )));
        }
        (RequestKind::Consumption, false) => {
            return Err(ServiceError::InvalidInput(format!(
                "{} is equipment and can only be borrowed",
                supply.name
            )));
        }
        _ => {}
    }

    if let Some(instance_id) = equipment_instance_id {
        let instance = EquipmentInstance::find_by_id(instance_id)
            .one(conn)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Equipment instance {} not found", instance_id))
            })?;
        if instance.supply_id != supply_id {
            return Err(ServiceError::InvalidInput(format!(
                "instance {} does not belong to {}",
                instance.instance_code, supply.name
            )));
        }
    }
    Ok(supply)
}

async fn refuse_overdue_borrower<C>(conn: &C, actor: Actor) -> Result<(), ServiceError>
where
    C: ConnectionTrait,
{
    if loans::has_overdue(conn, actor.id, today()).await? {
        return Err(ServiceError::InvalidOperation(format!(
            "user {} has overdue loans and cannot borrow until they are returned",
            actor.id
        )));
    }
    Ok(())
}

/// `{user}-{timestamp}` not yet used by any request.
async fn fresh_batch_group_id<C>(conn: &C, user_id: i32) -> Result<String, ServiceError>
where
    C: ConnectionTrait,
{
    let mut at = Utc::now();
    loop {
        let candidate = generate_batch_group_id(user_id, at);
        let taken = SupplyRequest::find()
            .filter(supply_request::Column::BatchGroupId.eq(candidate.as_str()))
            .count(conn)
            .await?;
        if taken == 0 {
            return Ok(candidate);
        }
        at += Duration::milliseconds(1);
    }
}
