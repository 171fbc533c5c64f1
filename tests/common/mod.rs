#![allow(dead_code)]

use std::sync::Arc;

use axum::{
    body::{to_bytes, Body},
    http::{header::CONTENT_TYPE, Method, Request, StatusCode},
    Router,
};
use sea_orm::{ActiveModelTrait, EntityTrait, Set};
use serde_json::Value;
use tokio::sync::mpsc;
use tower::ServiceExt;

use supplyroom_api::{
    auth::{Actor, ACTOR_HEADER},
    config::AppConfig,
    db::{self, DbPool},
    entities::{borrowed_item, equipment_instance, supply, supply_request, RequestKind},
    events::{process_events, EventSender},
    handlers::AppServices,
    services::{
        requests::CreateRequestInput,
        supplies::{BulkCreateInstancesInput, CreateSupplyInput},
    },
    AppState,
};

pub const CLERK: Actor = Actor { id: 1 };
pub const BORROWER: Actor = Actor { id: 42 };
pub const OTHER_BORROWER: Actor = Actor { id: 43 };

/// In-memory application: migrated database, running event loop and the
/// full router.
pub struct TestApp {
    pub state: AppState,
    router: Router,
}

impl TestApp {
    pub async fn new() -> Self {
        let pool = db::memory_pool().await.expect("in-memory database");
        let config = AppConfig::new(
            "sqlite::memory:".to_string(),
            "127.0.0.1".to_string(),
            0,
            "test".to_string(),
        );

        let (tx, rx) = mpsc::channel(config.event_channel_capacity);
        tokio::spawn(process_events(rx));

        let state = AppState::new(Arc::new(pool), config, EventSender::new(tx));
        let router = supplyroom_api::app_router(state.clone());
        Self { state, router }
    }

    pub fn services(&self) -> &AppServices {
        &self.state.services
    }

    pub fn db(&self) -> &DbPool {
        self.state.db.as_ref()
    }

    /// Sends one request through the router and decodes the JSON body.
    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        actor: Option<Actor>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(actor) = actor {
            builder = builder.header(ACTOR_HEADER, actor.id.to_string());
        }
        let request = match body {
            Some(json) => builder
                .header(CONTENT_TYPE, "application/json")
                .body(Body::from(json.to_string())),
            None => builder.body(Body::empty()),
        }
        .expect("request");

        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("router is infallible");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("response body");
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).expect("json body")
        };
        (status, json)
    }

    /// A borrowable supply with `instances` tracked units.
    pub async fn equipment(&self, name: &str, quantity: i32, instances: u32) -> supply::Model {
        let supply = self
            .services()
            .supplies
            .create_supply(
                CreateSupplyInput {
                    name: name.to_string(),
                    unit: "pcs".to_string(),
                    quantity,
                    min_stock_level: 0,
                    is_consumable: false,
                    location: Some("Room 101".to_string()),
                    description: None,
                },
                CLERK,
            )
            .await
            .expect("create equipment");

        if instances > 0 {
            self.services()
                .supplies
                .bulk_create_instances(
                    supply.id,
                    BulkCreateInstancesInput {
                        count: instances,
                        prefix: None,
                        brand: Some("Acme".to_string()),
                        model: None,
                        location: None,
                    },
                )
                .await
                .expect("create instances");
        }
        supply
    }

    pub async fn consumable(&self, name: &str, quantity: i32, min_stock_level: i32) -> supply::Model {
        self.services()
            .supplies
            .create_supply(
                CreateSupplyInput {
                    name: name.to_string(),
                    unit: "box".to_string(),
                    quantity,
                    min_stock_level,
                    is_consumable: true,
                    location: None,
                    description: None,
                },
                CLERK,
            )
            .await
            .expect("create consumable")
    }

    pub async fn instances(&self, supply_id: i32) -> Vec<equipment_instance::Model> {
        self.services()
            .supplies
            .list_instances(supply_id)
            .await
            .expect("list instances")
    }

    pub async fn stock(&self, supply_id: i32) -> i32 {
        supply::Entity::find_by_id(supply_id)
            .one(self.db())
            .await
            .expect("load supply")
            .expect("supply exists")
            .quantity
    }

    pub async fn request_row(&self, request_id: i32) -> supply_request::Model {
        supply_request::Entity::find_by_id(request_id)
            .one(self.db())
            .await
            .expect("load request")
            .expect("request exists")
    }

    pub async fn submit(
        &self,
        actor: Actor,
        supply_id: i32,
        kind: RequestKind,
        quantity: i32,
    ) -> supply_request::Model {
        self.services()
            .requests
            .create(
                CreateRequestInput {
                    supply_id,
                    kind,
                    quantity_requested: quantity,
                    purpose: "lab session".to_string(),
                    equipment_instance_id: None,
                    borrow_duration_days: None,
                },
                actor,
            )
            .await
            .expect("create request")
    }

    pub async fn approved(
        &self,
        actor: Actor,
        supply_id: i32,
        kind: RequestKind,
        quantity: i32,
    ) -> supply_request::Model {
        let request = self.submit(actor, supply_id, kind, quantity).await;
        self.services()
            .requests
            .approve(request.id, CLERK)
            .await
            .expect("approve request")
            .request
    }

    /// Moves a loan's deadline into the past.
    pub async fn make_overdue(&self, loan: &borrowed_item::Model, days: i64) {
        let deadline = chrono::Utc::now().date_naive() - chrono::Duration::days(days);
        let mut active: borrowed_item::ActiveModel = loan.clone().into();
        active.borrowed_date = Set(deadline - chrono::Duration::days(3));
        active.return_deadline = Set(Some(deadline));
        active.update(self.db()).await.expect("backdate loan");
    }
}
