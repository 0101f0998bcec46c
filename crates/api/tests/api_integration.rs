//! Integration tests for the API server.

use std::sync::{Arc, OnceLock};

use api::{AppState, Config, InMemoryBackend, Stores};
use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::RetryPolicy;
use event_bus::{Consumer, ConsumerConfig, InMemoryBroker, Message};
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::{Value, json};
use tower::ServiceExt;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

fn get_metrics_handle() -> PrometheusHandle {
    METRICS_HANDLE
        .get_or_init(|| {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            builder
                .install_recorder()
                .expect("failed to install Prometheus recorder")
        })
        .clone()
}

struct TestApp {
    app: Router,
    state: Arc<AppState<InMemoryBackend>>,
}

impl TestApp {
    async fn new() -> Self {
        let state = AppState::new(
            Stores::in_memory(),
            InMemoryBroker::new(),
            &Config::default(),
        )
        .await
        .unwrap();
        let app = api::create_app(state.clone(), get_metrics_handle());
        Self { app, state }
    }

    async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = if body.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&body).unwrap_or(Value::Null)
        };
        (status, json)
    }

    async fn get(&self, uri: &str) -> (StatusCode, Value) {
        self.send(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
    }

    async fn post(&self, uri: &str, body: Value) -> (StatusCode, Value) {
        self.send(
            Request::builder()
                .method("POST")
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
    }

    async fn receive_stock(&self, product_id: &str, quantity: u32) {
        let (status, _) = self
            .post(
                "/inventory/stock",
                json!({ "productId": product_id, "warehouseId": "WH-1", "quantity": quantity }),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
    }

    async fn place_order(&self, quantity: u32, discount_code: Option<&str>) -> (StatusCode, Value) {
        self.post(
            "/orders",
            json!({
                "items": [{
                    "product_id": "SKU-1",
                    "product_name": "Widget",
                    "quantity": quantity,
                    "unit_price_cents": 2000
                }],
                "discount_code": discount_code
            }),
        )
        .await
    }

    /// Runs the relay and every consumer until no message is left in flight.
    async fn settle(&self) {
        let consumers: Vec<_> = api::workers::registries(&self.state)
            .into_iter()
            .map(|(queue, registry)| {
                Consumer::new(
                    self.state.connection.clone(),
                    Arc::new(registry),
                    ConsumerConfig::new(queue)
                        .with_max_attempts(3)
                        .with_redelivery(RetryPolicy::immediate(3)),
                )
            })
            .collect();

        loop {
            let relayed = self.state.relay.dispatch_pending().await.unwrap();
            let mut handled = 0;
            for consumer in &consumers {
                let summary = consumer.drain().await.unwrap();
                handled += summary.acked + summary.dead_lettered;
            }
            if relayed == 0 && handled == 0 {
                break;
            }
        }
    }
}

#[tokio::test]
async fn test_health_check() {
    let app = TestApp::new().await;

    let (status, json) = app.get("/health").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert_eq!(json["event_bus"], "connected");
}

#[tokio::test]
async fn test_health_reports_bus_outage() {
    let app = TestApp::new().await;
    app.state.broker.set_available(false).await;

    let (status, json) = app.get("/health").await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json["status"], "degraded");
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let app = TestApp::new().await;

    let response = app
        .app
        .clone()
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response.headers()["content-type"].to_str().unwrap();
    assert!(content_type.starts_with("text/plain"));
}

#[tokio::test]
async fn test_place_order_reserves_stock() {
    let app = TestApp::new().await;
    app.receive_stock("SKU-1", 10).await;

    let (status, order) = app.place_order(3, None).await;

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(order["status"], "PendingPayment");
    assert_eq!(order["total_cents"], 6000);
    assert_eq!(order["reservation_ids"].as_array().unwrap().len(), 1);

    let id = order["id"].as_str().unwrap();
    let (status, fetched) = app.get(&format!("/orders/{id}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["order_number"], order["order_number"]);

    let (_, stock) = app.get("/inventory/stock/SKU-1").await;
    assert_eq!(stock[0]["quantity"], 10);
    assert_eq!(stock[0]["reservedQuantity"], 3);

    let (status, events) = app.get(&format!("/orders/{id}/events")).await;
    assert_eq!(status, StatusCode::OK);
    let types: Vec<&str> = events
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["event_type"].as_str().unwrap())
        .collect();
    assert_eq!(types, ["OrderPlaced", "StockReserved"]);
}

#[tokio::test]
async fn test_place_order_without_stock_is_cancelled() {
    let app = TestApp::new().await;
    app.receive_stock("SKU-1", 2).await;

    let (status, order) = app.place_order(5, None).await;

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(order["status"], "Cancelled");
    assert!(
        order["status_reason"]
            .as_str()
            .unwrap()
            .contains("SKU-1")
    );

    let (_, stock) = app.get("/inventory/stock/SKU-1").await;
    assert_eq!(stock[0]["reservedQuantity"], 0);
}

#[tokio::test]
async fn test_place_order_with_invalid_input() {
    let app = TestApp::new().await;

    let (status, _) = app.post("/orders", json!({ "items": [] })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = app
        .post(
            "/orders",
            json!({ "user_id": "not-a-uuid", "items": [] }),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_get_unknown_order() {
    let app = TestApp::new().await;

    let (status, _) = app
        .get("/orders/00000000-0000-0000-0000-000000000000")
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = app.get("/orders/not-a-uuid").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = app
        .get("/orders/00000000-0000-0000-0000-000000000000/events")
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_cancel_order_releases_stock() {
    let app = TestApp::new().await;
    app.receive_stock("SKU-1", 10).await;
    let (_, order) = app.place_order(4, None).await;
    let id = order["id"].as_str().unwrap();

    let (status, _) = app
        .post(&format!("/orders/{id}/cancel"), json!({ "reason": " " }))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, cancelled) = app
        .post(
            &format!("/orders/{id}/cancel"),
            json!({ "reason": "changed my mind", "cancelled_by": "customer" }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(cancelled["status"], "Cancelled");

    let (_, stock) = app.get("/inventory/stock/SKU-1").await;
    assert_eq!(stock[0]["quantity"], 10);
    assert_eq!(stock[0]["reservedQuantity"], 0);
}

#[tokio::test]
async fn test_ship_before_payment_conflicts() {
    let app = TestApp::new().await;
    app.receive_stock("SKU-1", 10).await;
    let (_, order) = app.place_order(1, None).await;
    let id = order["id"].as_str().unwrap();

    let (status, json) = app.post(&format!("/orders/{id}/ship"), json!({})).await;

    assert_eq!(status, StatusCode::CONFLICT);
    assert!(json["error"].is_string());
}

#[tokio::test]
async fn test_payment_callback_confirms_and_ships() {
    let app = TestApp::new().await;
    app.receive_stock("SKU-1", 10).await;
    let (_, order) = app.place_order(2, None).await;
    let id = order["id"].as_str().unwrap();

    let (status, accepted) = app
        .post(
            "/payments/callback",
            json!({ "orderId": id, "status": "succeeded", "transactionId": "txn-1" }),
        )
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert!(accepted["message_id"].is_string());

    app.settle().await;

    let (_, confirmed) = app.get(&format!("/orders/{id}")).await;
    assert_eq!(confirmed["status"], "Confirmed");
    assert_eq!(confirmed["transaction_id"], "txn-1");

    let (_, stock) = app.get("/inventory/stock/SKU-1").await;
    assert_eq!(stock[0]["quantity"], 8);
    assert_eq!(stock[0]["reservedQuantity"], 0);

    let (status, shipped) = app
        .post(
            &format!("/orders/{id}/ship"),
            json!({ "tracking_number": "TRACK-1" }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(shipped["tracking_number"], "TRACK-1");

    let (status, delivered) = app
        .post(&format!("/orders/{id}/deliver"), json!({}))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(delivered["status"], "Delivered");
}

#[tokio::test]
async fn test_payment_failure_callback_releases_stock() {
    let app = TestApp::new().await;
    app.receive_stock("SKU-1", 10).await;
    let (_, order) = app.place_order(2, None).await;
    let id = order["id"].as_str().unwrap();

    let (status, _) = app
        .post(
            "/payments/callback",
            json!({
                "orderId": id,
                "status": "failed",
                "errorMessage": "card declined",
                "failureReason": "insufficient_funds"
            }),
        )
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    app.settle().await;

    let (_, failed) = app.get(&format!("/orders/{id}")).await;
    assert_eq!(failed["status"], "PaymentFailed");
    let (_, stock) = app.get("/inventory/stock/SKU-1").await;
    assert_eq!(stock[0]["reservedQuantity"], 0);
}

#[tokio::test]
async fn test_malformed_payment_callback() {
    let app = TestApp::new().await;

    let (status, _) = app
        .post("/payments/callback", json!({ "orderId": "nope", "status": "succeeded" }))
        .await;

    assert!(status.is_client_error());
}

#[tokio::test]
async fn test_inventory_check_and_reservations() {
    let app = TestApp::new().await;
    app.receive_stock("SKU-1", 5).await;

    let (status, check) = app
        .post(
            "/inventory/check",
            json!({ "items": [{ "productId": "SKU-1", "quantity": 6 }] }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(check["available"], false);
    assert_eq!(check["perItem"][0]["available"], 5);

    let order_id = "6f1c2a52-3d4e-4f5a-8b6c-7d8e9f0a1b2c";
    let reserve = json!({
        "orderId": order_id,
        "items": [{ "productId": "SKU-1", "quantity": 2 }],
        "ttlMinutes": 5
    });
    let (status, receipt) = app.post("/inventory/reservations", reserve.clone()).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(receipt["created"], true);

    let (status, again) = app.post("/inventory/reservations", reserve).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(again["created"], false);

    let (_, held) = app.get(&format!("/inventory/reservations/{order_id}")).await;
    assert_eq!(held.as_array().unwrap().len(), 1);
    assert_eq!(held[0]["status"], "Pending");

    let (status, outcome) = app
        .post(
            &format!("/inventory/reservations/{order_id}/release"),
            json!({}),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(outcome, json!({ "outcome": "applied", "count": 1 }));

    let (_, outcome) = app
        .post(
            &format!("/inventory/reservations/{order_id}/release"),
            json!({}),
        )
        .await;
    assert_eq!(outcome, json!({ "outcome": "notFound" }));
}

#[tokio::test]
async fn test_reservation_beyond_stock_conflicts() {
    let app = TestApp::new().await;
    app.receive_stock("SKU-1", 1).await;

    let (status, _) = app
        .post(
            "/inventory/reservations",
            json!({
                "orderId": "6f1c2a52-3d4e-4f5a-8b6c-7d8e9f0a1b2c",
                "items": [{ "productId": "SKU-1", "quantity": 3 }]
            }),
        )
        .await;

    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_discount_lifecycle() {
    let app = TestApp::new().await;
    app.receive_stock("SKU-1", 10).await;

    let new_discount = json!({
        "code": "save10",
        "name": "Ten percent off",
        "kind": { "type": "percentage", "percent": 10 }
    });
    let (status, discount) = app.post("/discounts", new_discount.clone()).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(discount["code"], "SAVE10");
    let discount_id = discount["id"].as_str().unwrap().to_string();

    let (status, _) = app.post("/discounts", new_discount).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, validation) = app
        .post(
            "/discounts/validate",
            json!({ "code": "SAVE10", "orderAmount": 4000 }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(validation["valid"], true);
    assert_eq!(validation["discountAmount"], 400);

    let (status, validation) = app
        .post(
            "/discounts/validate",
            json!({ "code": "NOPE", "orderAmount": 4000 }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(validation["valid"], false);

    let (status, order) = app.place_order(2, Some("SAVE10")).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(order["discount_cents"], 400);
    assert_eq!(order["total_cents"], 3600);
    let id = order["id"].as_str().unwrap();

    app.post(
        "/payments/callback",
        json!({ "orderId": id, "status": "succeeded", "transactionId": "txn-7" }),
    )
    .await;
    app.settle().await;

    let (status, usage) = app.get(&format!("/discounts/{discount_id}/usage")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(usage["timesUsed"], 1);
    assert_eq!(usage["activeUsages"], 1);
}

#[tokio::test]
async fn test_invalid_discounts_are_rejected() {
    let app = TestApp::new().await;
    app.receive_stock("SKU-1", 10).await;

    let (status, _) = app
        .post(
            "/discounts",
            json!({
                "code": "HALF",
                "name": "Too generous",
                "kind": { "type": "percentage", "percent": 150 }
            }),
        )
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let (status, _) = app.place_order(1, Some("UNKNOWN")).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let (status, _) = app
        .get("/discounts/00000000-0000-0000-0000-000000000000/usage")
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_dead_letters_are_listed() {
    let app = TestApp::new().await;
    let message = Message::builder()
        .message_type("PaymentAuthorized")
        .topic("payment.succeeded")
        .payload(&json!({ "orderId": "6f1c2a52-3d4e-4f5a-8b6c-7d8e9f0a1b2c" }))
        .unwrap()
        .build()
        .unwrap();
    app.state.connection.publish(message).await.unwrap();
    app.settle().await;

    let (status, dead) = app.get("/admin/dead-letters").await;

    assert_eq!(status, StatusCode::OK);
    let dead = dead.as_array().unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0]["queue"], saga::handlers::QUEUE);
    assert_eq!(dead[0]["message"]["message_type"], "PaymentAuthorized");
}
