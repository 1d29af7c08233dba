use bigdecimal::BigDecimal;
use mockito::Matcher;
use serde_json::json;
use std::str::FromStr;
use uuid::Uuid;

use settlement_core::domain::TransactionStatus;
use settlement_core::error::SettlementError;
use settlement_core::marketplace::{MarketplaceClient, OrderDirectory, SellerDirectory};

#[tokio::test]
async fn test_is_delivered() {
    let mut server = mockito::Server::new_async().await;
    let order_id = Uuid::new_v4();
    server
        .mock("GET", format!("/orders/{}/delivery", order_id).as_str())
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"delivered":true}"#)
        .create_async()
        .await;

    let client = MarketplaceClient::new(server.url());
    assert!(client.is_delivered(order_id).await.unwrap());
}

#[tokio::test]
async fn test_unknown_order_is_not_found() {
    let mut server = mockito::Server::new_async().await;
    let order_id = Uuid::new_v4();
    server
        .mock("GET", format!("/orders/{}/items", order_id).as_str())
        .with_status(404)
        .create_async()
        .await;

    let err = MarketplaceClient::new(server.url())
        .order_items(order_id)
        .await
        .unwrap_err();
    assert!(matches!(err, SettlementError::NotFound(_)));
}

#[tokio::test]
async fn test_order_items_are_decoded() {
    let mut server = mockito::Server::new_async().await;
    let order_id = Uuid::new_v4();
    let seller_id = Uuid::new_v4();
    server
        .mock("GET", format!("/orders/{}/items", order_id).as_str())
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            json!([{ "seller_id": seller_id, "unit_price": "50.00", "quantity": 2, "currency": "usd" }])
                .to_string(),
        )
        .create_async()
        .await;

    let lines = MarketplaceClient::new(server.url())
        .order_items(order_id)
        .await
        .unwrap();
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0].seller_id, seller_id);
    assert_eq!(lines[0].unit_price, BigDecimal::from_str("50.00").unwrap());
}

#[tokio::test]
async fn test_seller_without_destination() {
    let mut server = mockito::Server::new_async().await;
    let seller_id = Uuid::new_v4();
    server
        .mock("GET", format!("/sellers/{}/payout-destination", seller_id).as_str())
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"account_id":null}"#)
        .create_async()
        .await;

    let destination = MarketplaceClient::new(server.url())
        .payout_destination(seller_id)
        .await
        .unwrap();
    assert_eq!(destination, None);
}

#[tokio::test]
async fn test_settlement_status_notification() {
    let mut server = mockito::Server::new_async().await;
    let order_id = Uuid::new_v4();
    let seller_id = Uuid::new_v4();
    let mock = server
        .mock("POST", format!("/orders/{}/settlement-status", order_id).as_str())
        .match_body(Matcher::Json(json!({ "seller_id": seller_id, "status": "released" })))
        .with_status(204)
        .create_async()
        .await;

    MarketplaceClient::new(server.url())
        .notify_settlement_status(order_id, seller_id, TransactionStatus::Released)
        .await
        .unwrap();
    mock.assert_async().await;
}

#[tokio::test]
async fn test_server_error_is_collaborator_failure() {
    let mut server = mockito::Server::new_async().await;
    let order_id = Uuid::new_v4();
    server
        .mock("GET", format!("/orders/{}/amount-due", order_id).as_str())
        .with_status(500)
        .with_body("boom")
        .create_async()
        .await;

    let err = MarketplaceClient::new(server.url())
        .amount_due(order_id)
        .await
        .unwrap_err();
    assert!(matches!(err, SettlementError::Collaborator(_)));
}
