//! Database and schema tests
//!
//! Tests SQLite migrations, entity storage, and schema constraints

mod common;

use common::{at, seed_conversation, seed_message, seed_product, seed_profile, setup_test_db};
use market_chat::core::error::RepositoryError;
use market_chat::infrastructure::entities;
use uuid::Uuid;

#[tokio::test]
async fn test_database_migrations_work() {
    let pool = setup_test_db().await;

    let tables: Vec<String> =
        sqlx::query_scalar("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .fetch_all(&pool)
            .await
            .unwrap();

    for table in ["auth_sessions", "conversations", "messages", "products", "profiles"] {
        assert!(tables.iter().any(|t| t == table), "missing table {table}");
    }
}

#[tokio::test]
async fn test_uuid_and_timestamp_storage_in_sqlite() {
    let pool = setup_test_db().await;
    let buyer = seed_profile(&pool, "Bea", "buyer").await;
    let seller = seed_profile(&pool, "Sam", "seller").await;
    let conversation_id = seed_conversation(&pool, buyer, seller, None, at(5)).await;

    let row: entities::Conversation = sqlx::query_as(
        "SELECT id, buyer_id, seller_id, product_id, last_message, last_message_at, last_sender_id, created_at FROM conversations WHERE id = ?",
    )
    .bind(conversation_id)
    .fetch_one(&pool)
    .await
    .unwrap();

    assert_eq!(row.id, conversation_id);
    assert_eq!(row.buyer_id, buyer);
    assert_eq!(row.seller_id, seller);
    assert_eq!(row.product_id, None);
    assert_eq!(row.last_message, None);
    assert_eq!(row.created_at, at(5));
}

#[tokio::test]
async fn test_unknown_role_is_rejected() {
    let pool = setup_test_db().await;

    let result = sqlx::query(
        "INSERT INTO profiles (id, display_name, email, role, password_hash, created_at) VALUES (?, 'X', 'x@example.com', 'courier', '', ?)",
    )
    .bind(Uuid::new_v4())
    .bind(at(0))
    .execute(&pool)
    .await;

    let error = RepositoryError::from(result.unwrap_err());
    assert!(matches!(error, RepositoryError::Validation(_)));
    assert_eq!(error.status(), 422);
}

#[tokio::test]
async fn test_conversation_key_is_unique() {
    let pool = setup_test_db().await;
    let buyer = seed_profile(&pool, "Bea", "buyer").await;
    let seller = seed_profile(&pool, "Sam", "seller").await;
    let product = seed_product(&pool, seller, "Bike", 12_000).await;

    seed_conversation(&pool, buyer, seller, Some(product), at(0)).await;
    seed_conversation(&pool, buyer, seller, None, at(1)).await;

    for product_id in [Some(product), None] {
        let duplicate = sqlx::query(
            "INSERT INTO conversations (id, buyer_id, seller_id, product_id, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(Uuid::new_v4())
        .bind(buyer)
        .bind(seller)
        .bind(product_id)
        .bind(at(2))
        .execute(&pool)
        .await;
        assert!(duplicate.is_err(), "duplicate allowed for {product_id:?}");
    }
}

#[tokio::test]
async fn test_blank_message_is_rejected_by_schema() {
    let pool = setup_test_db().await;
    let buyer = seed_profile(&pool, "Bea", "buyer").await;
    let seller = seed_profile(&pool, "Sam", "seller").await;
    let conversation_id = seed_conversation(&pool, buyer, seller, None, at(0)).await;

    let result = sqlx::query(
        "INSERT INTO messages (id, conversation_id, sender_id, body, attachment_url, created_at) VALUES (?, ?, ?, '', NULL, ?)",
    )
    .bind(Uuid::new_v4())
    .bind(conversation_id)
    .bind(buyer)
    .bind(at(1))
    .execute(&pool)
    .await;

    assert!(result.is_err());
}

#[tokio::test]
async fn test_conversation_cascade_delete() {
    let pool = setup_test_db().await;
    let buyer = seed_profile(&pool, "Bea", "buyer").await;
    let seller = seed_profile(&pool, "Sam", "seller").await;
    let conversation_id = seed_conversation(&pool, buyer, seller, None, at(0)).await;
    seed_message(&pool, conversation_id, buyer, "Test", at(1)).await;

    sqlx::query("DELETE FROM conversations WHERE id = ?")
        .bind(conversation_id)
        .execute(&pool)
        .await
        .unwrap();

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE conversation_id = ?")
        .bind(conversation_id)
        .fetch_one(&pool)
        .await
        .unwrap();

    assert_eq!(count, 0);
}

#[tokio::test]
async fn test_row_not_found_maps_to_not_found() {
    let error = RepositoryError::from(sqlx::Error::RowNotFound);

    assert!(matches!(error, RepositoryError::NotFound(_)));
    assert_eq!(error.status(), 404);
    assert!(!error.is_retryable());
}
