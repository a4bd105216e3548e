//! DI "Interfaces"

use crate::core::controller::ChatHandle;
use crate::core::error::{ChatError, RepositoryError};
use crate::core::models::{Identity, Product, Role};
use async_trait::async_trait;
use uuid::Uuid;

#[async_trait]
pub trait MarketplaceService: Send + Sync {
    /// Starts a chat controller for `user` and begins loading its conversation list.
    ///
    /// The controller runs until every clone of the returned handle is dropped.
    async fn start_chat(&self, user: &Identity) -> Result<ChatHandle, ChatError>;

    /// Lists the catalog, optionally only one seller's products.
    async fn list_products(&self, seller_id: Option<Uuid>) -> Result<Vec<Product>, RepositoryError>;

    /// Lists a product under the given seller.
    ///
    /// Returns `Err(Forbidden)` unless `seller` signed in as a seller.
    async fn create_product(
        &self,
        seller: &Identity,
        title: String,
        price_cents: i64,
    ) -> Result<Product, RepositoryError> {
        if seller.role != Role::Seller {
            return Err(RepositoryError::Forbidden(format!(
                "{} accounts cannot list products",
                seller.role
            )));
        }
        self.create_product_unchecked(seller.id, title, price_cents)
            .await
    }

    /// Lists a product without checking the caller's role.
    ///
    /// The helper `create_product` should be used instead.
    async fn create_product_unchecked(
        &self,
        seller_id: Uuid,
        title: String,
        price_cents: i64,
    ) -> Result<Product, RepositoryError>;
}
