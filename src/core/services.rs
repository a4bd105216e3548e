//! Implementations for the service the app needs.
//!

use crate::config::ChatConfig;
use crate::core::controller::{ChatController, ChatDependencies, ChatHandle, ChatOptions};
use crate::core::error::{ChatError, RepositoryError};
use crate::core::models::{Identity, Product};
use crate::core::traits::MarketplaceService;
use crate::infrastructure::realtime::ChangeFeed;
use crate::infrastructure::traits::{
    ConversationRepository, MessageRepository, ObjectStorage, ProductRepository,
};
use async_trait::async_trait;
use di::{Ref, injectable};
use log::info;
use uuid::Uuid;

#[injectable(MarketplaceService)]
pub struct MyMarketplaceService {
    conversations: Ref<dyn ConversationRepository>,
    messages: Ref<dyn MessageRepository>,
    products: Ref<dyn ProductRepository>,
    storage: Ref<dyn ObjectStorage>,
    feed: Ref<ChangeFeed>,
    config: Ref<ChatConfig>,
}

impl MyMarketplaceService {
    fn dependencies(&self) -> ChatDependencies {
        ChatDependencies {
            conversations: self.conversations.clone(),
            messages: self.messages.clone(),
            transport: self.feed.clone(),
            storage: self.storage.clone(),
        }
    }
}

#[async_trait]
impl MarketplaceService for MyMarketplaceService {
    async fn start_chat(&self, user: &Identity) -> Result<ChatHandle, ChatError> {
        let handle = ChatController::spawn(self.dependencies(), ChatOptions::from(&*self.config));
        handle.initialize(user.id).await?;
        info!("chat started for {} ({})", user.display_name, user.role);
        Ok(handle)
    }

    async fn list_products(&self, seller_id: Option<Uuid>) -> Result<Vec<Product>, RepositoryError> {
        self.products.list_products(seller_id).await
    }

    async fn create_product_unchecked(
        &self,
        seller_id: Uuid,
        title: String,
        price_cents: i64,
    ) -> Result<Product, RepositoryError> {
        self.products
            .create_product(seller_id, title, price_cents, None)
            .await
    }
}
