//! Shopping cart command API: the operations exposed to clients and the
//! mapping of runtime failures onto client-facing errors.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::actor::Executed;
use crate::cart::{CartCommand, CartError, ShoppingCart, Summary};
use crate::directory::ShardDirectory;
use crate::error::{ExecuteError, StoreError};
use crate::popularity::ItemPopularityStore;

/// One line of a cart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub item_id: String,
    pub quantity: i32,
}

/// Cart as returned to clients, items ordered by item ID.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cart {
    pub items: Vec<Item>,
    pub checked_out: bool,
}

impl From<Summary> for Cart {
    fn from(summary: Summary) -> Self {
        Self {
            items: summary
                .items
                .into_iter()
                .map(|(item_id, quantity)| Item { item_id, quantity })
                .collect(),
            checked_out: summary.checked_out,
        }
    }
}

/// Popularity of one item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemPopularityCount {
    pub item_id: String,
    pub popularity_count: i64,
}

/// Client-facing failure of a service call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServiceError {
    /// The request was rejected or could not be carried out.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The requested cart does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The system did not answer in time or a dependency is down.
    #[error("unavailable: {0}")]
    Unavailable(String),
}

impl From<ExecuteError<CartError>> for ServiceError {
    fn from(err: ExecuteError<CartError>) -> Self {
        match err {
            ExecuteError::Timeout(_) => Self::Unavailable("operation timed out".into()),
            other => Self::InvalidArgument(other.to_string()),
        }
    }
}

/// Cart operations on top of a [`ShardDirectory`] and the popularity read
/// store.
///
/// `Clone` is cheap.
#[derive(Clone)]
pub struct ShoppingCartService {
    carts: ShardDirectory<ShoppingCart>,
    popularity: Arc<dyn ItemPopularityStore>,
    ask_timeout: Duration,
}

impl std::fmt::Debug for ShoppingCartService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShoppingCartService")
            .field("carts", &self.carts)
            .field("ask_timeout", &self.ask_timeout)
            .finish_non_exhaustive()
    }
}

impl ShoppingCartService {
    pub fn new(
        carts: ShardDirectory<ShoppingCart>,
        popularity: Arc<dyn ItemPopularityStore>,
        ask_timeout: Duration,
    ) -> Self {
        Self {
            carts,
            popularity,
            ask_timeout,
        }
    }

    /// The directory commands are routed through.
    pub fn carts(&self) -> &ShardDirectory<ShoppingCart> {
        &self.carts
    }

    async fn ask(&self, cart_id: &str, cmd: CartCommand) -> Result<Cart, ServiceError> {
        let Executed { state, .. } = self.carts.ask(cart_id, cmd, self.ask_timeout).await?;
        Ok(state.summary().into())
    }

    /// Add `quantity` of an item to a cart.
    pub async fn add_item(
        &self,
        cart_id: &str,
        item_id: &str,
        quantity: i32,
    ) -> Result<Cart, ServiceError> {
        tracing::info!(cart_id, item_id, quantity, "add item");
        self.ask(
            cart_id,
            CartCommand::AddItem {
                item_id: item_id.to_owned(),
                quantity,
            },
        )
        .await
    }

    /// Check a cart out.
    pub async fn checkout(&self, cart_id: &str) -> Result<Cart, ServiceError> {
        tracing::info!(cart_id, "checkout");
        self.ask(cart_id, CartCommand::Checkout).await
    }

    /// Current contents of a cart.
    ///
    /// # Errors
    ///
    /// [`ServiceError::NotFound`] if the cart has no items.
    pub async fn get_cart(&self, cart_id: &str) -> Result<Cart, ServiceError> {
        tracing::info!(cart_id, "get cart");
        let cart = self.ask(cart_id, CartCommand::Get).await?;
        if cart.items.is_empty() {
            return Err(ServiceError::NotFound(format!("cart {cart_id} not found")));
        }
        Ok(cart)
    }

    /// How many units of an item have been added to carts so far.
    ///
    /// Eventually consistent with the carts. Items never added report 0.
    pub async fn get_item_popularity(
        &self,
        item_id: &str,
    ) -> Result<ItemPopularityCount, ServiceError> {
        tracing::info!(item_id, "get item popularity");
        let row = match tokio::time::timeout(self.ask_timeout, self.popularity.find_by_id(item_id))
            .await
        {
            Ok(Ok(row)) => row,
            Ok(Err(StoreError::Unavailable(reason))) => return Err(ServiceError::Unavailable(reason)),
            Ok(Err(e)) => return Err(ServiceError::InvalidArgument(e.to_string())),
            Err(_elapsed) => return Err(ServiceError::Unavailable("operation timed out".into())),
        };
        Ok(ItemPopularityCount {
            item_id: item_id.to_owned(),
            popularity_count: row.map_or(0, |r| r.count),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::ShardDirectoryBuilder;
    use crate::popularity::MemoryItemPopularityStore;
    use crate::storage::Persistence;

    fn service() -> (ShoppingCartService, Arc<MemoryItemPopularityStore>) {
        let carts = ShardDirectoryBuilder::new(Persistence::in_memory()).build::<ShoppingCart>();
        let popularity = Arc::new(MemoryItemPopularityStore::new());
        (
            ShoppingCartService::new(carts, popularity.clone(), Duration::from_secs(5)),
            popularity,
        )
    }

    #[test]
    fn summary_converts_to_sorted_cart() {
        let summary = Summary {
            items: [("b".to_string(), 2), ("a".to_string(), 1)].into_iter().collect(),
            checked_out: true,
        };
        let cart = Cart::from(summary);
        assert_eq!(
            cart.items,
            vec![
                Item {
                    item_id: "a".into(),
                    quantity: 1
                },
                Item {
                    item_id: "b".into(),
                    quantity: 2
                },
            ]
        );
        assert!(cart.checked_out);
    }

    #[test]
    fn timeout_maps_to_unavailable() {
        let err: ServiceError = ExecuteError::<CartError>::Timeout(Duration::from_secs(5)).into();
        assert_eq!(err, ServiceError::Unavailable("operation timed out".into()));
    }

    #[test]
    fn rejection_maps_to_invalid_argument_with_message() {
        let err: ServiceError = ExecuteError::Domain(CartError::EmptyCart).into();
        assert_eq!(
            err,
            ServiceError::InvalidArgument("cannot checkout an empty shopping cart".into())
        );
    }

    #[tokio::test]
    async fn add_then_get() {
        let (service, _) = service();
        let cart = service.add_item("cart-1", "foo", 42).await.unwrap();
        assert_eq!(cart.items.len(), 1);
        assert!(!cart.checked_out);

        let cart = service.get_cart("cart-1").await.unwrap();
        assert_eq!(cart.items[0].quantity, 42);
    }

    #[tokio::test]
    async fn unknown_cart_is_not_found() {
        let (service, _) = service();
        let err = service.get_cart("nope").await.unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
    }

    #[tokio::test]
    async fn checkout_then_add_is_invalid() {
        let (service, _) = service();
        service.add_item("cart-1", "foo", 1).await.unwrap();
        let cart = service.checkout("cart-1").await.unwrap();
        assert!(cart.checked_out);

        let err = service.add_item("cart-1", "bar", 1).await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn popularity_defaults_to_zero_and_reports_outage() {
        let (service, store) = service();
        let count = service.get_item_popularity("foo").await.unwrap();
        assert_eq!(count.popularity_count, 0);

        store.set_unavailable(true);
        let err = service.get_item_popularity("foo").await.unwrap_err();
        assert!(matches!(err, ServiceError::Unavailable(_)));
    }
}
