//! The shopping cart aggregate.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::aggregate::Aggregate;
use crate::command::CommandContext;

/// State of one shopping cart.
///
/// `items` never holds a zero quantity. `checkout_timestamp` is set once,
/// by the first `CheckedOut` event, and never changes afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShoppingCart {
    /// Quantity per item ID.
    pub items: BTreeMap<String, i32>,
    /// When the cart was checked out, if it was.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkout_timestamp: Option<DateTime<Utc>>,
}

impl ShoppingCart {
    /// Whether the cart has been checked out.
    pub fn is_checked_out(&self) -> bool {
        self.checkout_timestamp.is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn has_item(&self, item_id: &str) -> bool {
        self.items.contains_key(item_id)
    }

    /// Value copy of the cart for replies.
    pub fn summary(&self) -> Summary {
        Summary {
            items: self.items.clone(),
            checked_out: self.is_checked_out(),
        }
    }
}

/// Snapshot of a cart handed back to callers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    /// Quantity per item ID, ordered by item ID.
    pub items: BTreeMap<String, i32>,
    pub checked_out: bool,
}

/// Commands accepted by a cart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CartCommand {
    /// Add `quantity` of an item that is not yet in the cart.
    AddItem { item_id: String, quantity: i32 },
    /// Close the cart for changes.
    Checkout,
    /// Read the cart without changing it.
    Get,
}

/// Events recorded by a cart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum CartEvent {
    ItemAdded {
        cart_id: String,
        item_id: String,
        quantity: i32,
    },
    CheckedOut {
        cart_id: String,
        timestamp: DateTime<Utc>,
    },
}

/// Reasons a cart rejects a command.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CartError {
    #[error("item '{item_id}' was already added to this shopping cart")]
    ItemAlreadyAdded { item_id: String },

    #[error("quantity must be greater than zero")]
    NonPositiveQuantity,

    #[error("cannot checkout an empty shopping cart")]
    EmptyCart,

    #[error("cannot add an item to an already checked out shopping cart")]
    AddAfterCheckout,

    #[error("cannot checkout an already checked out shopping cart")]
    AlreadyCheckedOut,
}

impl Aggregate for ShoppingCart {
    const AGGREGATE_TYPE: &'static str = "ShoppingCart";
    const TAG_PREFIX: &'static str = "carts";

    type Command = CartCommand;
    type DomainEvent = CartEvent;
    type Error = CartError;

    fn handle(
        &self,
        entity_id: &str,
        cmd: Self::Command,
        ctx: &CommandContext,
    ) -> Result<Vec<Self::DomainEvent>, Self::Error> {
        match cmd {
            CartCommand::Get => Ok(vec![]),
            CartCommand::AddItem { .. } if self.is_checked_out() => {
                Err(CartError::AddAfterCheckout)
            }
            CartCommand::Checkout if self.is_checked_out() => Err(CartError::AlreadyCheckedOut),
            CartCommand::AddItem { item_id, quantity } => {
                if self.has_item(&item_id) {
                    return Err(CartError::ItemAlreadyAdded { item_id });
                }
                if quantity <= 0 {
                    return Err(CartError::NonPositiveQuantity);
                }
                Ok(vec![CartEvent::ItemAdded {
                    cart_id: entity_id.to_owned(),
                    item_id,
                    quantity,
                }])
            }
            CartCommand::Checkout => {
                if self.is_empty() {
                    return Err(CartError::EmptyCart);
                }
                Ok(vec![CartEvent::CheckedOut {
                    cart_id: entity_id.to_owned(),
                    timestamp: ctx.issued_at(),
                }])
            }
        }
    }

    fn apply(mut self, event: &Self::DomainEvent) -> Self {
        match event {
            CartEvent::ItemAdded {
                item_id, quantity, ..
            } => {
                if *quantity == 0 {
                    self.items.remove(item_id);
                } else {
                    self.items.insert(item_id.clone(), *quantity);
                }
            }
            CartEvent::CheckedOut { timestamp, .. } => {
                self.checkout_timestamp.get_or_insert(*timestamp);
            }
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn add(item_id: &str, quantity: i32) -> CartCommand {
        CartCommand::AddItem {
            item_id: item_id.into(),
            quantity,
        }
    }

    fn run(cart: ShoppingCart, cmd: CartCommand) -> Result<ShoppingCart, CartError> {
        let events = cart.handle("cart-1", cmd, &CommandContext::default())?;
        Ok(events.iter().fold(cart, |s, e| s.apply(e)))
    }

    #[test]
    fn add_item_records_event_and_updates_summary() {
        let cart = ShoppingCart::default();
        let events = cart
            .handle("cart-1", add("foo", 42), &CommandContext::default())
            .unwrap();
        assert_eq!(
            events,
            vec![CartEvent::ItemAdded {
                cart_id: "cart-1".into(),
                item_id: "foo".into(),
                quantity: 42,
            }]
        );

        let cart = run(cart, add("foo", 42)).unwrap();
        let summary = cart.summary();
        assert_eq!(summary.items.get("foo"), Some(&42));
        assert!(!summary.checked_out);
    }

    #[test]
    fn duplicate_item_is_rejected() {
        let cart = run(ShoppingCart::default(), add("foo", 42)).unwrap();
        let err = run(cart, add("foo", 13)).unwrap_err();
        assert_eq!(
            err,
            CartError::ItemAlreadyAdded {
                item_id: "foo".into()
            }
        );
    }

    #[test]
    fn duplicate_check_precedes_quantity_check() {
        let cart = run(ShoppingCart::default(), add("foo", 1)).unwrap();
        let err = run(cart, add("foo", 0)).unwrap_err();
        assert!(matches!(err, CartError::ItemAlreadyAdded { .. }));
    }

    #[test]
    fn non_positive_quantity_is_rejected() {
        for q in [0, -5] {
            let err = run(ShoppingCart::default(), add("foo", q)).unwrap_err();
            assert_eq!(err, CartError::NonPositiveQuantity);
        }
    }

    #[test]
    fn checkout_uses_context_time() {
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let cart = run(ShoppingCart::default(), add("foo", 1)).unwrap();
        let events = cart
            .handle(
                "cart-1",
                CartCommand::Checkout,
                &CommandContext::default().with_issued_at(at),
            )
            .unwrap();
        assert_eq!(
            events,
            vec![CartEvent::CheckedOut {
                cart_id: "cart-1".into(),
                timestamp: at,
            }]
        );
        let cart = events.iter().fold(cart, |s, e| s.apply(e));
        assert_eq!(cart.checkout_timestamp, Some(at));
        assert!(cart.summary().checked_out);
    }

    #[test]
    fn empty_cart_cannot_check_out() {
        let err = run(ShoppingCart::default(), CartCommand::Checkout).unwrap_err();
        assert_eq!(err, CartError::EmptyCart);
    }

    #[test]
    fn checked_out_cart_rejects_changes() {
        let cart = run(ShoppingCart::default(), add("foo", 1)).unwrap();
        let cart = run(cart, CartCommand::Checkout).unwrap();

        assert_eq!(
            run(cart.clone(), add("bar", 1)).unwrap_err(),
            CartError::AddAfterCheckout
        );
        assert_eq!(
            run(cart, CartCommand::Checkout).unwrap_err(),
            CartError::AlreadyCheckedOut
        );
    }

    #[test]
    fn get_never_produces_events() {
        let cart = run(ShoppingCart::default(), add("foo", 3)).unwrap();
        let events = cart
            .handle("cart-1", CartCommand::Get, &CommandContext::default())
            .unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn first_checkout_timestamp_wins() {
        let first = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let second = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let cart = ShoppingCart::default()
            .apply(&CartEvent::CheckedOut {
                cart_id: "cart-1".into(),
                timestamp: first,
            })
            .apply(&CartEvent::CheckedOut {
                cart_id: "cart-1".into(),
                timestamp: second,
            });
        assert_eq!(cart.checkout_timestamp, Some(first));
    }

    #[test]
    fn zero_quantity_event_removes_item() {
        let cart = ShoppingCart::default()
            .apply(&CartEvent::ItemAdded {
                cart_id: "cart-1".into(),
                item_id: "foo".into(),
                quantity: 2,
            })
            .apply(&CartEvent::ItemAdded {
                cart_id: "cart-1".into(),
                item_id: "foo".into(),
                quantity: 0,
            });
        assert!(cart.is_empty());
    }

    #[test]
    fn events_use_adjacent_tagging() {
        let json = serde_json::to_value(CartEvent::ItemAdded {
            cart_id: "cart-1".into(),
            item_id: "foo".into(),
            quantity: 2,
        })
        .unwrap();
        assert_eq!(json["type"], "ItemAdded");
        assert_eq!(json["data"]["item_id"], "foo");
    }

    #[test]
    fn state_survives_serde() {
        let cart = run(ShoppingCart::default(), add("foo", 3)).unwrap();
        let cart = run(cart, CartCommand::Checkout).unwrap();
        let json = serde_json::to_value(&cart).unwrap();
        let back: ShoppingCart = serde_json::from_value(json).unwrap();
        assert_eq!(back, cart);
    }
}
