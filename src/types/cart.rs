//! Shopping cart types.

use serde::{Deserialize, Serialize};

use crate::consts::CART_ID;
use crate::serde_utils::deserialize_opt_id;
use crate::sync::Entity;

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CartStatus {
    Empty,
    Active,
}

/// One product line in the cart.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CartLine {
    #[serde(alias = "productId", deserialize_with = "deserialize_opt_id")]
    pub product_id: String,
    #[serde(default)]
    pub quantity: u32,
    #[serde(default, alias = "price")]
    pub unit_price: f64,
}

/// The session's cart. There is exactly one per signed-in user, so its
/// identifier is fixed.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Cart {
    #[serde(default = "default_cart_id")]
    pub id: String,
    #[serde(default, alias = "items")]
    pub lines: Vec<CartLine>,
}

fn default_cart_id() -> String {
    CART_ID.to_string()
}

impl Default for Cart {
    fn default() -> Self {
        Self {
            id: default_cart_id(),
            lines: Vec::new(),
        }
    }
}

impl Cart {
    /// Add `quantity` of a product, merging into an existing line.
    pub fn add(&mut self, product_id: &str, quantity: u32, unit_price: f64) {
        match self.lines.iter_mut().find(|l| l.product_id == product_id) {
            Some(line) => {
                line.quantity = line.quantity.saturating_add(quantity);
                line.unit_price = unit_price;
            }
            None => self.lines.push(CartLine {
                product_id: product_id.to_string(),
                quantity,
                unit_price,
            }),
        }
    }

    pub fn clear(&mut self) {
        self.lines.clear();
    }

    pub fn total(&self) -> f64 {
        self.lines
            .iter()
            .map(|l| l.unit_price * f64::from(l.quantity))
            .sum()
    }

    pub fn item_count(&self) -> u32 {
        self.lines.iter().map(|l| l.quantity).sum()
    }
}

impl Entity for Cart {
    type Status = CartStatus;
    const KIND: &'static str = "cart";

    fn id(&self) -> &str {
        &self.id
    }

    fn status(&self) -> CartStatus {
        if self.lines.is_empty() {
            CartStatus::Empty
        } else {
            CartStatus::Active
        }
    }
}

/// Intent to add a product to the cart. Rapid repeats are merged by the
/// request coalescer before reaching the backend.
#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AddToCart {
    pub product_id: String,
    pub quantity: u32,
    #[serde(skip)]
    pub unit_price: f64,
}

impl AddToCart {
    /// Fold a later click on the same product into this one. Returns the
    /// later intent back when it targets a different product.
    pub fn merge(&mut self, later: AddToCart) -> Option<AddToCart> {
        if later.product_id == self.product_id {
            self.quantity = self.quantity.saturating_add(later.quantity);
            self.unit_price = later.unit_price;
            None
        } else {
            Some(later)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_merges_lines() {
        let mut cart = Cart::default();
        assert_eq!(cart.status(), CartStatus::Empty);
        cart.add("p1", 1, 2.0);
        cart.add("p1", 2, 2.0);
        cart.add("p2", 1, 5.0);
        assert_eq!(cart.lines.len(), 2);
        assert_eq!(cart.item_count(), 4);
        assert!((cart.total() - 11.0).abs() < 1e-9);
        assert_eq!(cart.status(), CartStatus::Active);
    }

    #[test]
    fn test_add_to_cart_merge() {
        let mut first = AddToCart {
            product_id: "p1".into(),
            quantity: 1,
            unit_price: 2.0,
        };
        let same = AddToCart {
            product_id: "p1".into(),
            quantity: 3,
            unit_price: 2.5,
        };
        assert!(first.merge(same).is_none());
        assert_eq!(first.quantity, 4);
        let other = AddToCart {
            product_id: "p2".into(),
            quantity: 1,
            unit_price: 1.0,
        };
        assert!(first.merge(other).is_some());
    }
}
