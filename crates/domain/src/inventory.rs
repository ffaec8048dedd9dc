//! Per-option stock counters.

use common::OptionId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InventoryError {
    /// Not enough units to deduct.
    #[error("Insufficient stock for option {option_id}: requested {requested}, available {available}")]
    Insufficient {
        option_id: OptionId,
        requested: u32,
        available: u32,
    },

    /// Quantity must be greater than zero.
    #[error("Invalid quantity for option {0}: must be greater than 0")]
    InvalidQuantity(OptionId),
}

/// Available units of one product option.
///
/// Mutate only through a row obtained with the ledger's `inventory_for_update`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inventory {
    pub option_id: OptionId,
    pub available: u32,
}

impl Inventory {
    pub fn new(option_id: OptionId, available: u32) -> Self {
        Self {
            option_id,
            available,
        }
    }

    pub fn has(&self, quantity: u32) -> bool {
        self.available >= quantity
    }

    pub fn deduct(&mut self, quantity: u32) -> Result<(), InventoryError> {
        if quantity == 0 {
            return Err(InventoryError::InvalidQuantity(self.option_id));
        }
        if !self.has(quantity) {
            return Err(InventoryError::Insufficient {
                option_id: self.option_id,
                requested: quantity,
                available: self.available,
            });
        }
        self.available -= quantity;
        Ok(())
    }

    pub fn restore(&mut self, quantity: u32) -> Result<(), InventoryError> {
        if quantity == 0 {
            return Err(InventoryError::InvalidQuantity(self.option_id));
        }
        self.available = self.available.saturating_add(quantity);
        Ok(())
    }
}
