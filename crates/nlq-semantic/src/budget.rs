use nlq_core::config::SemanticConfig;
use serde::Serialize;

use crate::error::SemanticError;

/// Prompt allowance split between context and the model's response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TokenBudget {
    total_budget: usize,
    reserved_for_response: usize,
}

impl TokenBudget {
    /// Fails if the reservation is larger than the whole budget.
    pub fn new(total_budget: usize, reserved_for_response: usize) -> Result<Self, SemanticError> {
        if reserved_for_response > total_budget {
            return Err(SemanticError::InvalidBudget {
                total: total_budget,
                reserved: reserved_for_response,
            });
        }
        Ok(Self {
            total_budget,
            reserved_for_response,
        })
    }

    pub fn from_config(config: &SemanticConfig) -> Result<Self, SemanticError> {
        Self::new(config.total_budget, config.reserved_for_response)
    }

    pub fn total_budget(&self) -> usize {
        self.total_budget
    }

    pub fn reserved_for_response(&self) -> usize {
        self.reserved_for_response
    }

    pub fn available_for_context(&self) -> usize {
        self.total_budget - self.reserved_for_response
    }
}
