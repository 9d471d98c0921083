use rust_decimal::Decimal;
use validator::{ValidationError, ValidationErrors};

use crate::error::Error;

pub mod account;
pub mod auth;
pub mod expense;
pub mod export;
pub mod membership;
pub mod payment;
pub mod plan;
pub mod receipt;
pub mod report;
pub mod token;

/// Rejects negative money fields with a regular validation error.
pub fn validate_non_negative(fields: &[(&'static str, Decimal)]) -> Result<(), Error> {
    let mut errors = ValidationErrors::new();

    for (field, value) in fields {
        if *value < Decimal::ZERO {
            let mut error = ValidationError::new("non_negative");
            error.message = Some("must not be negative".into());
            errors.add(*field, error);
        }
    }

    if errors.errors().is_empty() {
        Ok(())
    } else {
        Err(errors.into())
    }
}
