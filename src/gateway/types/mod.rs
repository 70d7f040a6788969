//! Gateway types
//!
//! Inbound events are deserialized straight into
//! [`PaymentEvent`](crate::escrow::PaymentEvent); outbound data goes through
//! the DTOs in [`response`], which render minor-unit amounts as decimal
//! strings.

pub mod response;

pub use response::{
    AcceptedData, ActivityData, ApiResponse, BalanceData, FundData, HealthData, ParkedEventData,
    PayoutData, error_codes,
};
