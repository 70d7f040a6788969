pub mod health;
pub mod helpers;
pub mod query;
pub mod webhook;

pub use health::health_check;
pub use query::{get_activity, get_balance, get_fund, get_payouts};
pub use webhook::{list_parked_events, receive_event};
