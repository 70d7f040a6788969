//! Outbound notifications
//!
//! Fire-and-forget: a notification that cannot be delivered is logged and
//! dropped, it never fails the ledger operation that produced it.

use serde::Serialize;
use std::fmt;
use tokio::sync::mpsc;
use tracing::{info, warn};

use super::types::{BountyId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    /// Capture confirmed, funds are in escrow
    FundsHeld,
    /// Transfer to the recipient completed
    PayoutSent,
    /// Refund to the payer completed
    RefundIssued,
    /// An asynchronous transfer/refund failure; a retry is on its way
    PayoutDelayed,
    /// Retry budget exhausted, operator action needed
    PayoutFlagged,
    /// Processor permanently rejected a transfer/refund command
    DispatchFailed,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::FundsHeld => "funds_held",
            NotificationKind::PayoutSent => "payout_sent",
            NotificationKind::RefundIssued => "refund_issued",
            NotificationKind::PayoutDelayed => "payout_delayed",
            NotificationKind::PayoutFlagged => "payout_flagged",
            NotificationKind::DispatchFailed => "dispatch_failed",
        }
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Who a notification is addressed to
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum NotifyTarget {
    User(UserId),
    Operators,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub user_id: UserId,
    pub kind: NotificationKind,
    pub payload: serde_json::Value,
}

impl Notification {
    pub fn new(user_id: impl Into<UserId>, kind: NotificationKind, bounty_id: &BountyId) -> Self {
        Self {
            user_id: user_id.into(),
            kind,
            payload: serde_json::json!({ "bounty_id": bounty_id }),
        }
    }
}

/// Notification service seam
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Writes notifications to the log only
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, n: Notification) {
        info!(
            user_id = %n.user_id,
            kind = %n.kind,
            payload = %n.payload,
            "Notification"
        );
    }
}

/// Forwards notifications to a bounded channel consumer
pub struct ChannelNotifier {
    tx: mpsc::Sender<Notification>,
}

impl Notifier for ChannelNotifier {
    fn notify(&self, n: Notification) {
        if let Err(e) = self.tx.try_send(n) {
            warn!(error = %e, "Notification dropped");
        }
    }
}

/// Create a channel-backed notifier and its receiving end
pub fn notification_channel(buffer: usize) -> (ChannelNotifier, mpsc::Receiver<Notification>) {
    let (tx, rx) = mpsc::channel(buffer);
    (ChannelNotifier { tx }, rx)
}
