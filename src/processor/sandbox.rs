//! Sandbox processor (feature `mock-api`)
//!
//! In-memory stand-in for the payment processor. Commands succeed unless a
//! result has been scripted; accepted objects are kept so reconciliation
//! queries see them. With an acknowledgement sender attached, the sandbox
//! also emits the asynchronous `transfer_*`/`refund_*` events a real
//! processor would deliver by webhook.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::debug;

use super::{
    PaymentProcessor, ProcessorError, ProcessorPayment, ProcessorRefund, ProcessorTransfer,
    RefundCommand, RemoteStatus, TransferCommand,
};
use crate::escrow::types::{EventKind, PaymentEvent};
use crate::money::Amount;

#[derive(Default)]
struct SandboxState {
    payments: HashMap<String, ProcessorPayment>,
    transfers: Vec<ProcessorTransfer>,
    refunds: Vec<ProcessorRefund>,
    /// Idempotency key -> reference
    accepted: HashMap<String, String>,
    transfer_script: VecDeque<Result<(), ProcessorError>>,
    refund_script: VecDeque<Result<(), ProcessorError>>,
    query_failure: Option<ProcessorError>,
}

#[derive(Default)]
pub struct SandboxProcessor {
    state: Mutex<SandboxState>,
    transfer_calls: AtomicUsize,
    refund_calls: AtomicUsize,
    next_reference: AtomicU64,
    acks: Option<mpsc::UnboundedSender<PaymentEvent>>,
}

impl SandboxProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Emit a success acknowledgement for every accepted command
    pub fn with_acks(mut self, acks: mpsc::UnboundedSender<PaymentEvent>) -> Self {
        self.acks = Some(acks);
        self
    }

    fn state(&self) -> MutexGuard<'_, SandboxState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn reference(&self, prefix: &str) -> String {
        let n = self.next_reference.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{}_sandbox_{}", prefix, n)
    }

    /// Register a captured payment for `retrieve_payment`
    pub fn seed_payment(&self, reference: &str, amount_captured: Amount, currency: &str) {
        self.state().payments.insert(
            reference.to_string(),
            ProcessorPayment {
                reference: reference.to_string(),
                amount_captured,
                currency: currency.to_string(),
                status: RemoteStatus::Succeeded,
            },
        );
    }

    /// Queue the outcome of the next `create_transfer` call
    pub fn script_transfer(&self, result: Result<(), ProcessorError>) {
        self.state().transfer_script.push_back(result);
    }

    /// Queue the outcome of the next `create_refund` call
    pub fn script_refund(&self, result: Result<(), ProcessorError>) {
        self.state().refund_script.push_back(result);
    }

    /// Make every query fail with `error` until cleared
    pub fn fail_queries(&self, error: Option<ProcessorError>) {
        self.state().query_failure = error;
    }

    pub fn set_transfer_status(&self, reference: &str, status: RemoteStatus) {
        if let Some(t) = self
            .state()
            .transfers
            .iter_mut()
            .find(|t| t.reference == reference)
        {
            t.status = status;
        }
    }

    pub fn set_refund_status(&self, reference: &str, status: RemoteStatus) {
        if let Some(r) = self
            .state()
            .refunds
            .iter_mut()
            .find(|r| r.reference == reference)
        {
            r.status = status;
        }
    }

    pub fn transfer_calls(&self) -> usize {
        self.transfer_calls.load(Ordering::SeqCst)
    }

    pub fn refund_calls(&self) -> usize {
        self.refund_calls.load(Ordering::SeqCst)
    }

    pub fn transfers(&self) -> Vec<ProcessorTransfer> {
        self.state().transfers.clone()
    }

    pub fn refunds(&self) -> Vec<ProcessorRefund> {
        self.state().refunds.clone()
    }

    fn acknowledge(
        &self,
        kind: EventKind,
        bounty_id: &str,
        amount: Amount,
        currency: &str,
        reference: &str,
    ) {
        let Some(acks) = &self.acks else {
            return;
        };
        let event = PaymentEvent::new(
            format!("evt_{}", ulid::Ulid::new()),
            bounty_id,
            kind,
            amount,
            currency,
        )
        .reference(reference);
        if acks.send(event).is_err() {
            debug!(reference, "Sandbox acknowledgement receiver closed");
        }
    }

    fn check_queries(&self) -> Result<(), ProcessorError> {
        match &self.state().query_failure {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl PaymentProcessor for SandboxProcessor {
    fn name(&self) -> &'static str {
        "sandbox"
    }

    async fn create_transfer(&self, cmd: &TransferCommand) -> Result<String, ProcessorError> {
        self.transfer_calls.fetch_add(1, Ordering::SeqCst);
        let reference = {
            let mut state = self.state();
            if let Some(Err(e)) = state.transfer_script.pop_front() {
                return Err(e);
            }
            if let Some(existing) = state.accepted.get(&cmd.idempotency_key) {
                return Ok(existing.clone());
            }
            let reference = self.reference("tr");
            state
                .accepted
                .insert(cmd.idempotency_key.clone(), reference.clone());
            state.transfers.push(ProcessorTransfer {
                reference: reference.clone(),
                transfer_group: cmd.transfer_group.clone(),
                destination: cmd.recipient_id.clone(),
                amount: cmd.amount,
                currency: cmd.currency.clone(),
                status: if self.acks.is_some() {
                    RemoteStatus::Succeeded
                } else {
                    RemoteStatus::Pending
                },
            });
            reference
        };

        self.acknowledge(
            EventKind::TransferSucceeded,
            &cmd.bounty_id,
            cmd.amount,
            &cmd.currency,
            &reference,
        );
        Ok(reference)
    }

    async fn create_refund(&self, cmd: &RefundCommand) -> Result<String, ProcessorError> {
        self.refund_calls.fetch_add(1, Ordering::SeqCst);
        let reference = {
            let mut state = self.state();
            if let Some(Err(e)) = state.refund_script.pop_front() {
                return Err(e);
            }
            if let Some(existing) = state.accepted.get(&cmd.idempotency_key) {
                return Ok(existing.clone());
            }
            let reference = self.reference("re");
            state
                .accepted
                .insert(cmd.idempotency_key.clone(), reference.clone());
            state.refunds.push(ProcessorRefund {
                reference: reference.clone(),
                payment_reference: cmd.payment_reference.clone(),
                amount: cmd.amount,
                currency: cmd.currency.clone(),
                status: if self.acks.is_some() {
                    RemoteStatus::Succeeded
                } else {
                    RemoteStatus::Pending
                },
            });
            reference
        };

        self.acknowledge(
            EventKind::RefundSucceeded,
            &cmd.bounty_id,
            cmd.amount,
            &cmd.currency,
            &reference,
        );
        Ok(reference)
    }

    async fn retrieve_payment(
        &self,
        payment_reference: &str,
    ) -> Result<ProcessorPayment, ProcessorError> {
        self.check_queries()?;
        self.state()
            .payments
            .get(payment_reference)
            .cloned()
            .ok_or_else(|| ProcessorError::NotFound(payment_reference.to_string()))
    }

    async fn list_transfers(
        &self,
        transfer_group: &str,
    ) -> Result<Vec<ProcessorTransfer>, ProcessorError> {
        self.check_queries()?;
        Ok(self
            .state()
            .transfers
            .iter()
            .filter(|t| t.transfer_group == transfer_group)
            .cloned()
            .collect())
    }

    async fn list_refunds(
        &self,
        payment_reference: &str,
    ) -> Result<Vec<ProcessorRefund>, ProcessorError> {
        self.check_queries()?;
        Ok(self
            .state()
            .refunds
            .iter()
            .filter(|r| r.payment_reference == payment_reference)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transfer(key: &str) -> TransferCommand {
        TransferCommand {
            bounty_id: "b1".to_string(),
            transfer_group: "bounty_b1".to_string(),
            recipient_id: "bob".to_string(),
            amount: 9_000,
            currency: "usd".to_string(),
            idempotency_key: key.to_string(),
        }
    }

    #[tokio::test]
    async fn test_transfer_accepted_and_listed() {
        let sandbox = SandboxProcessor::new();
        let reference = sandbox.create_transfer(&transfer("p1")).await.unwrap();

        let listed = sandbox.list_transfers("bounty_b1").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].reference, reference);
        assert_eq!(listed[0].status, RemoteStatus::Pending);
        assert_eq!(sandbox.transfer_calls(), 1);
    }

    #[tokio::test]
    async fn test_idempotency_key_reuses_reference() {
        let sandbox = SandboxProcessor::new();
        let first = sandbox.create_transfer(&transfer("p1")).await.unwrap();
        let second = sandbox.create_transfer(&transfer("p1")).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(sandbox.transfers().len(), 1);
        assert_eq!(sandbox.transfer_calls(), 2);
    }

    #[tokio::test]
    async fn test_scripted_failure() {
        let sandbox = SandboxProcessor::new();
        sandbox.script_transfer(Err(ProcessorError::Transient("503".into())));
        assert!(sandbox.create_transfer(&transfer("p1")).await.is_err());
        assert!(sandbox.create_transfer(&transfer("p1")).await.is_ok());
    }

    #[tokio::test]
    async fn test_acknowledgements_emitted() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sandbox = SandboxProcessor::new().with_acks(tx);
        let reference = sandbox.create_transfer(&transfer("p1")).await.unwrap();

        let ack = rx.recv().await.unwrap();
        assert_eq!(ack.kind, EventKind::TransferSucceeded);
        assert_eq!(ack.bounty_id, "b1");
        assert_eq!(ack.amount, 9_000);
        assert_eq!(ack.payload.reference.as_deref(), Some(reference.as_str()));
    }

    #[tokio::test]
    async fn test_unknown_payment_not_found() {
        let sandbox = SandboxProcessor::new();
        sandbox.seed_payment("pi_1", 10_000, "usd");
        assert_eq!(
            sandbox.retrieve_payment("pi_1").await.unwrap().amount_captured,
            10_000
        );
        assert!(matches!(
            sandbox.retrieve_payment("pi_2").await,
            Err(ProcessorError::NotFound(_))
        ));
    }
}
