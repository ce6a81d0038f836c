//! The insurance subscription saga.
//!
//! A fixed five-step instantiation of [`SagaOrchestrator`]:
//! validate quote, create policy, create invoice, generate documents, send
//! notifications. Validation and notifications have no compensation; the
//! three resource-creating steps each pair with an undo.
//!
//! The steps themselves are injected through [`SubscriptionServices`], so the
//! saga wiring stays independent of how policies, invoices and documents are
//! actually provisioned. [`SimulatedSubscriptionServices`] is an in-memory
//! implementation that mints placeholder ids, suitable for demos and tests.

use super::{SagaContext, SagaOrchestrator, SagaStep, StepError};
use serde_json::{json, Value};
use std::sync::Arc;

/// Backend operations invoked by the subscription saga steps.
///
/// Actions return a context patch merged after the step; compensations are
/// fire-and-forget undos that read whatever the action recorded.
#[async_trait::async_trait]
pub trait SubscriptionServices: Send + Sync {
    async fn validate_quote(&self, ctx: SagaContext) -> Result<SagaContext, StepError>;

    async fn create_policy(&self, ctx: SagaContext) -> Result<SagaContext, StepError>;
    async fn cancel_policy(&self, ctx: SagaContext) -> Result<(), StepError>;

    async fn create_invoice(&self, ctx: SagaContext) -> Result<SagaContext, StepError>;
    async fn cancel_invoice(&self, ctx: SagaContext) -> Result<(), StepError>;

    async fn generate_documents(&self, ctx: SagaContext) -> Result<SagaContext, StepError>;
    async fn delete_documents(&self, ctx: SagaContext) -> Result<(), StepError>;

    async fn send_notifications(&self, ctx: SagaContext) -> Result<SagaContext, StepError>;
}

/// Build the subscription saga over the given services.
///
/// Step order is fixed; retry and timeout defaults come from [`SagaStep`].
pub fn subscription_saga(services: Arc<dyn SubscriptionServices>) -> SagaOrchestrator {
    let validate = services.clone();
    let policy = services.clone();
    let policy_undo = services.clone();
    let invoice = services.clone();
    let invoice_undo = services.clone();
    let documents = services.clone();
    let documents_undo = services.clone();
    let notify = services;

    SagaOrchestrator::new()
        .add_step(SagaStep::new("validate_quote", move |ctx| {
            let s = validate.clone();
            async move { s.validate_quote(ctx).await }
        }))
        .add_step(
            SagaStep::new("create_policy", move |ctx| {
                let s = policy.clone();
                async move { s.create_policy(ctx).await }
            })
            .with_compensation(move |ctx| {
                let s = policy_undo.clone();
                async move { s.cancel_policy(ctx).await }
            }),
        )
        .add_step(
            SagaStep::new("create_invoice", move |ctx| {
                let s = invoice.clone();
                async move { s.create_invoice(ctx).await }
            })
            .with_compensation(move |ctx| {
                let s = invoice_undo.clone();
                async move { s.cancel_invoice(ctx).await }
            }),
        )
        .add_step(
            SagaStep::new("generate_documents", move |ctx| {
                let s = documents.clone();
                async move { s.generate_documents(ctx).await }
            })
            .with_compensation(move |ctx| {
                let s = documents_undo.clone();
                async move { s.delete_documents(ctx).await }
            }),
        )
        .add_step(SagaStep::new("send_notifications", move |ctx| {
            let s = notify.clone();
            async move { s.send_notifications(ctx).await }
        }))
}

/// In-memory services that always succeed, minting placeholder ids in the
/// same shapes a real backend would (`POL-`, `INV-`, `DOC-` prefixes).
#[derive(Debug, Default, Clone, Copy)]
pub struct SimulatedSubscriptionServices;

fn short_id(prefix: &str, len: usize) -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("{prefix}-{}", hex[..len].to_uppercase())
}

#[async_trait::async_trait]
impl SubscriptionServices for SimulatedSubscriptionServices {
    async fn validate_quote(&self, ctx: SagaContext) -> Result<SagaContext, StepError> {
        let quote_id = ctx.get("quote_id").cloned().unwrap_or(Value::Null);
        let mut patch = SagaContext::new();
        patch.insert("quote_validated", json!(true));
        patch.insert("quote_id", quote_id);
        Ok(patch)
    }

    async fn create_policy(&self, _ctx: SagaContext) -> Result<SagaContext, StepError> {
        let mut patch = SagaContext::new();
        patch.insert("policy_id", json!(short_id("POL", 8)));
        Ok(patch)
    }

    async fn cancel_policy(&self, _ctx: SagaContext) -> Result<(), StepError> {
        Ok(())
    }

    async fn create_invoice(&self, _ctx: SagaContext) -> Result<SagaContext, StepError> {
        let mut patch = SagaContext::new();
        patch.insert("invoice_id", json!(short_id("INV", 8)));
        Ok(patch)
    }

    async fn cancel_invoice(&self, _ctx: SagaContext) -> Result<(), StepError> {
        Ok(())
    }

    async fn generate_documents(&self, _ctx: SagaContext) -> Result<SagaContext, StepError> {
        let doc_ids: Vec<String> = (0..3).map(|_| short_id("DOC", 6)).collect();
        let mut patch = SagaContext::new();
        patch.insert("document_ids", json!(doc_ids));
        Ok(patch)
    }

    async fn delete_documents(&self, _ctx: SagaContext) -> Result<(), StepError> {
        Ok(())
    }

    async fn send_notifications(&self, _ctx: SagaContext) -> Result<SagaContext, StepError> {
        let mut patch = SagaContext::new();
        patch.insert("notifications_sent", json!(true));
        Ok(patch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::saga::SagaOutcome;
    use crate::sleeper::InstantSleeper;
    use std::sync::Mutex;

    #[tokio::test]
    async fn happy_path_threads_ids_through_the_context() {
        let saga = subscription_saga(Arc::new(SimulatedSubscriptionServices));
        let mut initial = SagaContext::new();
        initial.insert("quote_id", json!("Q-123"));

        let report = saga.execute(initial).await;

        assert_eq!(report.status, SagaOutcome::Completed);
        assert_eq!(report.context.get("quote_validated"), Some(&json!(true)));
        assert_eq!(report.context.get_str("quote_id"), Some("Q-123"));
        assert!(report.context.get_str("policy_id").unwrap().starts_with("POL-"));
        assert!(report.context.get_str("invoice_id").unwrap().starts_with("INV-"));
        assert_eq!(
            report.context.get("document_ids").and_then(Value::as_array).map(Vec::len),
            Some(3)
        );
        assert_eq!(report.context.get("notifications_sent"), Some(&json!(true)));
    }

    #[tokio::test]
    async fn step_order_is_fixed() {
        let saga = subscription_saga(Arc::new(SimulatedSubscriptionServices));
        assert_eq!(
            saga.step_names(),
            vec![
                "validate_quote",
                "create_policy",
                "create_invoice",
                "generate_documents",
                "send_notifications",
            ]
        );
    }

    /// Services where invoice creation always fails, recording which undos ran.
    struct BrokenInvoiceServices {
        undone: Mutex<Vec<&'static str>>,
    }

    #[async_trait::async_trait]
    impl SubscriptionServices for BrokenInvoiceServices {
        async fn validate_quote(&self, ctx: SagaContext) -> Result<SagaContext, StepError> {
            SimulatedSubscriptionServices.validate_quote(ctx).await
        }

        async fn create_policy(&self, ctx: SagaContext) -> Result<SagaContext, StepError> {
            SimulatedSubscriptionServices.create_policy(ctx).await
        }

        async fn cancel_policy(&self, _ctx: SagaContext) -> Result<(), StepError> {
            self.undone.lock().unwrap().push("cancel_policy");
            Ok(())
        }

        async fn create_invoice(&self, _ctx: SagaContext) -> Result<SagaContext, StepError> {
            Err("invoice backend unavailable".into())
        }

        async fn cancel_invoice(&self, _ctx: SagaContext) -> Result<(), StepError> {
            self.undone.lock().unwrap().push("cancel_invoice");
            Ok(())
        }

        async fn generate_documents(&self, ctx: SagaContext) -> Result<SagaContext, StepError> {
            SimulatedSubscriptionServices.generate_documents(ctx).await
        }

        async fn delete_documents(&self, _ctx: SagaContext) -> Result<(), StepError> {
            self.undone.lock().unwrap().push("delete_documents");
            Ok(())
        }

        async fn send_notifications(&self, ctx: SagaContext) -> Result<SagaContext, StepError> {
            SimulatedSubscriptionServices.send_notifications(ctx).await
        }
    }

    #[tokio::test]
    async fn invoice_failure_compensates_only_the_policy() {
        let services = Arc::new(BrokenInvoiceServices { undone: Mutex::new(Vec::new()) });
        let saga = subscription_saga(services.clone()).with_sleeper(InstantSleeper);

        let report = saga.execute(SagaContext::new()).await;

        assert_eq!(report.status, SagaOutcome::Compensated);
        assert_eq!(report.failed_step.as_deref(), Some("create_invoice"));
        assert_eq!(report.compensated_steps, vec!["create_policy".to_string()]);
        assert_eq!(
            services.undone.lock().unwrap().as_slice(),
            &["cancel_policy"],
            "only the policy undo runs; invoice never existed and documents were never generated"
        );
        assert!(report.context.get_str("policy_id").is_some(), "context keeps the partial state");
    }
}
