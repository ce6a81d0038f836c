//! Subscription saga behavior through the public API.

use backstop::{
    subscription_saga, SagaContext, SagaOutcome, SimulatedSubscriptionServices, StepError,
    SubscriptionServices,
};
use serde_json::json;
use std::sync::Arc;

/// Delegates everything to the simulator except invoice creation, which
/// always fails.
struct FailingInvoiceBackend;

#[async_trait::async_trait]
impl SubscriptionServices for FailingInvoiceBackend {
    async fn validate_quote(&self, ctx: SagaContext) -> Result<SagaContext, StepError> {
        SimulatedSubscriptionServices.validate_quote(ctx).await
    }

    async fn create_policy(&self, ctx: SagaContext) -> Result<SagaContext, StepError> {
        SimulatedSubscriptionServices.create_policy(ctx).await
    }

    async fn cancel_policy(&self, ctx: SagaContext) -> Result<(), StepError> {
        SimulatedSubscriptionServices.cancel_policy(ctx).await
    }

    async fn create_invoice(&self, _ctx: SagaContext) -> Result<SagaContext, StepError> {
        Err("billing service rejected the invoice".into())
    }

    async fn cancel_invoice(&self, ctx: SagaContext) -> Result<(), StepError> {
        SimulatedSubscriptionServices.cancel_invoice(ctx).await
    }

    async fn generate_documents(&self, ctx: SagaContext) -> Result<SagaContext, StepError> {
        SimulatedSubscriptionServices.generate_documents(ctx).await
    }

    async fn delete_documents(&self, ctx: SagaContext) -> Result<(), StepError> {
        SimulatedSubscriptionServices.delete_documents(ctx).await
    }

    async fn send_notifications(&self, ctx: SagaContext) -> Result<SagaContext, StepError> {
        SimulatedSubscriptionServices.send_notifications(ctx).await
    }
}

#[tokio::test]
async fn successful_subscription_produces_a_complete_context() {
    let saga = subscription_saga(Arc::new(SimulatedSubscriptionServices));
    let mut initial = SagaContext::new();
    initial.insert("quote_id", json!("Q-2024-001"));

    let report = saga.execute(initial).await;

    assert_eq!(report.status, SagaOutcome::Completed);
    assert!(report.saga_id.starts_with("SAGA-"));
    assert!(report.context.get_str("policy_id").is_some());
    assert!(report.context.get_str("invoice_id").is_some());
    assert_eq!(report.context.get("notifications_sent"), Some(&json!(true)));
    assert!(report.error.is_none());
}

#[tokio::test]
async fn invoice_failure_rolls_back_to_policy_only() {
    let saga = subscription_saga(Arc::new(FailingInvoiceBackend))
        .with_sleeper(backstop::InstantSleeper);

    let report = saga.execute(SagaContext::new()).await;

    assert_eq!(report.status, SagaOutcome::Compensated);
    assert_eq!(report.failed_step.as_deref(), Some("create_invoice"));
    // validate_quote completed too, but it has no compensation to record.
    assert_eq!(report.compensated_steps, vec!["create_policy".to_string()]);
    assert!(report
        .error
        .as_deref()
        .unwrap_or_default()
        .contains("billing service rejected the invoice"));

    let execution = saga.get_execution(&report.saga_id).expect("execution retained");
    assert_eq!(
        execution.steps_completed,
        vec!["validate_quote".to_string(), "create_policy".to_string()]
    );
}

#[tokio::test]
async fn reports_carry_unique_saga_ids() {
    let saga = subscription_saga(Arc::new(SimulatedSubscriptionServices));
    let a = saga.execute(SagaContext::new()).await;
    let b = saga.execute(SagaContext::new()).await;
    assert_ne!(a.saga_id, b.saga_id);
    assert_eq!(saga.all_executions().len(), 2);
}
