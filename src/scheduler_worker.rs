use crate::{
    configuration::Settings,
    orchestrator::{CampaignError, CampaignOrchestrator},
    startup::build_orchestrator,
    store::Store,
};
use std::{sync::Arc, time::Duration};
use time::OffsetDateTime;
use tracing::Span;

pub async fn run_worker_until_stopped(
    config: Settings,
    store: Arc<dyn Store>,
) -> Result<(), anyhow::Error> {
    let orchestrator = build_orchestrator(&config, store)?;
    worker_loop(&orchestrator, config.delivery.scheduler_poll_interval()).await
}

async fn worker_loop(
    orchestrator: &CampaignOrchestrator,
    poll_interval: Duration,
) -> Result<(), anyhow::Error> {
    loop {
        match try_execute_task(orchestrator).await {
            Ok(ExecutionOutcome::TaskCompleted) => {}
            Ok(ExecutionOutcome::EmptyQueue) => tokio::time::sleep(poll_interval).await,
            Err(_) => tokio::time::sleep(Duration::from_secs(1)).await,
        }
    }
}

/// Sends the oldest due campaign, if any.
#[tracing::instrument(skip_all, fields(campaign_id = tracing::field::Empty), err)]
pub async fn try_execute_task(
    orchestrator: &CampaignOrchestrator,
) -> Result<ExecutionOutcome, anyhow::Error> {
    let due = orchestrator
        .store()
        .due_campaigns(OffsetDateTime::now_utc())
        .await?;
    let Some(campaign_id) = due.first().copied() else {
        return Ok(ExecutionOutcome::EmptyQueue);
    };
    Span::current().record("campaign_id", tracing::field::display(campaign_id));

    match orchestrator.send_campaign(campaign_id).await {
        Ok(report) => tracing::info!(
            status = report.status.as_ref(),
            delivered_count = report.delivered_count,
            failed_count = report.failed_count,
            "Scheduled campaign sent"
        ),
        // Someone else sent or edited it between the poll and the send.
        Err(CampaignError::InvalidState(message)) => {
            tracing::info!(reason = %message, "Scheduled campaign was no longer sendable")
        }
        Err(CampaignError::NoEligibleRecipients) => {
            tracing::warn!("Scheduled campaign has no eligible recipients, reverting to draft");
            orchestrator.cancel_schedule(campaign_id).await?;
        }
        Err(CampaignError::Validation(message)) => {
            tracing::warn!(reason = %message, "Scheduled campaign cannot be sent, reverting to draft");
            orchestrator.cancel_schedule(campaign_id).await?;
        }
        Err(e) => return Err(e.into()),
    }

    Ok(ExecutionOutcome::TaskCompleted)
}

#[derive(Debug, PartialEq, Eq)]
pub enum ExecutionOutcome {
    TaskCompleted,
    EmptyQueue,
}
