use chrono::Utc;

use crate::pipeline::PollPipeline;

/// 轮询所有到期订阅者并推送新论文
pub async fn run(pipeline: &PollPipeline) {
    tracing::debug!("paper_poll: start");
    match pipeline.run_due(Utc::now()).await {
        Ok(summary) if summary.due == 0 => tracing::debug!("paper_poll: nothing due"),
        Ok(summary) => tracing::info!(
            due = summary.due,
            succeeded = summary.succeeded,
            failed = summary.failed,
            sent = summary.deliveries.sent,
            skipped = summary.deliveries.skipped,
            send_failures = summary.deliveries.failed,
            "paper_poll: done"
        ),
        Err(e) => tracing::error!(error = %e, "paper_poll failed"),
    }
}
