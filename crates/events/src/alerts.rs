//! Operator alerts for defective or anomalous inspections.
//!
//! [`AlertObserver`] listens on the [`NotificationBus`](crate::bus::NotificationBus)
//! and raises a log alert for every result whose outcome warrants one. It
//! runs as a background task and exits when the bus is dropped.

use linewatch_core::inspection::Outcome;
use tokio::sync::broadcast;

use crate::event::NotificationEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertSeverity {
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Alert {
    pub severity: AlertSeverity,
    pub sequence_number: i64,
    pub message: String,
}

pub struct AlertObserver;

impl AlertObserver {
    /// Map an event to the alert it warrants, if any.
    pub fn classify(event: &NotificationEvent) -> Option<Alert> {
        let result = &event.payload;
        let (severity, message) = match result.outcome {
            Outcome::Defect => (
                AlertSeverity::Warning,
                format!(
                    "Defect detected on product {} (batch {}): {}",
                    result.product_id,
                    result.batch_id,
                    result.defect_type.as_deref().unwrap_or("unclassified"),
                ),
            ),
            Outcome::Anomaly => (
                AlertSeverity::Critical,
                format!(
                    "Anomaly detected on product {} (batch {})",
                    result.product_id, result.batch_id
                ),
            ),
            Outcome::Success | Outcome::Failure => return None,
        };

        Some(Alert {
            severity,
            sequence_number: event.sequence_number,
            message,
        })
    }

    pub async fn run(mut receiver: broadcast::Receiver<NotificationEvent>) {
        loop {
            match receiver.recv().await {
                Ok(event) => {
                    if let Some(alert) = Self::classify(&event) {
                        tracing::warn!(
                            severity = ?alert.severity,
                            sequence = alert.sequence_number,
                            confidence = event.payload.confidence,
                            "{}",
                            alert.message,
                        );
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "Alert observer lagged, some results were not inspected");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    tracing::info!("Notification bus closed, alert observer shutting down");
                    break;
                }
            }
        }
    }
}
