//! The notify module owns the best-effort notification hook that runs after control plane calls.
//! Notification is observability, not control flow: a failed publish is logged and discarded,
//! never propagated.

use crate::client::ControlPlane;
use crate::config::NotificationConfig;
use log::{debug, warn};
use serde_json::json;
use std::collections::HashSet;

/// Read-only methods that aren't worth a notification unless the operator asks for them.
const DEFAULT_EXCLUDED_METHODS: &[&str] = &[
    "list_task_definitions",
    "describe_task_definition",
    "describe_services",
    "describe_tasks",
];

/// What happened in a single control plane call, for the notification payload.
#[derive(Debug)]
pub(crate) struct CallRecord {
    pub(crate) client: &'static str,
    pub(crate) method: &'static str,
    pub(crate) input: serde_json::Value,
    pub(crate) output: serde_json::Value,
}

impl CallRecord {
    pub(crate) fn new(
        client: &'static str,
        method: &'static str,
        input: serde_json::Value,
        output: serde_json::Value,
    ) -> Self {
        Self {
            client,
            method,
            input,
            output,
        }
    }
}

/// Publishes call records to an SNS topic, skipping excluded methods.
#[derive(Debug)]
pub(crate) struct Notifier {
    topic_arn: String,
    excluded_methods: HashSet<String>,
}

impl Notifier {
    pub(crate) fn new(config: &NotificationConfig) -> Self {
        let excluded_methods = match &config.excluded_methods {
            Some(methods) => methods.iter().cloned().collect(),
            None => DEFAULT_EXCLUDED_METHODS
                .iter()
                .map(|method| method.to_string())
                .collect(),
        };
        Self {
            topic_arn: config.topic_arn.clone(),
            excluded_methods,
        }
    }

    /// The exclusion predicate over method names.
    pub(crate) fn excluded(&self, method: &str) -> bool {
        self.excluded_methods.contains(method)
    }

    /// Publishes a notification for the given call, swallowing any publish failure.
    pub(crate) async fn publish(&self, plane: &dyn ControlPlane, record: &CallRecord) {
        if self.excluded(record.method) {
            debug!("Skipping notification for excluded method {}", record.method);
            return;
        }

        let subject = format!("{}.{}", record.client, record.method);
        let message = json!({
            "client": record.client,
            "method": record.method,
            "input": record.input,
            "output": record.output,
        })
        .to_string();

        if let Err(e) = plane
            .publish_notification(&self.topic_arn, &subject, &message)
            .await
        {
            warn!("Failed to send notification for {}: {}", subject, e);
        }
    }
}

/// Runs the notification hook for a completed call, if a sink is configured.
pub(crate) async fn post_call(
    notifier: Option<&Notifier>,
    plane: &dyn ControlPlane,
    record: CallRecord,
) {
    if let Some(notifier) = notifier {
        notifier.publish(plane, &record).await;
    }
}
