//! The orchestrator module owns the deployment and rollback sequences: the order of control
//! plane calls, the validation of run_task results, the retention-based pruning of old task
//! definitions, and the notification hook around each call.
//!
//! Sequencing is strictly linear; the first failed call aborts the run and already-completed
//! steps are not compensated.  The newly registered definition stays registered and partially
//! wired, which the operator resolves by fixing the cause and deploying (or rolling back) again.

use crate::client::ControlPlane;
use crate::config::DeployConfig;
use crate::notify::{post_call, CallRecord, Notifier};
use log::info;
use serde_json::json;
use snafu::{ensure, ResultExt};

const ECS: &str = "ecs";
const EVENTS: &str = "events";

pub(crate) struct Orchestrator {
    config: DeployConfig,
    plane: Box<dyn ControlPlane>,
    notifier: Option<Notifier>,
}

impl Orchestrator {
    pub(crate) fn new(config: DeployConfig, plane: Box<dyn ControlPlane>) -> Self {
        let notifier = config.notification.as_ref().map(Notifier::new);
        Self {
            config,
            plane,
            notifier,
        }
    }

    /// Registers a new task definition with the given image tag, runs one-off tasks, points
    /// services and event targets at it, then deregisters definitions beyond the retention
    /// count.
    pub(crate) async fn deploy(&mut self, image_tag: &str) -> Result<()> {
        ensure!(!image_tag.is_empty(), error::EmptyImageTagSnafu);
        info!("Updating tasks to image tag: {}", image_tag);
        self.config.task_definition.inject_image_tag(image_tag);

        let arn = self.register_task_definition().await?;
        self.run_tasks(&arn).await?;
        self.update_services(&arn).await?;
        self.put_targets(&arn).await?;
        self.deregister_old().await?;
        Ok(())
    }

    /// Deregisters the most recent active task definition and points services and event targets
    /// back at the one before it.  One-off tasks are not re-run.
    pub(crate) async fn rollback(&mut self) -> Result<()> {
        let active = self.active_task_definitions().await?;
        ensure!(
            active.len() >= 2,
            error::RollbackHistorySnafu {
                available: active.len(),
            }
        );

        let current = &active[0];
        self.plane
            .deregister_task_definition(current)
            .await
            .context(error::ControlPlaneSnafu {
                method: "deregister_task_definition",
            })?;
        post_call(
            self.notifier.as_ref(),
            self.plane.as_ref(),
            CallRecord::new(
                ECS,
                "deregister_task_definition",
                json!({ "taskDefinition": current }),
                json!({}),
            ),
        )
        .await;
        info!(
            "Deregistered latest active task definition: {}",
            revision(current)
        );

        let previous = active[1].clone();
        info!("Rolling back to task definition: {}", revision(&previous));
        self.update_services(&previous).await?;
        self.put_targets(&previous).await?;
        Ok(())
    }

    async fn register_task_definition(&self) -> Result<String> {
        let template = &self.config.task_definition;
        let arn = self
            .plane
            .register_task_definition(template)
            .await
            .context(error::ControlPlaneSnafu {
                method: "register_task_definition",
            })?;
        post_call(
            self.notifier.as_ref(),
            self.plane.as_ref(),
            CallRecord::new(
                ECS,
                "register_task_definition",
                json!(template),
                json!({ "taskDefinitionArn": arn }),
            ),
        )
        .await;
        info!("Registered new task definition: {}", revision(&arn));
        Ok(arn)
    }

    async fn active_task_definitions(&self) -> Result<Vec<String>> {
        let family = &self.config.task_definition.family;
        let arns = self
            .plane
            .list_task_definitions(family)
            .await
            .context(error::ControlPlaneSnafu {
                method: "list_task_definitions",
            })?;
        post_call(
            self.notifier.as_ref(),
            self.plane.as_ref(),
            CallRecord::new(
                ECS,
                "list_task_definitions",
                json!({ "familyPrefix": family, "status": "ACTIVE", "sort": "DESC" }),
                json!({ "taskDefinitionArns": arns }),
            ),
        )
        .await;
        Ok(arns)
    }

    async fn run_tasks(&self, task_definition_arn: &str) -> Result<()> {
        for spec in &self.config.run_tasks {
            let launched = self
                .plane
                .run_task(spec, task_definition_arn)
                .await
                .context(error::ControlPlaneSnafu { method: "run_task" })?;
            post_call(
                self.notifier.as_ref(),
                self.plane.as_ref(),
                CallRecord::new(
                    ECS,
                    "run_task",
                    json!({ "taskDefinition": task_definition_arn, "spec": spec }),
                    json!({ "tasks": launched }),
                ),
            )
            .await;

            // The call can succeed at the transport level yet place nothing, e.g. on capacity
            // or constraint failures; an empty result here means the release must not proceed.
            ensure!(
                !launched.is_empty(),
                error::NoLaunchedTasksSnafu {
                    task_definition_arn,
                }
            );
            info!("Running task: {}", revision(task_definition_arn));
        }
        Ok(())
    }

    async fn update_services(&self, task_definition_arn: &str) -> Result<()> {
        for spec in &self.config.update_services {
            self.plane
                .update_service(spec, task_definition_arn)
                .await
                .context(error::ControlPlaneSnafu {
                    method: "update_service",
                })?;
            post_call(
                self.notifier.as_ref(),
                self.plane.as_ref(),
                CallRecord::new(
                    ECS,
                    "update_service",
                    json!({ "taskDefinition": task_definition_arn, "service": spec }),
                    json!({}),
                ),
            )
            .await;
            info!("Updated service: {}", spec.service);
        }
        Ok(())
    }

    async fn put_targets(&mut self, task_definition_arn: &str) -> Result<()> {
        for spec in self.config.event_targets.iter_mut() {
            spec.set_task_definition_arn(task_definition_arn);
            self.plane
                .put_targets(spec)
                .await
                .context(error::ControlPlaneSnafu {
                    method: "put_targets",
                })?;
            post_call(
                self.notifier.as_ref(),
                self.plane.as_ref(),
                CallRecord::new(EVENTS, "put_targets", json!(&*spec), json!({})),
            )
            .await;
            for target in &spec.targets {
                info!("Set '{}' event target: {}", spec.rule, target.id);
            }
        }
        Ok(())
    }

    async fn deregister_old(&self) -> Result<()> {
        let active = self.active_task_definitions().await?;
        for arn in active.iter().skip(self.config.keep_active) {
            self.plane
                .deregister_task_definition(arn)
                .await
                .context(error::ControlPlaneSnafu {
                    method: "deregister_task_definition",
                })?;
            post_call(
                self.notifier.as_ref(),
                self.plane.as_ref(),
                CallRecord::new(
                    ECS,
                    "deregister_task_definition",
                    json!({ "taskDefinition": arn }),
                    json!({}),
                ),
            )
            .await;
            info!("Deregistered task definition: {}", arn);
        }
        Ok(())
    }
}

/// The `family:revision` portion of a task definition ARN, for log lines.
fn revision(arn: &str) -> &str {
    arn.splitn(2, '/').nth(1).unwrap_or(arn)
}

mod error {
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub(crate) enum Error {
        #[snafu(display("{} call failed: {}", method, source))]
        ControlPlane {
            method: String,
            source: crate::client::Error,
        },

        #[snafu(display("Image tag must not be empty"))]
        EmptyImageTag,

        #[snafu(display("run_task with '{}' launched no tasks", task_definition_arn))]
        NoLaunchedTasks { task_definition_arn: String },

        #[snafu(display(
            "Rollback requires at least 2 active task definitions, found {}",
            available
        ))]
        RollbackHistory { available: usize },
    }
}
pub(crate) use error::Error;
type Result<T> = std::result::Result<T, error::Error>;

#[cfg(test)]
mod test {
    use super::*;
    use crate::client;
    use crate::config::{
        ContainerDefinition, EcsTargetParameters, EventTarget, EventTargetSpec,
        NotificationConfig, RunTaskSpec, ServiceUpdateSpec, TaskDefinitionTemplate,
    };
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};

    /// Stand-in control plane that records every call and answers from canned data.
    struct FakePlane {
        calls: Arc<Mutex<Vec<(String, String)>>>,
        active: Vec<String>,
        new_arn: String,
        launched: Vec<String>,
        publish_fails: bool,
    }

    impl FakePlane {
        fn new(
            calls: &Arc<Mutex<Vec<(String, String)>>>,
            active: &[&str],
            new_arn: &str,
        ) -> Self {
            Self {
                calls: Arc::clone(calls),
                active: active.iter().map(|arn| arn.to_string()).collect(),
                new_arn: new_arn.to_string(),
                launched: vec!["arn:aws:ecs:us-west-2:123456789012:task/1".to_string()],
                publish_fails: false,
            }
        }

        fn record(&self, method: &str, detail: String) {
            self.calls
                .lock()
                .unwrap()
                .push((method.to_string(), detail));
        }
    }

    #[async_trait]
    impl ControlPlane for FakePlane {
        async fn register_task_definition(
            &self,
            template: &TaskDefinitionTemplate,
        ) -> std::result::Result<String, client::Error> {
            let image = template
                .container_definitions
                .first()
                .map(|container| container.image.clone())
                .unwrap_or_default();
            self.record("register_task_definition", image);
            Ok(self.new_arn.clone())
        }

        async fn list_task_definitions(
            &self,
            family: &str,
        ) -> std::result::Result<Vec<String>, client::Error> {
            self.record("list_task_definitions", family.to_string());
            Ok(self.active.clone())
        }

        async fn run_task(
            &self,
            _spec: &RunTaskSpec,
            task_definition_arn: &str,
        ) -> std::result::Result<Vec<String>, client::Error> {
            self.record("run_task", task_definition_arn.to_string());
            Ok(self.launched.clone())
        }

        async fn update_service(
            &self,
            spec: &ServiceUpdateSpec,
            task_definition_arn: &str,
        ) -> std::result::Result<(), client::Error> {
            self.record(
                "update_service",
                format!("{}={}", spec.service, task_definition_arn),
            );
            Ok(())
        }

        async fn put_targets(
            &self,
            spec: &EventTargetSpec,
        ) -> std::result::Result<(), client::Error> {
            self.record(
                "put_targets",
                format!(
                    "{}={}",
                    spec.rule, spec.targets[0].ecs_parameters.task_definition_arn
                ),
            );
            Ok(())
        }

        async fn deregister_task_definition(
            &self,
            task_definition_arn: &str,
        ) -> std::result::Result<(), client::Error> {
            self.record("deregister_task_definition", task_definition_arn.to_string());
            Ok(())
        }

        async fn publish_notification(
            &self,
            _topic_arn: &str,
            subject: &str,
            message: &str,
        ) -> std::result::Result<(), client::Error> {
            self.record("publish_notification", format!("{} {}", subject, message));
            if self.publish_fails {
                return Err(client::Error::MissingInResponse {
                    request_type: "Publish".to_string(),
                    missing: "message id".to_string(),
                });
            }
            Ok(())
        }
    }

    fn test_config(with_notifier: bool) -> DeployConfig {
        DeployConfig {
            task_definition: TaskDefinitionTemplate {
                family: "abc".to_string(),
                container_definitions: vec![ContainerDefinition {
                    name: "app".to_string(),
                    image: "my:{image_tag}".to_string(),
                    ..Default::default()
                }],
                ..Default::default()
            },
            update_services: vec![ServiceUpdateSpec {
                service: "abc".to_string(),
                ..Default::default()
            }],
            run_tasks: vec![RunTaskSpec {
                cluster: Some("lorem".to_string()),
                ..Default::default()
            }],
            event_targets: vec![EventTargetSpec {
                rule: "a".to_string(),
                event_bus_name: None,
                targets: vec![EventTarget {
                    id: "lorem".to_string(),
                    arn: "cluster-arn".to_string(),
                    role_arn: None,
                    ecs_parameters: EcsTargetParameters::default(),
                }],
            }],
            keep_active: 5,
            notification: with_notifier.then(|| NotificationConfig {
                topic_arn: "arn:aws:sns:us-west-2:123456789012:deploys".to_string(),
                excluded_methods: None,
            }),
        }
    }

    fn recorded(calls: &Arc<Mutex<Vec<(String, String)>>>) -> Vec<(String, String)> {
        calls.lock().unwrap().clone()
    }

    #[tokio::test]
    async fn deploy_end_to_end() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let active = [
            "arn/abc:7",
            "arn/abc:6",
            "arn/abc:5",
            "arn/abc:4",
            "arn/abc:3",
            "arn/abc:2",
            "arn/abc:1",
        ];
        let plane = FakePlane::new(&calls, &active, "arn/abc:8");
        let mut orchestrator = Orchestrator::new(test_config(false), Box::new(plane));

        orchestrator.deploy("000").await.unwrap();

        let expected: Vec<(String, String)> = [
            ("register_task_definition", "my:000"),
            ("run_task", "arn/abc:8"),
            ("update_service", "abc=arn/abc:8"),
            ("put_targets", "a=arn/abc:8"),
            ("list_task_definitions", "abc"),
            ("deregister_task_definition", "arn/abc:2"),
            ("deregister_task_definition", "arn/abc:1"),
        ]
        .iter()
        .map(|(method, detail)| (method.to_string(), detail.to_string()))
        .collect();
        assert_eq!(recorded(&calls), expected);
    }

    #[tokio::test]
    async fn deploy_with_empty_tag_makes_no_calls() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let plane = FakePlane::new(&calls, &[], "arn/abc:1");
        let mut orchestrator = Orchestrator::new(test_config(false), Box::new(plane));

        let result = orchestrator.deploy("").await;
        assert!(matches!(result, Err(Error::EmptyImageTag)));
        assert!(recorded(&calls).is_empty());
    }

    #[tokio::test]
    async fn deploy_stops_when_no_tasks_launch() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut plane = FakePlane::new(&calls, &["arn/abc:2", "arn/abc:1"], "arn/abc:3");
        plane.launched = Vec::new();
        let mut orchestrator = Orchestrator::new(test_config(false), Box::new(plane));

        let result = orchestrator.deploy("000").await;
        assert!(matches!(result, Err(Error::NoLaunchedTasks { .. })));

        // Nothing past the failed run_task step should have happened.
        let methods: Vec<String> = recorded(&calls)
            .into_iter()
            .map(|(method, _)| method)
            .collect();
        assert_eq!(methods, vec!["register_task_definition", "run_task"]);
    }

    #[tokio::test]
    async fn deploy_keeps_everything_within_retention() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let active = ["arn/abc:3", "arn/abc:2", "arn/abc:1"];
        let plane = FakePlane::new(&calls, &active, "arn/abc:3");
        let mut orchestrator = Orchestrator::new(test_config(false), Box::new(plane));

        orchestrator.deploy("000").await.unwrap();

        assert!(!recorded(&calls)
            .iter()
            .any(|(method, _)| method == "deregister_task_definition"));
    }

    #[tokio::test]
    async fn rollback_end_to_end() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let active = [
            "arn/abc:5",
            "arn/abc:4",
            "arn/abc:3",
            "arn/abc:2",
            "arn/abc:1",
        ];
        let plane = FakePlane::new(&calls, &active, "unused");
        let mut orchestrator = Orchestrator::new(test_config(false), Box::new(plane));

        orchestrator.rollback().await.unwrap();

        let expected: Vec<(String, String)> = [
            ("list_task_definitions", "abc"),
            ("deregister_task_definition", "arn/abc:5"),
            ("update_service", "abc=arn/abc:4"),
            ("put_targets", "a=arn/abc:4"),
        ]
        .iter()
        .map(|(method, detail)| (method.to_string(), detail.to_string()))
        .collect();
        assert_eq!(recorded(&calls), expected);
    }

    #[tokio::test]
    async fn rollback_with_exactly_two_definitions() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let plane = FakePlane::new(&calls, &["arn/abc:2", "arn/abc:1"], "unused");
        let mut orchestrator = Orchestrator::new(test_config(false), Box::new(plane));

        orchestrator.rollback().await.unwrap();

        let recorded = recorded(&calls);
        assert_eq!(
            recorded[1],
            (
                "deregister_task_definition".to_string(),
                "arn/abc:2".to_string()
            )
        );
        assert_eq!(
            recorded[2],
            ("update_service".to_string(), "abc=arn/abc:1".to_string())
        );
        assert_eq!(
            recorded[3],
            ("put_targets".to_string(), "a=arn/abc:1".to_string())
        );
    }

    #[tokio::test]
    async fn rollback_requires_two_active_definitions() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let plane = FakePlane::new(&calls, &["arn/abc:1"], "unused");
        let mut orchestrator = Orchestrator::new(test_config(false), Box::new(plane));

        let result = orchestrator.rollback().await;
        assert!(matches!(
            result,
            Err(Error::RollbackHistory { available: 1 })
        ));

        // Only the listing call should have happened; nothing was deregistered or updated.
        let methods: Vec<String> = recorded(&calls)
            .into_iter()
            .map(|(method, _)| method)
            .collect();
        assert_eq!(methods, vec!["list_task_definitions"]);
    }

    #[tokio::test]
    async fn update_service_is_followed_by_a_notification() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let plane = FakePlane::new(&calls, &[], "unused");
        let orchestrator = Orchestrator::new(test_config(true), Box::new(plane));

        orchestrator.update_services("arn/abc:3").await.unwrap();

        let recorded = recorded(&calls);
        assert_eq!(recorded.len(), 2);
        assert_eq!(recorded[0].0, "update_service");
        assert_eq!(recorded[1].0, "publish_notification");

        // The notification names the client and method and carries input and result.
        let (subject, message) = recorded[1].1.split_once(' ').unwrap();
        assert_eq!(subject, "ecs.update_service");
        let payload: serde_json::Value = serde_json::from_str(message).unwrap();
        assert_eq!(payload["client"], "ecs");
        assert_eq!(payload["method"], "update_service");
        assert_eq!(payload["input"]["taskDefinition"], "arn/abc:3");
        assert_eq!(payload["input"]["service"]["service"], "abc");
        assert!(payload.get("output").is_some());
    }

    #[tokio::test]
    async fn excluded_methods_produce_no_notification() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let plane = FakePlane::new(&calls, &["arn/abc:1"], "unused");
        let orchestrator = Orchestrator::new(test_config(true), Box::new(plane));

        orchestrator.active_task_definitions().await.unwrap();

        let methods: Vec<String> = recorded(&calls)
            .into_iter()
            .map(|(method, _)| method)
            .collect();
        assert_eq!(methods, vec!["list_task_definitions"]);
    }

    #[tokio::test]
    async fn deploy_notifies_every_call_except_exclusions() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let active = [
            "arn/abc:7",
            "arn/abc:6",
            "arn/abc:5",
            "arn/abc:4",
            "arn/abc:3",
            "arn/abc:2",
            "arn/abc:1",
        ];
        let plane = FakePlane::new(&calls, &active, "arn/abc:8");
        let mut orchestrator = Orchestrator::new(test_config(true), Box::new(plane));

        orchestrator.deploy("000").await.unwrap();

        let recorded = recorded(&calls);
        // register, run_task, update_service, put_targets, and two deregisters are notified;
        // the list call is not.
        let publishes = recorded
            .iter()
            .filter(|(method, _)| method == "publish_notification")
            .count();
        assert_eq!(publishes, 6);
        let listed = recorded
            .iter()
            .position(|(method, _)| method == "list_task_definitions")
            .unwrap();
        assert_ne!(recorded[listed + 1].0, "publish_notification");
    }

    #[tokio::test]
    async fn notification_failures_do_not_abort_the_run() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let active = [
            "arn/abc:7",
            "arn/abc:6",
            "arn/abc:5",
            "arn/abc:4",
            "arn/abc:3",
            "arn/abc:2",
            "arn/abc:1",
        ];
        let mut plane = FakePlane::new(&calls, &active, "arn/abc:8");
        plane.publish_fails = true;
        let mut orchestrator = Orchestrator::new(test_config(true), Box::new(plane));

        orchestrator.deploy("000").await.unwrap();

        // Every publish attempt failed, yet the full sequence ran to completion.
        let methods: Vec<String> = recorded(&calls)
            .into_iter()
            .map(|(method, _)| method)
            .collect();
        assert_eq!(
            methods
                .iter()
                .filter(|method| *method == "publish_notification")
                .count(),
            6
        );
        assert_eq!(
            methods
                .iter()
                .filter(|method| *method == "deregister_task_definition")
                .count(),
            2
        );
        assert!(methods.contains(&"update_service".to_string()));
        assert!(methods.contains(&"put_targets".to_string()));
    }

    #[test]
    fn revision_strips_the_arn_prefix() {
        assert_eq!(revision("arn/abc:8"), "abc:8");
        assert_eq!(revision("abc"), "abc");
    }
}
