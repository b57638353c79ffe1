//! The client module owns the control plane seam: the `ControlPlane` trait enumerating the calls
//! the orchestrator makes, and `AwsControlPlane`, which backs that trait with the ECS,
//! EventBridge, and SNS clients from the AWS SDK for Rust.

use crate::config::{EventTargetSpec, RunTaskSpec, ServiceUpdateSpec, TaskDefinitionTemplate};
use async_trait::async_trait;
use aws_sdk_ecs::config::Region;
use aws_sdk_ecs::types as ecs;
use aws_sdk_ecs::types::{SortOrder, TaskDefinitionStatus};
use aws_sdk_ecs::Client as EcsClient;
use aws_sdk_eventbridge::types as events;
use aws_sdk_eventbridge::Client as EventBridgeClient;
use aws_sdk_sns::Client as SnsClient;
use log::{trace, warn};
use snafu::{OptionExt, ResultExt};
use tokio_stream::StreamExt;

/// The control plane operations a deployment run composes.  `AwsControlPlane` is the real
/// implementation; tests substitute a recording fake.
#[async_trait]
pub(crate) trait ControlPlane: Send + Sync {
    /// Registers a new revision of the template's family and returns its ARN.
    async fn register_task_definition(&self, template: &TaskDefinitionTemplate)
        -> Result<String>;

    /// Lists the ARNs of all ACTIVE revisions in the family, newest first.
    async fn list_task_definitions(&self, family: &str) -> Result<Vec<String>>;

    /// Launches a one-off task and returns the ARNs of the tasks actually started.
    async fn run_task(&self, spec: &RunTaskSpec, task_definition_arn: &str)
        -> Result<Vec<String>>;

    /// Points a service at the given task definition.
    async fn update_service(
        &self,
        spec: &ServiceUpdateSpec,
        task_definition_arn: &str,
    ) -> Result<()>;

    /// Replaces the targets of an EventBridge rule.  The spec's embedded task definition ARNs
    /// must already have been rewritten by the caller.
    async fn put_targets(&self, spec: &EventTargetSpec) -> Result<()>;

    /// Removes a task definition revision from the ACTIVE set.
    async fn deregister_task_definition(&self, task_definition_arn: &str) -> Result<()>;

    /// Publishes a notification message to an SNS topic.
    async fn publish_notification(
        &self,
        topic_arn: &str,
        subject: &str,
        message: &str,
    ) -> Result<()>;
}

/// Control plane backed by the AWS SDK.
pub(crate) struct AwsControlPlane {
    ecs: EcsClient,
    events: EventBridgeClient,
    sns: SnsClient,
}

impl AwsControlPlane {
    /// Builds SDK clients from the environment's credentials chain, with an optional region
    /// override from the command line.
    pub(crate) async fn new(region: Option<String>) -> Self {
        let mut loader = aws_config::from_env();
        if let Some(region) = region {
            loader = loader.region(Region::new(region));
        }
        let sdk_config = loader.load().await;
        Self {
            ecs: EcsClient::new(&sdk_config),
            events: EventBridgeClient::new(&sdk_config),
            sns: SnsClient::new(&sdk_config),
        }
    }
}

#[async_trait]
impl ControlPlane for AwsControlPlane {
    async fn register_task_definition(
        &self,
        template: &TaskDefinitionTemplate,
    ) -> Result<String> {
        let mut request = self
            .ecs
            .register_task_definition()
            .family(&template.family)
            .set_cpu(template.cpu.clone())
            .set_memory(template.memory.clone())
            .set_network_mode(template.network_mode.as_deref().map(ecs::NetworkMode::from))
            .set_task_role_arn(template.task_role_arn.clone())
            .set_execution_role_arn(template.execution_role_arn.clone());
        for compatibility in &template.requires_compatibilities {
            request = request.requires_compatibilities(ecs::Compatibility::from(
                compatibility.as_str(),
            ));
        }
        for container in &template.container_definitions {
            request = request.container_definitions(render_container(container));
        }

        let response = request
            .send()
            .await
            .context(error::RegisterTaskDefinitionSnafu {
                family: &template.family,
            })?;
        response
            .task_definition()
            .and_then(|task_definition| task_definition.task_definition_arn())
            .map(str::to_string)
            .context(error::MissingInResponseSnafu {
                request_type: "RegisterTaskDefinition",
                missing: "task definition ARN",
            })
    }

    async fn list_task_definitions(&self, family: &str) -> Result<Vec<String>> {
        let mut arns = Vec::new();
        let mut paginator = self
            .ecs
            .list_task_definitions()
            .family_prefix(family)
            .status(TaskDefinitionStatus::Active)
            .sort(SortOrder::Desc)
            .into_paginator()
            .items()
            .send();
        while let Some(arn) = paginator.next().await {
            arns.push(arn.context(error::ListTaskDefinitionsSnafu { family })?);
        }
        trace!("Active task definitions for '{}': {:?}", family, arns);
        Ok(arns)
    }

    async fn run_task(
        &self,
        spec: &RunTaskSpec,
        task_definition_arn: &str,
    ) -> Result<Vec<String>> {
        let response = self
            .ecs
            .run_task()
            .task_definition(task_definition_arn)
            .set_cluster(spec.cluster.clone())
            .set_count(spec.count)
            .set_launch_type(spec.launch_type.as_deref().map(ecs::LaunchType::from))
            .set_group(spec.group.clone())
            .set_started_by(spec.started_by.clone())
            .send()
            .await
            .context(error::RunTaskSnafu {
                task_definition_arn,
            })?;

        // The API can accept the request but decline to place tasks; the failures list says why.
        for failure in response.failures().unwrap_or_default() {
            warn!(
                "run_task placement failure for '{}': {}",
                failure.arn().unwrap_or("unknown"),
                failure.reason().unwrap_or("no reason given"),
            );
        }

        Ok(response
            .tasks()
            .unwrap_or_default()
            .iter()
            .filter_map(|task| task.task_arn())
            .map(str::to_string)
            .collect())
    }

    async fn update_service(
        &self,
        spec: &ServiceUpdateSpec,
        task_definition_arn: &str,
    ) -> Result<()> {
        self.ecs
            .update_service()
            .service(&spec.service)
            .set_cluster(spec.cluster.clone())
            .task_definition(task_definition_arn)
            .set_desired_count(spec.desired_count)
            .force_new_deployment(spec.force_new_deployment)
            .send()
            .await
            .context(error::UpdateServiceSnafu {
                service: &spec.service,
            })?;
        Ok(())
    }

    async fn put_targets(&self, spec: &EventTargetSpec) -> Result<()> {
        let mut targets = Vec::with_capacity(spec.targets.len());
        for target in &spec.targets {
            let ecs_parameters = events::EcsParameters::builder()
                .task_definition_arn(&target.ecs_parameters.task_definition_arn)
                .set_task_count(target.ecs_parameters.task_count)
                .set_launch_type(
                    target
                        .ecs_parameters
                        .launch_type
                        .as_deref()
                        .map(events::LaunchType::from),
                )
                .build();
            targets.push(
                events::Target::builder()
                    .id(&target.id)
                    .arn(&target.arn)
                    .set_role_arn(target.role_arn.clone())
                    .ecs_parameters(ecs_parameters)
                    .build(),
            );
        }

        let response = self
            .events
            .put_targets()
            .rule(&spec.rule)
            .set_event_bus_name(spec.event_bus_name.clone())
            .set_targets(Some(targets))
            .send()
            .await
            .context(error::PutTargetsSnafu { rule: &spec.rule })?;
        if response.failed_entry_count() > 0 {
            warn!(
                "put_targets for rule '{}' reported {} failed entries",
                spec.rule,
                response.failed_entry_count()
            );
        }
        Ok(())
    }

    async fn deregister_task_definition(&self, task_definition_arn: &str) -> Result<()> {
        self.ecs
            .deregister_task_definition()
            .task_definition(task_definition_arn)
            .send()
            .await
            .context(error::DeregisterTaskDefinitionSnafu {
                task_definition_arn,
            })?;
        Ok(())
    }

    async fn publish_notification(
        &self,
        topic_arn: &str,
        subject: &str,
        message: &str,
    ) -> Result<()> {
        self.sns
            .publish()
            .topic_arn(topic_arn)
            .subject(subject)
            .message(message)
            .send()
            .await
            .context(error::PublishSnafu { topic_arn })?;
        Ok(())
    }
}

fn render_container(container: &crate::config::ContainerDefinition) -> ecs::ContainerDefinition {
    let environment: Vec<ecs::KeyValuePair> = container
        .environment
        .iter()
        .map(|(name, value)| ecs::KeyValuePair::builder().name(name).value(value).build())
        .collect();
    ecs::ContainerDefinition::builder()
        .name(&container.name)
        .image(&container.image)
        .set_essential(container.essential)
        .set_cpu(container.cpu)
        .set_memory(container.memory)
        .set_command(container.command.clone())
        .set_environment((!environment.is_empty()).then_some(environment))
        .build()
}

mod error {
    use aws_sdk_ecs::error::SdkError;
    use aws_sdk_ecs::operation::{
        deregister_task_definition::DeregisterTaskDefinitionError,
        list_task_definitions::ListTaskDefinitionsError,
        register_task_definition::RegisterTaskDefinitionError, run_task::RunTaskError,
        update_service::UpdateServiceError,
    };
    use aws_sdk_eventbridge::operation::put_targets::PutTargetsError;
    use aws_sdk_sns::operation::publish::PublishError;
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub(crate) enum Error {
        #[snafu(display("Failed to deregister task definition '{}': {}", task_definition_arn, source))]
        DeregisterTaskDefinition {
            task_definition_arn: String,
            source: SdkError<DeregisterTaskDefinitionError>,
        },

        #[snafu(display("Failed to list task definitions for family '{}': {}", family, source))]
        ListTaskDefinitions {
            family: String,
            source: SdkError<ListTaskDefinitionsError>,
        },

        #[snafu(display("Response to {} was missing {}", request_type, missing))]
        MissingInResponse {
            request_type: String,
            missing: String,
        },

        #[snafu(display("Failed to publish notification to '{}': {}", topic_arn, source))]
        Publish {
            topic_arn: String,
            source: SdkError<PublishError>,
        },

        #[snafu(display("Failed to put targets for rule '{}': {}", rule, source))]
        PutTargets {
            rule: String,
            source: SdkError<PutTargetsError>,
        },

        #[snafu(display("Failed to register task definition for family '{}': {}", family, source))]
        RegisterTaskDefinition {
            family: String,
            source: SdkError<RegisterTaskDefinitionError>,
        },

        #[snafu(display("Failed to run task with definition '{}': {}", task_definition_arn, source))]
        RunTask {
            task_definition_arn: String,
            source: SdkError<RunTaskError>,
        },

        #[snafu(display("Failed to update service '{}': {}", service, source))]
        UpdateService {
            service: String,
            source: SdkError<UpdateServiceError>,
        },
    }
}
pub(crate) use error::Error;
type Result<T> = std::result::Result<T, error::Error>;
