//! The config module owns the definition and loading process for the deployment configuration
//! file, including the task definition template and the image tag injection that customizes it
//! for a release.

use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// The placeholder token we replace with the release's image tag in container image fields.
pub(crate) const IMAGE_TAG_PLACEHOLDER: &str = "{image_tag}";

/// Everything a single deployment run needs to know: the task definition template, the services,
/// one-off tasks, and event targets that should follow it, how many old definitions to keep, and
/// where (if anywhere) to send notifications.
#[derive(Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub(crate) struct DeployConfig {
    pub(crate) task_definition: TaskDefinitionTemplate,

    #[serde(default)]
    pub(crate) update_services: Vec<ServiceUpdateSpec>,

    #[serde(default)]
    pub(crate) run_tasks: Vec<RunTaskSpec>,

    #[serde(default)]
    pub(crate) event_targets: Vec<EventTargetSpec>,

    /// How many of the most recent active task definitions to keep registered after a deploy.
    #[serde(default = "default_keep_active")]
    pub(crate) keep_active: usize,

    pub(crate) notification: Option<NotificationConfig>,
}

fn default_keep_active() -> usize {
    5
}

impl DeployConfig {
    /// Deserializes a DeployConfig from a given path
    pub(crate) fn from_path<P>(path: P) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        let deploy_config_str = fs::read_to_string(path).context(error::FileSnafu { path })?;
        toml::from_str(&deploy_config_str).context(error::InvalidTomlSnafu { path })
    }

    /// Renders the template and the service/task/target specs as pretty JSON; this is the whole
    /// of the `debug` subcommand, so it must not touch the network.
    pub(crate) fn dump(&self) -> Result<String> {
        let view = serde_json::json!({
            "task_definition": self.task_definition,
            "update_services": self.update_services,
            "run_tasks": self.run_tasks,
            "event_targets": self.event_targets,
        });
        serde_json::to_string_pretty(&view).context(error::SerializeSnafu)
    }
}

/// Template for the task definition we register on each deploy.  Container image fields may
/// contain the `{image_tag}` placeholder.
#[derive(Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub(crate) struct TaskDefinitionTemplate {
    pub(crate) family: String,
    pub(crate) cpu: Option<String>,
    pub(crate) memory: Option<String>,
    pub(crate) network_mode: Option<String>,
    pub(crate) task_role_arn: Option<String>,
    pub(crate) execution_role_arn: Option<String>,
    #[serde(default)]
    pub(crate) requires_compatibilities: Vec<String>,
    #[serde(default)]
    pub(crate) container_definitions: Vec<ContainerDefinition>,
}

impl TaskDefinitionTemplate {
    /// Replaces the `{image_tag}` placeholder in every container's image field with the given
    /// tag.  Containers whose image doesn't carry the placeholder are left alone.
    pub(crate) fn inject_image_tag(&mut self, image_tag: &str) {
        for container in &mut self.container_definitions {
            container.image = container.image.replace(IMAGE_TAG_PLACEHOLDER, image_tag);
        }
    }
}

#[derive(Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub(crate) struct ContainerDefinition {
    pub(crate) name: String,
    pub(crate) image: String,
    pub(crate) essential: Option<bool>,
    pub(crate) cpu: Option<i32>,
    pub(crate) memory: Option<i32>,
    pub(crate) command: Option<Vec<String>>,
    // BTreeMap so the rendered environment is deterministic
    #[serde(default)]
    pub(crate) environment: BTreeMap<String, String>,
}

/// Identifies a long-running service that should track the newly registered definition.
#[derive(Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub(crate) struct ServiceUpdateSpec {
    pub(crate) service: String,
    pub(crate) cluster: Option<String>,
    pub(crate) desired_count: Option<i32>,
    #[serde(default)]
    pub(crate) force_new_deployment: bool,
}

/// Parameters for a one-off task launched against the newly registered definition, e.g. a
/// database migration that has to finish before services move over.
#[derive(Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub(crate) struct RunTaskSpec {
    pub(crate) cluster: Option<String>,
    pub(crate) count: Option<i32>,
    pub(crate) launch_type: Option<String>,
    pub(crate) group: Option<String>,
    pub(crate) started_by: Option<String>,
}

/// An EventBridge rule and the targets we rewrite to point at the new definition.
#[derive(Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub(crate) struct EventTargetSpec {
    pub(crate) rule: String,
    pub(crate) event_bus_name: Option<String>,
    #[serde(default)]
    pub(crate) targets: Vec<EventTarget>,
}

impl EventTargetSpec {
    /// Rewrites the embedded task definition ARN of every target; must happen before the spec is
    /// pushed with put_targets.
    pub(crate) fn set_task_definition_arn(&mut self, task_definition_arn: &str) {
        for target in &mut self.targets {
            target.ecs_parameters.task_definition_arn = task_definition_arn.to_string();
        }
    }
}

#[derive(Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub(crate) struct EventTarget {
    pub(crate) id: String,
    pub(crate) arn: String,
    pub(crate) role_arn: Option<String>,
    pub(crate) ecs_parameters: EcsTargetParameters,
}

#[derive(Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub(crate) struct EcsTargetParameters {
    // Overwritten with the deployed definition's ARN before every push, so the configured value
    // is irrelevant and usually omitted.
    #[serde(default)]
    pub(crate) task_definition_arn: String,
    pub(crate) task_count: Option<i32>,
    pub(crate) launch_type: Option<String>,
}

/// Where to send best-effort notifications about control plane calls.
#[derive(Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub(crate) struct NotificationConfig {
    pub(crate) topic_arn: String,

    /// Method names that should not produce a notification; when unset, a default list of
    /// read-only methods is used.
    pub(crate) excluded_methods: Option<Vec<String>>,
}

mod error {
    use snafu::Snafu;
    use std::io;
    use std::path::PathBuf;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub(crate) enum Error {
        #[snafu(display("Failed to read deployment config from '{}': {}", path.display(), source))]
        File { path: PathBuf, source: io::Error },

        #[snafu(display("Deployment config at '{}' is invalid TOML: {}", path.display(), source))]
        InvalidToml {
            path: PathBuf,
            source: toml::de::Error,
        },

        #[snafu(display("Failed to serialize deployment config: {}", source))]
        Serialize { source: serde_json::Error },
    }
}
pub(crate) use error::Error;
type Result<T> = std::result::Result<T, error::Error>;
