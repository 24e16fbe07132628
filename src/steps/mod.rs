//! Static step table for a setup session.
//!
//! Each [`StepDef`] names a stable id, a label, the ids it depends on and the
//! [`StepKind`] the orchestrator dispatches to. [`registry`] builds the validated
//! [`StepGraph`] once per process.

pub mod graph;
pub mod status;

pub use graph::{StepGraph, StepIndex};
pub use status::StepStatus;

use crate::errors::RegistryError;

pub const VALIDATE_PREREQUISITES: &str = "validate_prerequisites";
pub const DETECT_ENVIRONMENT: &str = "detect_environment";
pub const COLLECT_USER_INPUT: &str = "collect_user_input";
pub const VALIDATE_CONFIG: &str = "validate_config";
pub const CREATE_CATALOG_SCHEMA: &str = "create_catalog_schema";
pub const CREATE_EXPERIMENT: &str = "create_experiment";
pub const CREATE_APP: &str = "create_app";
pub const SETUP_PERMISSIONS: &str = "setup_permissions";
pub const GENERATE_ENV_FILE: &str = "generate_env_file";
pub const INSTALL_DEPENDENCIES: &str = "install_dependencies";
pub const LOAD_SAMPLE_DATA: &str = "load_sample_data";
pub const VALIDATE_LOCAL_SETUP: &str = "validate_local_setup";
pub const DEPLOY_APP: &str = "deploy_app";
pub const VALIDATE_DEPLOYMENT: &str = "validate_deployment";
pub const RUN_INTEGRATION_TESTS: &str = "run_integration_tests";

/// Which handler runs a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    Prerequisites,
    DetectEnvironment,
    CollectInput,
    ValidateConfig,
    CatalogSchema,
    Experiment,
    App,
    Permissions,
    EnvFile,
    InstallDependencies,
    SampleData,
    LocalValidation,
    Deploy,
    DeploymentValidation,
    IntegrationTests,
}

impl StepKind {
    /// Steps that only exist for a deployed app and are skipped in notebook-only mode.
    pub fn app_only(&self) -> bool {
        matches!(
            self,
            StepKind::App | StepKind::Permissions | StepKind::DeploymentValidation
        )
    }
}

/// One row of the step table.
#[derive(Debug, Clone)]
pub struct StepDef {
    pub id: &'static str,
    pub label: &'static str,
    pub description: &'static str,
    pub dependencies: &'static [&'static str],
    pub kind: StepKind,
}

/// The fifteen steps of a setup session, in table order.
pub fn step_table() -> Vec<StepDef> {
    vec![
        StepDef {
            id: VALIDATE_PREREQUISITES,
            label: "Validate prerequisites",
            description: "Check workspace authentication, required tools and connectivity",
            dependencies: &[],
            kind: StepKind::Prerequisites,
        },
        StepDef {
            id: DETECT_ENVIRONMENT,
            label: "Detect workspace environment",
            description: "Discover catalogs, schemas, apps and chat models; probe permissions",
            dependencies: &[VALIDATE_PREREQUISITES],
            kind: StepKind::DetectEnvironment,
        },
        StepDef {
            id: COLLECT_USER_INPUT,
            label: "Collect configuration",
            description: "Choose catalog, schema, app name, model and deployment mode",
            dependencies: &[DETECT_ENVIRONMENT],
            kind: StepKind::CollectInput,
        },
        StepDef {
            id: VALIDATE_CONFIG,
            label: "Validate configuration",
            description: "Check every configuration field and preview the installation",
            dependencies: &[COLLECT_USER_INPUT],
            kind: StepKind::ValidateConfig,
        },
        StepDef {
            id: CREATE_CATALOG_SCHEMA,
            label: "Create catalog and schema",
            description: "Ensure the Unity Catalog catalog and schema exist",
            dependencies: &[VALIDATE_CONFIG],
            kind: StepKind::CatalogSchema,
        },
        StepDef {
            id: CREATE_EXPERIMENT,
            label: "Create experiment",
            description: "Ensure the MLflow experiment exists",
            dependencies: &[COLLECT_USER_INPUT, CREATE_CATALOG_SCHEMA],
            kind: StepKind::Experiment,
        },
        StepDef {
            id: CREATE_APP,
            label: "Create app",
            description: "Ensure the Databricks app record exists",
            dependencies: &[VALIDATE_CONFIG],
            kind: StepKind::App,
        },
        StepDef {
            id: SETUP_PERMISSIONS,
            label: "Grant permissions",
            description: "Grant the app identity access to schema, experiment and model endpoint",
            dependencies: &[CREATE_APP, CREATE_EXPERIMENT],
            kind: StepKind::Permissions,
        },
        StepDef {
            id: GENERATE_ENV_FILE,
            label: "Generate environment file",
            description: "Write the KEY=\"value\" environment file",
            dependencies: &[CREATE_EXPERIMENT, CREATE_APP],
            kind: StepKind::EnvFile,
        },
        StepDef {
            id: INSTALL_DEPENDENCIES,
            label: "Install dependencies",
            description: "Run the dependency-install scripts",
            dependencies: &[GENERATE_ENV_FILE],
            kind: StepKind::InstallDependencies,
        },
        StepDef {
            id: LOAD_SAMPLE_DATA,
            label: "Load sample data",
            description: "Run the sample-data scripts in order",
            dependencies: &[INSTALL_DEPENDENCIES],
            kind: StepKind::SampleData,
        },
        StepDef {
            id: VALIDATE_LOCAL_SETUP,
            label: "Validate local setup",
            description: "Check the generated environment file is complete",
            dependencies: &[LOAD_SAMPLE_DATA],
            kind: StepKind::LocalValidation,
        },
        StepDef {
            id: DEPLOY_APP,
            label: "Deploy app",
            description: "Run the deploy script (sync-only in notebook mode)",
            dependencies: &[
                INSTALL_DEPENDENCIES,
                GENERATE_ENV_FILE,
                SETUP_PERMISSIONS,
                VALIDATE_LOCAL_SETUP,
            ],
            kind: StepKind::Deploy,
        },
        StepDef {
            id: VALIDATE_DEPLOYMENT,
            label: "Validate deployment",
            description: "Wait for the app and check resources, health and end-to-end path",
            dependencies: &[DEPLOY_APP],
            kind: StepKind::DeploymentValidation,
        },
        StepDef {
            id: RUN_INTEGRATION_TESTS,
            label: "Run integration tests",
            description: "Run the configured integration test scripts",
            dependencies: &[VALIDATE_DEPLOYMENT],
            kind: StepKind::IntegrationTests,
        },
    ]
}

/// Build the validated graph for the standard step table.
pub fn registry() -> Result<StepGraph, RegistryError> {
    StepGraph::build(step_table())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_registry_is_valid() {
        let graph = registry().unwrap();
        assert_eq!(graph.len(), 15);
    }

    #[test]
    fn test_order_respects_every_dependency() {
        let graph = registry().unwrap();
        let mut seen = HashSet::new();
        for step in graph.ordered() {
            for dep in step.dependencies {
                assert!(seen.contains(dep), "{} ran before {}", step.id, dep);
            }
            seen.insert(step.id);
        }
    }

    #[test]
    fn test_documented_edges() {
        let graph = registry().unwrap();
        assert_eq!(
            graph.dependencies(DETECT_ENVIRONMENT),
            vec![VALIDATE_PREREQUISITES]
        );
        let exp = graph.dependencies(CREATE_EXPERIMENT);
        assert!(exp.contains(&COLLECT_USER_INPUT));
        assert!(exp.contains(&CREATE_CATALOG_SCHEMA));
        let deploy = graph.dependencies(DEPLOY_APP);
        assert!(deploy.contains(&INSTALL_DEPENDENCIES));
        assert!(deploy.contains(&GENERATE_ENV_FILE));
    }

    #[test]
    fn test_validation_is_first_and_tests_last() {
        let graph = registry().unwrap();
        let ids: Vec<&str> = graph.ordered().map(|s| s.id).collect();
        assert_eq!(ids.first(), Some(&VALIDATE_PREREQUISITES));
        assert_eq!(ids.last(), Some(&RUN_INTEGRATION_TESTS));
    }

    #[test]
    fn test_app_only_steps() {
        let app_only: Vec<&str> = step_table()
            .into_iter()
            .filter(|s| s.kind.app_only())
            .map(|s| s.id)
            .collect();
        assert_eq!(
            app_only,
            vec![CREATE_APP, SETUP_PERMISSIONS, VALIDATE_DEPLOYMENT]
        );
    }
}
