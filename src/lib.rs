pub mod config;
pub mod configuration;
pub mod envfile;
pub mod errors;
pub mod logging;
pub mod operator;
pub mod orchestrator;
pub mod prober;
pub mod provisioner;
pub mod scripts;
pub mod setup_config;
pub mod steps;
pub mod ui;
pub mod validator;
pub mod workspace;
