//! CLI command implementations.
//!
//! | Module    | Flags handled                                    |
//! |-----------|--------------------------------------------------|
//! | `run`     | (none), `--resume`, `--dry-run`, `--validate-only` |
//! | `session` | `--status`, `--reset`, `--cleanup`               |

pub mod run;
pub mod session;

pub use run::cmd_run;
pub use session::{cmd_cleanup, cmd_reset, cmd_status};
