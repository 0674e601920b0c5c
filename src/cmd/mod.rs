//! CLI command implementations.
//!
//! | Module        | Commands handled                       |
//! |---------------|----------------------------------------|
//! | `run`         | `Run`                                  |
//! | `checkpoints` | `Checkpoints List`, `Checkpoints Clean`|
//! | `status`      | `Status`                               |

pub mod checkpoints;
pub mod run;
pub mod status;

pub use checkpoints::{cmd_checkpoints_clean, cmd_checkpoints_list};
pub use run::{RunArgs, cmd_run};
pub use status::cmd_status;
