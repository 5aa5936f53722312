//! CLI command implementations.
//!
//! | Module    | Commands handled   |
//! |-----------|--------------------|
//! | `serve`   | `Serve`            |
//! | `offline` | `Check`, `Hash`    |

pub mod offline;
pub mod serve;

pub use offline::{cmd_check, cmd_hash};
pub use serve::cmd_serve;
