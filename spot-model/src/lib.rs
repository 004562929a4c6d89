//! Typed playbook and inventory model: parsing (YAML and TOML, full and
//! simplified forms), validation, and target resolution.

mod cmd;
mod error;
mod inventory;
mod playbook;
mod target;

pub use self::cmd::{
    format_duration, parse_duration, Cmd, CmdAction, CmdOptions, CopyDirection, CopySpec,
    DeleteSpec, LineSpec, SyncSpec, WaitSpec,
};
pub use self::error::{ModelError, ModelResult};
pub use self::inventory::{Inventory, ALL_GROUP};
pub use self::playbook::{Overrides, Playbook, Task, AD_HOC_TASK_NAME, DEFAULT_NAME};
pub use self::target::{
    current_user, parse_host_port, parse_host_port_lenient, Destination, Target, DEFAULT_SSH_PORT,
};
