//! VM management IPC over unix stream sockets in `/run/acrn/mngr`, plus the
//! VM inventory helpers shared by the manager tools.

pub mod mngr;
pub mod msg;
pub mod vm_ops;

pub use mngr::{MngrClient, MngrServer};
pub use msg::MngrMsg;

pub const ACRN_DM_BASE_PATH: &str = "/run/acrn";
pub const ACRN_DM_SOCK_PATH: &str = "/run/acrn/mngr";
pub const ACRN_CONF_PATH: &str = "/opt/acrn/conf";
pub const ACRN_CONF_PATH_ADD: &str = "/opt/acrn/conf/add";
pub const ACRN_CONF_TIMER_LIST: &str = "/opt/acrn/conf/timer_list";
