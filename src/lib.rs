pub mod claim;
pub mod config;
pub mod error;
pub mod inventory;
pub mod remote;
pub mod shutdown;
pub mod status;
pub mod supervisor;
pub mod worker;

pub use error::{HostwardenError, Result};
