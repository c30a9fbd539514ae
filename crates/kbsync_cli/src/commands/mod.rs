//! CLI command implementations.

pub mod device;
pub mod init;
pub mod keygen;
pub mod status;
pub mod sync;
pub mod watch;
