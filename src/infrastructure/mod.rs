pub mod backend;
#[cfg(windows)]
pub mod bluetooth;
pub mod link;
pub mod logging;
