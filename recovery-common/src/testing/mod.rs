//! Test support shared by the workspace's unit and integration tests.

mod log;

pub use log::init_test_logging;
