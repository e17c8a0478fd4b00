//! Device drivers.
//!
//! Each supported device family gets its own submodule with a blocking
//! driver; the async logging loop wraps the blocking calls.

pub mod minimon;
pub mod radpro;
