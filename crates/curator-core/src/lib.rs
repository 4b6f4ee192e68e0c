//! Background task core: tracking, admission, isolated workers,
//! cancellation and live progress streaming.

pub mod admission;
pub mod cancel;
pub mod error;
pub mod manager;
pub mod registry;
pub mod stream;
pub mod tracker;
pub mod unit;
pub mod worker;

pub use error::{TaskError, TaskResult};
pub use manager::{CreateStatus, CreatedTask, TaskManager, TaskRequest};
