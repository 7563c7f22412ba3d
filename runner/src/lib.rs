pub mod backends;
pub mod config;
pub mod distributed;
pub mod jobs;
pub mod workarea;

pub use backends::{Backend, BackendError, Backends};
pub use config::{BatchConfig, ConfigErrors, SubmitOptions, WaitOptions};
