pub mod analysis;
pub mod capture;
pub mod recognition;
pub mod scheduler;
pub mod source;
