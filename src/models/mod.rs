pub mod container;
pub mod error;
pub mod session;
