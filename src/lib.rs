pub mod access;
pub mod cells;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod locks;
pub mod store;
