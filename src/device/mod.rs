pub mod btle;
pub mod constants;
pub mod controller;
pub mod frame;
pub mod session;
pub mod transport;
pub mod types;
