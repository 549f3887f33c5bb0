// File helpers shared by the controller and observers
pub mod json_ops;

pub use json_ops::*;
