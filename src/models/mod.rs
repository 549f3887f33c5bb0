// Data models (structs)
pub mod bridge;
pub mod download;
pub mod settings;

pub use bridge::*;
pub use download::*;
pub use settings::*;
