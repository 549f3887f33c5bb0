// Command handlers - one file per domain
pub mod downloads;
pub mod settings;
