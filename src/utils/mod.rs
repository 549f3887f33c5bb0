pub mod clock;
pub mod paths;
pub mod source_url;

pub use clock::*;
pub use paths::*;
pub use source_url::*;
