pub mod message;
pub mod payload;
pub mod retry;
pub mod types;

pub use message::*;
pub use payload::*;
pub use retry::*;
pub use types::*;
