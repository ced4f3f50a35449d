pub mod realtime;
pub mod store;
pub mod token;
pub mod usage;

pub use realtime::{Realtime, RealtimeConfig};
pub use store::Store;
pub use token::Tokens;
pub use usage::{Locks, Usage};
