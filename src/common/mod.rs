//! Miscellaneous common structs used throughout the library.

mod id;
pub mod messages;
mod node;
mod transaction_id;

pub use id::*;
pub use messages::*;
pub use node::*;
pub use transaction_id::*;
