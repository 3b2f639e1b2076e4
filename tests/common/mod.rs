pub mod fixtures;
pub mod handlers;
pub mod testing;

pub use fixtures::*;
pub use handlers::*;
pub use testing::*;
