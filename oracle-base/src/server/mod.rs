pub use base_server::*;

mod base_server;
/// Response types shared by every route
pub mod utils;
