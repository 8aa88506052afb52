pub use chain_client::*;
pub use key_store::*;

mod chain_client;
mod key_store;
