pub use head::*;
pub use log::*;
pub use receipt::*;
pub use transaction::*;

mod head;
mod log;
mod receipt;
mod transaction;
