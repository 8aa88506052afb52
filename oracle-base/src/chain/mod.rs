pub use ethers_client::*;

mod conversions;
mod ethers_client;
