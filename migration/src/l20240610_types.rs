use sea_orm_migration::prelude::*;

/// Hashes are to be stored as binary.
#[allow(non_upper_case_globals)]
pub const Hash: ColumnType = ColumnType::Blob;
/// Addresses are to be stored as binary.
#[allow(non_upper_case_globals)]
pub const Address: ColumnType = ColumnType::Blob;

/// 256-bit integer as base-10 digits: ceil(log_10(2^256))
pub const SIGNIFICANT_DIGITS_IN_256_BIT_INTEGER: u32 = 78;
/// Arbitrary byte strings such as calldata and signed transactions.
#[allow(non_upper_case_globals)]
pub const Bytes: ColumnType = ColumnType::Blob;
