use chrono::{DateTime, TimeZone, Utc};
use sea_orm::{prelude::TimeDateTime, DbErr};
use time::{OffsetDateTime, PrimitiveDateTime};

use oracle_core::{Address, H256, U256};

/// Current UTC time as stored in the database.
pub fn now() -> TimeDateTime {
    let now = OffsetDateTime::now_utc();
    PrimitiveDateTime::new(now.date(), now.time())
}

/// Database timestamp to chrono, interpreting it as UTC.
pub fn to_chrono(dt: TimeDateTime) -> DateTime<Utc> {
    let odt = dt.assume_utc();
    Utc.timestamp_opt(odt.unix_timestamp(), odt.nanosecond())
        .single()
        .unwrap_or_default()
}

/// Chrono UTC timestamp to the database representation.
pub fn from_chrono(dt: DateTime<Utc>) -> TimeDateTime {
    let odt = OffsetDateTime::from_unix_timestamp(dt.timestamp())
        .unwrap_or(OffsetDateTime::UNIX_EPOCH)
        .replace_nanosecond(dt.timestamp_subsec_nanos())
        .unwrap_or(OffsetDateTime::UNIX_EPOCH);
    PrimitiveDateTime::new(odt.date(), odt.time())
}

/// Hash as stored in a binary column.
pub fn h256_to_bytes(hash: &H256) -> Vec<u8> {
    hash.as_bytes().to_vec()
}

/// Binary column to a hash; the column must hold exactly 32 bytes.
pub fn bytes_to_h256(bytes: &[u8]) -> Result<H256, DbErr> {
    if bytes.len() != 32 {
        return Err(DbErr::Custom(format!(
            "expected 32 bytes for a hash, found {}",
            bytes.len()
        )));
    }
    Ok(H256::from_slice(bytes))
}

/// Address as stored in a binary column.
pub fn address_to_bytes(address: &Address) -> Vec<u8> {
    address.as_bytes().to_vec()
}

/// Binary column to an address; the column must hold exactly 20 bytes.
pub fn bytes_to_address(bytes: &[u8]) -> Result<Address, DbErr> {
    if bytes.len() != 20 {
        return Err(DbErr::Custom(format!(
            "expected 20 bytes for an address, found {}",
            bytes.len()
        )));
    }
    Ok(Address::from_slice(bytes))
}

/// Wei amounts are stored as base-10 text.
pub fn u256_to_string(v: U256) -> String {
    v.to_string()
}

/// Parses a base-10 wei column.
pub fn string_to_u256(s: &str) -> Result<U256, DbErr> {
    U256::from_dec_str(s).map_err(|e| DbErr::Custom(format!("invalid wei amount {s:?}: {e}")))
}

/// Block numbers and nonces are stored as signed 64 bit integers.
pub fn u64_to_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

/// Inverse of [`u64_to_i64`]; negative values read as zero.
pub fn i64_to_u64(v: i64) -> u64 {
    u64::try_from(v).unwrap_or_default()
}
