use ciborium::value::{Integer, Value as Cbor};
use serde_json::{Map, Number, Value};

use oracle_core::U256;

use super::{parse_hex, to_hex, TaskContext, TaskError};

const CBOR_TAG_POS_BIGNUM: u64 = 2;
const CBOR_TAG_NEG_BIGNUM: u64 = 3;

pub(super) fn json_parse(ctx: &TaskContext<'_>) -> Result<Value, TaskError> {
    let doc = match ctx.value_or_input("data")? {
        Value::String(s) => serde_json::from_str(&s)
            .map_err(|e| TaskError::Parse(format!("data is not JSON: {e}")))?,
        other => other,
    };
    let path = match ctx.json("path")? {
        None | Some(Value::Null) => vec![],
        Some(Value::Array(items)) => items
            .into_iter()
            .map(|i| match i {
                Value::String(s) => s,
                other => other.to_string(),
            })
            .collect(),
        Some(Value::String(s)) => split_path(&s),
        Some(other) => split_path(&other.to_string()),
    };
    let lax = ctx.bool("lax", false)?;

    let mut current = &doc;
    for (depth, segment) in path.iter().enumerate() {
        let next = match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => array_index(items.len(), segment).and_then(|i| items.get(i)),
            _ => None,
        };
        match next {
            Some(v) => current = v,
            None if lax => return Ok(Value::Null),
            None => {
                return Err(TaskError::Parse(format!(
                    "path {:?} not found",
                    path[..=depth].join(",")
                )))
            }
        }
    }
    Ok(current.clone())
}

fn split_path(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

fn array_index(len: usize, segment: &str) -> Option<usize> {
    let i: i64 = segment.parse().ok()?;
    if i < 0 {
        len.checked_sub(i.unsigned_abs() as usize)
    } else {
        Some(i as usize)
    }
}

pub(super) fn cbor_parse(ctx: &TaskContext<'_>) -> Result<Value, TaskError> {
    let mut bytes = match ctx.value_or_input("data")? {
        Value::String(s) => parse_hex(&s).map_err(TaskError::Parse)?,
        Value::Array(items) => items
            .iter()
            .map(|i| i.as_u64().and_then(|b| u8::try_from(b).ok()))
            .collect::<Option<Vec<u8>>>()
            .ok_or_else(|| TaskError::Parse("data is not a byte array".into()))?,
        other => return Err(TaskError::Parse(format!("{other} is not CBOR data"))),
    };
    let diet = match ctx.string("mode")? {
        None => false,
        Some(m) => match m.trim().to_ascii_lowercase().as_str() {
            "diet" => true,
            "standard" => false,
            other => {
                return Err(TaskError::BadParam {
                    name: "mode",
                    reason: format!("{other} is not diet or standard"),
                })
            }
        },
    };
    // diet data is the body of an indefinite length map without its framing
    if diet && !bytes.first().is_some_and(|b| (0xa0..=0xbf).contains(b)) {
        bytes.insert(0, 0xbf);
        bytes.push(0xff);
    }
    if bytes.is_empty() {
        return Ok(Value::Object(Map::new()));
    }
    let decoded: Cbor = ciborium::de::from_reader(bytes.as_slice())
        .map_err(|e| TaskError::Parse(format!("invalid CBOR: {e}")))?;
    cbor_to_json(decoded)
}

fn cbor_to_json(v: Cbor) -> Result<Value, TaskError> {
    Ok(match v {
        Cbor::Null => Value::Null,
        Cbor::Bool(b) => Value::Bool(b),
        Cbor::Integer(i) => integer_to_json(i),
        Cbor::Float(f) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        Cbor::Text(s) => Value::String(s),
        Cbor::Bytes(b) => Value::String(to_hex(&b)),
        Cbor::Array(items) => Value::Array(
            items
                .into_iter()
                .map(cbor_to_json)
                .collect::<Result<_, _>>()?,
        ),
        Cbor::Map(entries) => {
            let mut map = Map::with_capacity(entries.len());
            for (k, v) in entries {
                map.insert(map_key(k)?, cbor_to_json(v)?);
            }
            Value::Object(map)
        }
        Cbor::Tag(CBOR_TAG_POS_BIGNUM, inner) => match *inner {
            Cbor::Bytes(b) => Value::String(bignum(&b)?.to_string()),
            other => cbor_to_json(other)?,
        },
        Cbor::Tag(CBOR_TAG_NEG_BIGNUM, inner) => match *inner {
            Cbor::Bytes(b) => {
                let n = bignum(&b)?;
                let n = n
                    .checked_add(U256::one())
                    .ok_or_else(|| TaskError::Parse("negative bignum overflows".into()))?;
                Value::String(format!("-{n}"))
            }
            other => cbor_to_json(other)?,
        },
        Cbor::Tag(_, inner) => cbor_to_json(*inner)?,
        other => return Err(TaskError::Parse(format!("unsupported CBOR value {other:?}"))),
    })
}

fn integer_to_json(i: Integer) -> Value {
    let i = i128::from(i);
    if let Ok(n) = i64::try_from(i) {
        Value::Number(n.into())
    } else if let Ok(n) = u64::try_from(i) {
        Value::Number(n.into())
    } else {
        Value::String(i.to_string())
    }
}

fn bignum(b: &[u8]) -> Result<U256, TaskError> {
    if b.len() > 32 {
        return Err(TaskError::Parse("bignum wider than 256 bits".into()));
    }
    Ok(U256::from_big_endian(b))
}

/// JSON object keys must be text; other CBOR keys are rendered.
fn map_key(k: Cbor) -> Result<String, TaskError> {
    Ok(match k {
        Cbor::Text(s) => s,
        Cbor::Integer(i) => i128::from(i).to_string(),
        Cbor::Bytes(b) => to_hex(&b),
        Cbor::Bool(b) => b.to_string(),
        Cbor::Float(f) => f.to_string(),
        Cbor::Null => "null".into(),
        other => match cbor_to_json(other)? {
            Value::String(s) => s,
            v => v.to_string(),
        },
    })
}
