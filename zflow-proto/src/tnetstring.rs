//! Tnetstring encoding of [`Value`].
//!
//! Each item is `<length>:<payload><tag>` where the tag byte names the
//! type: `,` bytes, `#` integer, `^` float, `!` boolean, `~` null,
//! `]` list, `}` dictionary.

use std::collections::BTreeMap;

use crate::{DecodeError, Value};

/// Lengths are at most nine decimal digits (just under 1 GB).
const MAX_LEN_DIGITS: usize = 9;

/// Containers nested deeper than this are rejected.
const MAX_DEPTH: usize = 64;

/// Encodes `value` as a tnetstring.
pub fn to_vec(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    write_value(&mut out, value);
    out
}

/// Decodes exactly one tnetstring spanning all of `input`.
pub fn from_slice(input: &[u8]) -> Result<Value, DecodeError> {
    let (value, rest) = parse(input, 0)?;
    if !rest.is_empty() {
        return Err(DecodeError::Tnetstring("trailing data"));
    }
    Ok(value)
}

fn write_value(out: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Null => write_item(out, b"", b'~'),
        Value::Bool(b) => write_item(out, if *b { b"true" } else { b"false" }, b'!'),
        Value::Int(i) => write_item(out, i.to_string().as_bytes(), b'#'),
        Value::Float(f) => write_item(out, f.to_string().as_bytes(), b'^'),
        Value::Bytes(b) => write_item(out, b, b','),
        Value::List(items) => {
            let mut inner = Vec::new();
            for item in items {
                write_value(&mut inner, item);
            }
            write_item(out, &inner, b']');
        }
        Value::Map(map) => {
            let mut inner = Vec::new();
            for (k, v) in map {
                write_item(&mut inner, k.as_bytes(), b',');
                write_value(&mut inner, v);
            }
            write_item(out, &inner, b'}');
        }
    }
}

fn write_item(out: &mut Vec<u8>, payload: &[u8], tag: u8) {
    out.extend_from_slice(payload.len().to_string().as_bytes());
    out.push(b':');
    out.extend_from_slice(payload);
    out.push(tag);
}

/// Parses one item from the front of `input`, returning it and the rest.
fn parse(input: &[u8], depth: usize) -> Result<(Value, &[u8]), DecodeError> {
    if depth > MAX_DEPTH {
        return Err(DecodeError::Tnetstring("nesting too deep"));
    }

    let colon = input
        .iter()
        .take(MAX_LEN_DIGITS + 1)
        .position(|&b| b == b':')
        .ok_or(DecodeError::Tnetstring("missing length prefix"))?;
    let digits = &input[..colon];
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return Err(DecodeError::Tnetstring("invalid length prefix"));
    }
    let len: usize = ascii(digits)?
        .parse()
        .map_err(|_| DecodeError::Tnetstring("invalid length prefix"))?;

    let start = colon + 1;
    let end = start
        .checked_add(len)
        .filter(|&end| end < input.len())
        .ok_or(DecodeError::Tnetstring("truncated item"))?;
    let payload = &input[start..end];
    let tag = input[end];
    let rest = &input[end + 1..];

    let value = match tag {
        b',' => Value::Bytes(payload.to_vec()),
        b'#' => Value::Int(
            ascii(payload)?
                .parse()
                .map_err(|_| DecodeError::Tnetstring("invalid integer"))?,
        ),
        b'^' => Value::Float(
            ascii(payload)?
                .parse()
                .map_err(|_| DecodeError::Tnetstring("invalid float"))?,
        ),
        b'!' => match payload {
            b"true" => Value::Bool(true),
            b"false" => Value::Bool(false),
            _ => return Err(DecodeError::Tnetstring("invalid boolean")),
        },
        b'~' => {
            if !payload.is_empty() {
                return Err(DecodeError::Tnetstring("null with payload"));
            }
            Value::Null
        }
        b']' => {
            let mut items = Vec::new();
            let mut cur = payload;
            while !cur.is_empty() {
                let (item, next) = parse(cur, depth + 1)?;
                items.push(item);
                cur = next;
            }
            Value::List(items)
        }
        b'}' => Value::Map(parse_map(payload, depth)?),
        _ => return Err(DecodeError::Tnetstring("unknown type tag")),
    };

    Ok((value, rest))
}

fn parse_map(payload: &[u8], depth: usize) -> Result<BTreeMap<String, Value>, DecodeError> {
    let mut map = BTreeMap::new();
    let mut cur = payload;
    while !cur.is_empty() {
        let (key, after_key) = parse(cur, depth + 1)?;
        let Value::Bytes(key) = key else {
            return Err(DecodeError::Tnetstring("dictionary key is not a string"));
        };
        let key =
            String::from_utf8(key).map_err(|_| DecodeError::Tnetstring("dictionary key is not UTF-8"))?;
        if after_key.is_empty() {
            return Err(DecodeError::Tnetstring("dictionary key without value"));
        }
        let (value, next) = parse(after_key, depth + 1)?;
        map.insert(key, value);
        cur = next;
    }
    Ok(map)
}

fn ascii(bytes: &[u8]) -> Result<&str, DecodeError> {
    std::str::from_utf8(bytes).map_err(|_| DecodeError::Tnetstring("non-ASCII scalar"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_scalars() {
        assert_eq!(to_vec(&Value::str("hello")), b"5:hello,");
        assert_eq!(to_vec(&Value::Int(-42)), b"3:-42#");
        assert_eq!(to_vec(&Value::Bool(true)), b"4:true!");
        assert_eq!(to_vec(&Value::Null), b"0:~");
    }

    #[test]
    fn encodes_nested_dict() {
        let mut map = BTreeMap::new();
        map.insert("id".to_owned(), Value::str("a"));
        map.insert("seq".to_owned(), Value::Int(0));
        let encoded = to_vec(&Value::Map(map));
        assert_eq!(encoded, b"19:2:id,1:a,3:seq,1:0#}");
    }

    #[test]
    fn decodes_python_style_dict() {
        // As produced by `tnetstring.dumps({'id': 'x', 'more': True, 'h': [['a', 'b']]})`.
        let input = b"42:2:id,1:x,4:more,4:true!1:h,11:8:1:a,1:b,]]}";
        let Value::Map(map) = from_slice(input).unwrap() else {
            panic!("expected map");
        };
        assert_eq!(map["id"], Value::str("x"));
        assert_eq!(map["more"], Value::Bool(true));
        assert_eq!(
            map["h"],
            Value::List(vec![Value::List(vec![Value::str("a"), Value::str("b")])])
        );
    }

    #[test]
    fn binary_payload_survives() {
        let raw: Vec<u8> = (0..=255).collect();
        let decoded = from_slice(&to_vec(&Value::Bytes(raw.clone()))).unwrap();
        assert_eq!(decoded, Value::Bytes(raw));
    }

    #[test]
    fn rejects_malformed_input() {
        let cases: &[&[u8]] = &[
            b"",
            b"5:abc,",
            b"x:abc,",
            b"+3:abc,",
            b"3:abc?",
            b"3:abc,trailing",
            b"5:maybe!",
            b"2:1x#",
            b"6:1:a,1#}",
            b"5:1:a,}",
            b"1234567890:a,",
        ];
        for case in cases {
            assert!(from_slice(case).is_err(), "accepted {:?}", String::from_utf8_lossy(case));
        }
    }

    #[test]
    fn rejects_excessive_nesting() {
        let mut value = Value::List(Vec::new());
        for _ in 0..=MAX_DEPTH + 1 {
            value = Value::List(vec![value]);
        }
        assert_eq!(
            from_slice(&to_vec(&value)),
            Err(DecodeError::Tnetstring("nesting too deep"))
        );
    }
}
