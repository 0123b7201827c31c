//! Binary internode encoding of result sets.
//!
//! Fork replies carry this format; originator replies carry JSON. The
//! blob is prefixed with a stable magic so the originator can tell the
//! two apart without sniffing for `{`.

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use evq_common::{EvqError, Result};

use crate::result_set::{ColumnDescriptor, ColumnKind, Reducer, ResultSet, RowKey};

const INTERNODE_MAGIC: &[u8; 4] = b"EVQ1";
const INTERNODE_VERSION: u32 = 1;

/// True when `bytes` starts with the internode magic.
pub fn is_internode_blob(bytes: &[u8]) -> bool {
    bytes.len() >= INTERNODE_MAGIC.len() && &bytes[..INTERNODE_MAGIC.len()] == INTERNODE_MAGIC
}

fn kind_tag(kind: ColumnKind) -> u8 {
    match kind {
        ColumnKind::Int => 0,
        ColumnKind::Double => 1,
        ColumnKind::Bool => 2,
        ColumnKind::Text => 3,
    }
}

fn kind_from_tag(tag: u8) -> Result<ColumnKind> {
    Ok(match tag {
        0 => ColumnKind::Int,
        1 => ColumnKind::Double,
        2 => ColumnKind::Bool,
        3 => ColumnKind::Text,
        other => {
            return Err(EvqError::internode(format!(
                "unknown column kind tag {other} in internode blob"
            )))
        }
    })
}

fn reducer_tag(reducer: Reducer) -> u8 {
    match reducer {
        Reducer::Sum => 0,
        Reducer::Min => 1,
        Reducer::Max => 2,
        Reducer::Count => 3,
        Reducer::First => 4,
    }
}

fn reducer_from_tag(tag: u8) -> Result<Reducer> {
    Ok(match tag {
        0 => Reducer::Sum,
        1 => Reducer::Min,
        2 => Reducer::Max,
        3 => Reducer::Count,
        4 => Reducer::First,
        other => {
            return Err(EvqError::internode(format!(
                "unknown reducer tag {other} in internode blob"
            )))
        }
    })
}

/// Merge per-worker sets and serialize the result as one internode blob.
///
/// An empty or all-empty input yields a valid empty blob, never an error:
/// a fork with no active partitions replies with exactly this.
pub fn multi_set_to_internode(sets: &[ResultSet]) -> Result<Vec<u8>> {
    let merged = match ResultSet::merge_all(sets.iter()) {
        Some(m) => m,
        None => ResultSet::new(Vec::new(), 1),
    };
    set_to_internode(&merged)
}

/// Serialize one result set as an internode blob.
pub fn set_to_internode(set: &ResultSet) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(64 + set.row_count() * 32);
    out.extend_from_slice(INTERNODE_MAGIC);
    write_u32(&mut out, INTERNODE_VERSION)?;
    write_u32(&mut out, set.columns().len() as u32)?;
    write_u32(&mut out, set.set_count() as u32)?;
    out.push(kind_tag(set.key_kind()));

    for column in set.columns() {
        let name = column.name.as_bytes();
        if name.len() > u16::MAX as usize {
            return Err(EvqError::internode("column name exceeds wire limit"));
        }
        out.write_u16::<LittleEndian>(name.len() as u16)
            .map_err(encode_err)?;
        out.extend_from_slice(name);
        out.push(kind_tag(column.kind));
        out.push(reducer_tag(column.reducer));
    }

    write_u32(&mut out, set.literals().len() as u32)?;
    let mut literals: Vec<(&i64, &String)> = set.literals().iter().collect();
    literals.sort_by_key(|(hash, _)| **hash);
    for (hash, text) in literals {
        out.write_i64::<LittleEndian>(*hash).map_err(encode_err)?;
        write_u32(&mut out, text.len() as u32)?;
        out.extend_from_slice(text.as_bytes());
    }

    write_u32(&mut out, set.row_count() as u32)?;
    for (key, cells) in set.rows() {
        if key.0.len() > RowKey::MAX_DEPTH {
            return Err(EvqError::internode("group key exceeds depth limit"));
        }
        out.push(key.0.len() as u8);
        for part in &key.0 {
            out.write_i64::<LittleEndian>(*part).map_err(encode_err)?;
        }
        for cell in cells {
            match cell {
                Some(value) => {
                    out.push(1);
                    out.write_i64::<LittleEndian>(*value).map_err(encode_err)?;
                }
                None => out.push(0),
            }
        }
    }

    Ok(out)
}

/// Decode one internode blob back into a result set.
pub fn internode_to_set(bytes: &[u8]) -> Result<ResultSet> {
    if !is_internode_blob(bytes) {
        return Err(EvqError::internode("reply is not an internode blob"));
    }
    let mut cur = Cursor::new(&bytes[INTERNODE_MAGIC.len()..]);
    let version = cur.read_u32::<LittleEndian>().map_err(decode_err)?;
    if version != INTERNODE_VERSION {
        return Err(EvqError::internode(format!(
            "unsupported internode blob version {version}"
        )));
    }
    let column_count = cur.read_u32::<LittleEndian>().map_err(decode_err)? as usize;
    let set_count = cur.read_u32::<LittleEndian>().map_err(decode_err)? as usize;
    let key_kind = kind_from_tag(cur.read_u8().map_err(decode_err)?)?;

    let mut columns = Vec::with_capacity(column_count);
    for _ in 0..column_count {
        let name_len = cur.read_u16::<LittleEndian>().map_err(decode_err)? as usize;
        let name = read_string(&mut cur, name_len)?;
        let kind = kind_from_tag(cur.read_u8().map_err(decode_err)?)?;
        let reducer = reducer_from_tag(cur.read_u8().map_err(decode_err)?)?;
        columns.push(ColumnDescriptor::new(name, kind, reducer));
    }

    let mut set = ResultSet::new(columns, set_count);
    set.set_key_kind(key_kind);

    let literal_count = cur.read_u32::<LittleEndian>().map_err(decode_err)?;
    for _ in 0..literal_count {
        let hash = cur.read_i64::<LittleEndian>().map_err(decode_err)?;
        let len = cur.read_u32::<LittleEndian>().map_err(decode_err)? as usize;
        let text = read_string(&mut cur, len)?;
        set.add_literal(hash, text);
    }

    let row_count = cur.read_u32::<LittleEndian>().map_err(decode_err)?;
    let arity = set.arity();
    for _ in 0..row_count {
        let depth = cur.read_u8().map_err(decode_err)? as usize;
        if depth > RowKey::MAX_DEPTH {
            return Err(EvqError::internode("group key exceeds depth limit"));
        }
        let mut parts = Vec::with_capacity(depth);
        for _ in 0..depth {
            parts.push(cur.read_i64::<LittleEndian>().map_err(decode_err)?);
        }
        let key = RowKey(parts);
        set.touch(&key);
        for at in 0..arity {
            let present = cur.read_u8().map_err(decode_err)?;
            if present == 1 {
                let value = cur.read_i64::<LittleEndian>().map_err(decode_err)?;
                set.seed_cell(&key, at, value);
            } else if present != 0 {
                return Err(EvqError::internode("corrupt cell presence flag"));
            }
        }
    }

    Ok(set)
}

fn write_u32(out: &mut Vec<u8>, value: u32) -> Result<()> {
    out.write_u32::<LittleEndian>(value).map_err(encode_err)
}

fn read_string(cur: &mut Cursor<&[u8]>, len: usize) -> Result<String> {
    let start = cur.position() as usize;
    let data = *cur.get_ref();
    let end = start
        .checked_add(len)
        .filter(|&e| e <= data.len())
        .ok_or_else(|| EvqError::internode("string runs past end of internode blob"))?;
    let s = std::str::from_utf8(&data[start..end])
        .map_err(|_| EvqError::internode("non-utf8 string in internode blob"))?
        .to_string();
    cur.set_position(end as u64);
    Ok(s)
}

fn encode_err(e: std::io::Error) -> EvqError {
    EvqError::internode(format!("internode encode failed: {e}"))
}

fn decode_err(e: std::io::Error) -> EvqError {
    EvqError::internode(format!("internode blob truncated: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_set() -> ResultSet {
        let columns = vec![
            ColumnDescriptor::new("count", ColumnKind::Int, Reducer::Sum),
            ColumnDescriptor::new("spend", ColumnKind::Double, Reducer::Sum),
        ];
        let mut set = ResultSet::new(columns, 2);
        set.add_literal(42, "mobile");
        let key = RowKey(vec![42, 7]);
        set.apply(&key, 0, 0, 3);
        set.apply(&key, 1, 1, 125_000);
        set.apply(&RowKey::single(9), 0, 1, 1);
        set
    }

    #[test]
    fn blob_detection() {
        let blob = set_to_internode(&sample_set()).expect("encode");
        assert!(is_internode_blob(&blob));
        assert!(!is_internode_blob(b"{\"error\":{}}"));
        assert!(!is_internode_blob(b""));
    }

    #[test]
    fn encode_decode_encode_is_bit_exact() {
        let blob = set_to_internode(&sample_set()).expect("encode");
        let decoded = internode_to_set(&blob).expect("decode");
        let again = set_to_internode(&decoded).expect("re-encode");
        assert_eq!(blob, again);
    }

    #[test]
    fn empty_multi_set_is_a_valid_blob() {
        let blob = multi_set_to_internode(&[]).expect("encode");
        assert!(is_internode_blob(&blob));
        let decoded = internode_to_set(&blob).expect("decode");
        assert_eq!(decoded.row_count(), 0);
    }

    #[test]
    fn truncated_blob_is_an_internode_error() {
        let blob = set_to_internode(&sample_set()).expect("encode");
        let err = internode_to_set(&blob[..blob.len() - 3]).expect_err("truncated");
        assert_eq!(err.code, evq_common::ErrorCode::InternodeError);
    }
}
