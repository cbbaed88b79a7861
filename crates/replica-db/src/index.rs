//! Secondary index maintenance.
//!
//! An index maps `\0<secondary>\0<primary>` to the primary value, where the
//! secondary keys are the strings a JSON pointer selects from the value.

use replica_btree::{BTreeWrite, NodeSource};
use replica_dag::Write;
use replica_types::{Hash, Value};
use tracing::info;

use crate::commit::IndexDefinition;
use crate::error::{DbError, DbResult};

const KEY_VERSION_0: char = '\u{0}';
const KEY_SEPARATOR: char = '\u{0}';

/// Whether an index entry is being added or removed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexOperation {
    Add,
    Remove,
}

/// Encode a secondary and primary key into one index key.
pub fn encode_index_key(secondary: &str, primary: &str) -> DbResult<String> {
    if secondary.contains(KEY_SEPARATOR) {
        return Err(DbError::IndexValue {
            key: primary.to_owned(),
            reason: "secondary key cannot contain null byte".into(),
        });
    }
    let mut key = String::with_capacity(secondary.len() + primary.len() + 2);
    key.push(KEY_VERSION_0);
    key.push_str(secondary);
    key.push(KEY_SEPARATOR);
    key.push_str(primary);
    Ok(key)
}

/// Split an index key into its secondary and primary keys.
pub fn decode_index_key(key: &str) -> DbResult<(&str, &str)> {
    let invalid = || DbError::IndexValue {
        key: key.to_owned(),
        reason: "invalid index key".into(),
    };
    let rest = key.strip_prefix(KEY_VERSION_0).ok_or_else(invalid)?;
    rest.split_once(KEY_SEPARATOR).ok_or_else(invalid)
}

/// Secondary keys selected from `value` by `json_pointer`.
///
/// The pointer must select a string or an array of strings. A missing value
/// yields no keys when `allow_empty` is set.
pub fn get_index_keys(
    primary: &str,
    value: &Value,
    json_pointer: &str,
    allow_empty: bool,
) -> DbResult<Vec<String>> {
    let fail = |reason: &str| DbError::IndexValue {
        key: primary.to_owned(),
        reason: reason.to_owned(),
    };
    let target = match value.pointer(json_pointer) {
        Some(target) => target,
        None if allow_empty => return Ok(Vec::new()),
        None => return Err(fail(&format!("no value at path {json_pointer}"))),
    };
    let secondaries: Vec<&str> = match target {
        Value::String(s) => vec![s.as_str()],
        Value::Array(items) => items
            .iter()
            .map(|item| item.as_str().ok_or_else(|| fail("unsupported target type")))
            .collect::<DbResult<_>>()?,
        _ => return Err(fail("unsupported target type")),
    };
    secondaries
        .into_iter()
        .map(|secondary| encode_index_key(secondary, primary))
        .collect()
}

/// Add or remove the index entries for one primary entry.
///
/// A value the pointer cannot be applied to is left out of the index and
/// logged; only tree errors are returned.
pub async fn index_value<W: Write + ?Sized>(
    index: &BTreeWrite<'_, W>,
    op: IndexOperation,
    key: &str,
    value: &Value,
    definition: &IndexDefinition,
) -> DbResult<()> {
    let pointer = definition.json_pointer.as_str();
    let entries = match get_index_keys(key, value, pointer, definition.allow_empty) {
        Ok(entries) => entries,
        Err(err) => {
            info!(index = %definition.name, key, error = %err, "not indexing value");
            return Ok(());
        }
    };
    for entry in entries {
        match op {
            IndexOperation::Add => index.put(&entry, value.clone()).await?,
            IndexOperation::Remove => {
                index.del(&entry).await?;
            }
        }
    }
    Ok(())
}

/// Build an index over the entries of `map` and flush it.
pub async fn create_index_btree<W, S>(
    dag_write: &W,
    map: &S,
    definition: &IndexDefinition,
) -> DbResult<Hash>
where
    W: Write + ?Sized,
    S: NodeSource + ?Sized,
{
    let index = BTreeWrite::new(dag_write, Hash::empty());
    for entry in map.scan(&definition.key_prefix, usize::MAX).await? {
        if !entry.key().starts_with(&definition.key_prefix) {
            break;
        }
        index_value(&index, IndexOperation::Add, entry.key(), entry.value(), definition).await?;
    }
    Ok(index.flush().await?)
}
