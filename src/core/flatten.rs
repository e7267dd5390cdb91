use crate::core::{FlatRecord, Record};
use crate::utils::error::{EtlError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const DEFAULT_SEPARATOR: &str = "_";
pub const DEFAULT_MAX_DEPTH: usize = 64;

/// 含有物件或陣列元素的清單如何展平
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListPolicy {
    /// 整個清單輸出為精簡的 JSON 文字
    #[default]
    Stringify,
    /// 不輸出這個鍵
    Drop,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlattenOptions {
    pub separator: String,
    pub max_depth: usize,
    pub list_of_objects: ListPolicy,
}

impl Default for FlattenOptions {
    fn default() -> Self {
        Self {
            separator: DEFAULT_SEPARATOR.to_string(),
            max_depth: DEFAULT_MAX_DEPTH,
            list_of_objects: ListPolicy::default(),
        }
    }
}

/// 以預設選項展平一筆記錄
pub fn flatten(record: &Record) -> Result<FlatRecord> {
    flatten_with(record, "", &FlattenOptions::default())
}

/// 遞迴展平巢狀記錄；鍵名以 `separator` 串接，重複的鍵以後者為準
pub fn flatten_with(record: &Record, prefix: &str, options: &FlattenOptions) -> Result<FlatRecord> {
    let mut out = FlatRecord::new();
    flatten_object(&record.data, prefix, 0, options, &mut out)?;
    Ok(out)
}

fn join_key(prefix: &str, key: &str, separator: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{}{}{}", prefix, separator, key)
    }
}

fn flatten_object(
    object: &Map<String, Value>,
    prefix: &str,
    depth: usize,
    options: &FlattenOptions,
    out: &mut FlatRecord,
) -> Result<()> {
    if depth >= options.max_depth {
        return Err(EtlError::FlattenDepthExceeded {
            key: prefix.to_string(),
            limit: options.max_depth,
        });
    }

    for (key, value) in object {
        let new_key = join_key(prefix, key, &options.separator);
        match value {
            Value::Object(nested) => flatten_object(nested, &new_key, depth + 1, options, out)?,
            Value::Array(items) => {
                if let Some(joined) = flatten_list(items, options) {
                    out.insert(new_key, joined);
                }
            }
            scalar => out.insert(new_key, scalar.clone()),
        }
    }

    Ok(())
}

fn flatten_list(items: &[Value], options: &FlattenOptions) -> Option<Value> {
    let all_scalar = items
        .iter()
        .all(|item| !matches!(item, Value::Object(_) | Value::Array(_)));

    if all_scalar {
        let joined = items
            .iter()
            .map(scalar_text)
            .collect::<Vec<_>>()
            .join(", ");
        return Some(Value::String(joined));
    }

    match options.list_of_objects {
        ListPolicy::Stringify => Some(Value::String(Value::Array(items.to_vec()).to_string())),
        ListPolicy::Drop => None,
    }
}

/// 純量值的文字形式，用於串接清單與 CSV 欄位
pub fn scalar_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
