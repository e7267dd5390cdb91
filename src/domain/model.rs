use crate::utils::error::EtlError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// API 回傳的原始巢狀記錄
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub data: Map<String, Value>,
}

impl Record {
    pub fn new(data: Map<String, Value>) -> Self {
        Self { data }
    }

    /// 只有 JSON 物件才是記錄
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(data) => Some(Self { data }),
            _ => None,
        }
    }
}

impl From<Map<String, Value>> for Record {
    fn from(data: Map<String, Value>) -> Self {
        Self { data }
    }
}

/// 單層的欄位 -> 純量值對應，欄位順序依照原始記錄的鍵順序
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlatRecord {
    pub fields: Map<String, Value>,
}

impl FlatRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn insert(&mut self, key: String, value: Value) {
        self.fields.insert(key, value);
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.fields.keys()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// 把展平後的對應視為一筆（沒有巢狀的）記錄
    pub fn into_record(self) -> Record {
        Record { data: self.fields }
    }
}

/// 一次分頁請求的解碼結果
#[derive(Debug, Clone, Default)]
pub struct PageResult {
    pub records: Vec<Record>,
    /// 本頁實際回傳的筆數，包含不是物件而被略過的元素
    pub returned: usize,
    /// 宣告的總數；宣告為 0 時視為沒有提供
    pub total_count: Option<u64>,
}

impl PageResult {
    pub fn new(records: Vec<Record>, total_count: Option<u64>) -> Self {
        Self {
            returned: records.len(),
            records,
            total_count: total_count.filter(|total| *total > 0),
        }
    }
}

#[derive(Debug)]
pub enum FetchOutcome {
    Done,
    Failed { offset: usize, error: EtlError },
}

/// 單一 parent key 完整分頁抓取的結果
#[derive(Debug)]
pub struct ResultSet {
    pub source_name: String,
    pub records: Vec<FlatRecord>,
    pub requests: usize,
    pub outcome: FetchOutcome,
}

impl ResultSet {
    pub fn is_complete(&self) -> bool {
        matches!(self.outcome, FetchOutcome::Done)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// 完整抓取回傳記錄；失敗時回傳錯誤並捨棄部分資料
    pub fn into_result(self) -> crate::utils::error::Result<Vec<FlatRecord>> {
        match self.outcome {
            FetchOutcome::Done => Ok(self.records),
            FetchOutcome::Failed { error, .. } => Err(error),
        }
    }
}

/// 輸出端的表頭（有序欄位清單）
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    fields: Vec<String>,
}

impl Schema {
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }

    /// 所有鍵的聯集，依首次出現的順序
    pub fn infer(records: &[FlatRecord]) -> Self {
        let mut fields: Vec<String> = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for record in records {
            for key in record.keys() {
                if seen.insert(key.as_str()) {
                    fields.push(key.clone());
                }
            }
        }
        Self { fields }
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// 欄位集合相同（不論順序）
    pub fn same_fields(&self, other: &Schema) -> bool {
        let mine: std::collections::HashSet<&String> = self.fields.iter().collect();
        let theirs: std::collections::HashSet<&String> = other.fields.iter().collect();
        self.fields.len() == other.fields.len() && mine == theirs
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentFailure {
    pub parent_key: String,
    pub message: String,
    pub partial_records: usize,
}

/// 抽取階段合併後的結果
#[derive(Debug, Clone, Default)]
pub struct Extraction {
    pub records: Vec<FlatRecord>,
    pub parents_total: usize,
    pub failures: Vec<ParentFailure>,
}

#[derive(Debug, Clone)]
pub struct TransformResult {
    pub schema: Schema,
    pub rows: Vec<FlatRecord>,
    pub parents_total: usize,
    pub failures: Vec<ParentFailure>,
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub sink: String,
    pub schema: Schema,
    pub rows_written: usize,
    pub parents_total: usize,
    pub failures: Vec<ParentFailure>,
}
