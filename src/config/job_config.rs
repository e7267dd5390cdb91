use crate::core::fetcher::DEFAULT_PAGE_SIZE;
use crate::core::flatten::{FlattenOptions, ListPolicy, DEFAULT_MAX_DEPTH, DEFAULT_SEPARATOR};
use crate::utils::error::{EtlError, Result};
use crate::utils::validation::{self, Validate};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    pub job: JobInfo,
    pub source: EndpointConfig,
    pub parents: Option<ParentsConfig>,
    #[serde(default)]
    pub extract: ExtractConfig,
    #[serde(default)]
    pub flatten: FlattenConfig,
    pub load: LoadConfig,
    pub monitoring: Option<MonitoringConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobInfo {
    pub name: String,
    pub description: Option<String>,
}

/// 分頁端點設定；`endpoint` 可含 `{parent_key}` 佔位符
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub endpoint: String,
    pub headers: Option<HashMap<String, String>>,
    pub parameters: Option<HashMap<String, String>>,
    pub offset_param: Option<String>,
    pub limit_param: Option<String>,
    pub page_size: Option<usize>,
    pub records_key: Option<String>,
    pub total_key: Option<String>,
    pub timeout_seconds: Option<u64>,
    pub verify_tls: Option<bool>,
    pub date_window: Option<DateWindow>,
}

/// 「最近 N 天」的查詢區間
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DateWindow {
    pub days: i64,
    pub start_param: Option<String>,
    pub end_param: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParentsConfig {
    pub keys: Option<Vec<String>>,
    pub source: Option<EndpointConfig>,
    pub id_field: Option<String>,
    /// 探索到的 parent 記錄另存的 CSV
    pub output_path: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractConfig {
    pub concurrent_requests: Option<usize>,
    pub max_records: Option<usize>,
    pub keep_partial: Option<bool>,
    pub parent_key_column: Option<String>,
    /// 從 parent 記錄帶入每筆子記錄的欄位（展平後的鍵）
    pub parent_columns: Option<Vec<String>>,
    pub parent_column_prefix: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlattenConfig {
    pub separator: Option<String>,
    pub max_depth: Option<usize>,
    pub list_of_objects: Option<ListPolicy>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadConfig {
    pub output_path: String,
    pub columns: Option<Vec<ColumnMapping>>,
    pub dedupe_column: Option<String>,
}

/// 展平後的鍵 -> 輸出欄位名稱
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMapping {
    pub source: String,
    pub name: Option<String>,
}

impl ColumnMapping {
    pub fn output_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.source)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    pub enabled: bool,
}

impl EndpointConfig {
    pub fn offset_param(&self) -> &str {
        self.offset_param.as_deref().unwrap_or("start")
    }

    pub fn limit_param(&self) -> &str {
        self.limit_param.as_deref().unwrap_or("limit")
    }

    pub fn page_size(&self) -> usize {
        self.page_size.unwrap_or(DEFAULT_PAGE_SIZE)
    }

    pub fn timeout_seconds(&self) -> u64 {
        self.timeout_seconds.unwrap_or(30)
    }

    pub fn verify_tls(&self) -> bool {
        self.verify_tls.unwrap_or(true)
    }

    pub fn uses_parent_key(&self) -> bool {
        self.endpoint.contains(crate::core::http_source::PARENT_KEY_PLACEHOLDER)
    }

    /// 每頁共用的查詢參數（不含 offset/limit，這兩個由分頁器決定）
    pub fn base_query(&self) -> Vec<(String, String)> {
        let mut query: Vec<(String, String)> = self
            .parameters
            .iter()
            .flatten()
            .filter(|(key, _)| key.as_str() != self.offset_param() && key.as_str() != self.limit_param())
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        query.sort();

        if let Some(window) = &self.date_window {
            let (start, end) = window.range_at(chrono::Local::now().naive_local());
            query.push((window.start_param().to_string(), start));
            query.push((window.end_param().to_string(), end));
        }

        query
    }

    fn validate_as(&self, section: &str) -> Result<()> {
        validation::validate_url(&format!("{}.endpoint", section), &self.endpoint)?;
        validation::validate_positive_number(&format!("{}.page_size", section), self.page_size(), 1)?;
        validation::validate_positive_number(
            &format!("{}.timeout_seconds", section),
            self.timeout_seconds() as usize,
            1,
        )?;
        validation::validate_non_empty_string(&format!("{}.offset_param", section), self.offset_param())?;
        validation::validate_non_empty_string(&format!("{}.limit_param", section), self.limit_param())?;
        if let Some(window) = &self.date_window {
            validation::validate_range(&format!("{}.date_window.days", section), window.days, 1, 3650)?;
        }
        Ok(())
    }
}

impl DateWindow {
    pub fn start_param(&self) -> &str {
        self.start_param.as_deref().unwrap_or("startDate")
    }

    pub fn end_param(&self) -> &str {
        self.end_param.as_deref().unwrap_or("endDate")
    }

    /// 以 `now` 為終點、往前 `days` 天的 ISO-8601 起訖時間
    pub fn range_at(&self, now: chrono::NaiveDateTime) -> (String, String) {
        let start = now - chrono::Duration::days(self.days);
        let format = "%Y-%m-%dT%H:%M:%S";
        (start.format(format).to_string(), now.format(format).to_string())
    }
}

impl ParentsConfig {
    pub fn id_field(&self) -> &str {
        self.id_field.as_deref().unwrap_or("id")
    }
}

impl ExtractConfig {
    pub fn concurrent_requests(&self) -> usize {
        self.concurrent_requests
            .unwrap_or(crate::core::collector::DEFAULT_CONCURRENCY)
    }

    pub fn keep_partial(&self) -> bool {
        self.keep_partial.unwrap_or(false)
    }

    pub fn parent_columns(&self) -> &[String] {
        self.parent_columns.as_deref().unwrap_or_default()
    }

    pub fn parent_column_prefix(&self) -> &str {
        self.parent_column_prefix.as_deref().unwrap_or("parent_")
    }
}

impl FlattenConfig {
    pub fn options(&self) -> FlattenOptions {
        FlattenOptions {
            separator: self
                .separator
                .clone()
                .unwrap_or_else(|| DEFAULT_SEPARATOR.to_string()),
            max_depth: self.max_depth.unwrap_or(DEFAULT_MAX_DEPTH),
            list_of_objects: self.list_of_objects.unwrap_or_default(),
        }
    }
}

impl JobConfig {
    /// 從 TOML 檔案載入配置
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path).map_err(EtlError::IoError)?;
        Self::from_toml_str(&content)
    }

    /// 從 TOML 字串解析配置
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let processed_content = Self::substitute_env_vars(content)?;

        toml::from_str(&processed_content).map_err(|e| EtlError::ConfigValidationError {
            field: "toml_parsing".to_string(),
            message: format!("TOML parsing error: {}", e),
        })
    }

    /// 替換環境變數 (例如 ${API_TOKEN})；未設定的變數保持原樣
    fn substitute_env_vars(content: &str) -> Result<String> {
        let re = regex::Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").map_err(|e| {
            EtlError::ConfigError {
                message: format!("invalid substitution pattern: {}", e),
            }
        })?;

        let result = re.replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            std::env::var(var_name).unwrap_or_else(|_| {
                tracing::warn!("⚠️ Environment variable {} is not set", var_name);
                format!("${{{}}}", var_name)
            })
        });

        Ok(result.to_string())
    }

    pub fn output_path(&self) -> &str {
        &self.load.output_path
    }

    pub fn monitoring_enabled(&self) -> bool {
        self.monitoring.as_ref().map(|m| m.enabled).unwrap_or(false)
    }
}

impl Validate for JobConfig {
    fn validate(&self) -> Result<()> {
        validation::validate_non_empty_string("job.name", &self.job.name)?;
        self.source.validate_as("source")?;

        if let Some(parents) = &self.parents {
            match (&parents.keys, &parents.source) {
                (None, None) => {
                    return Err(EtlError::MissingConfigError {
                        field: "parents.keys or parents.source".to_string(),
                    })
                }
                (Some(_), Some(_)) => {
                    return Err(EtlError::ConfigValidationError {
                        field: "parents".to_string(),
                        message: "set either keys or source, not both".to_string(),
                    })
                }
                (_, Some(source)) => source.validate_as("parents.source")?,
                (Some(_), None) => {
                    if !self.extract.parent_columns().is_empty() {
                        return Err(EtlError::ConfigValidationError {
                            field: "extract.parent_columns".to_string(),
                            message: "parent columns need parents.source to supply parent records"
                                .to_string(),
                        });
                    }
                    if parents.output_path.is_some() {
                        return Err(EtlError::ConfigValidationError {
                            field: "parents.output_path".to_string(),
                            message: "only discovered parents (parents.source) can be written"
                                .to_string(),
                        });
                    }
                }
            }
            if let Some(path) = &parents.output_path {
                validation::validate_path("parents.output_path", path)?;
                validation::validate_file_extension("parents.output_path", path, &["csv"])?;
                if path == &self.load.output_path {
                    return Err(EtlError::InvalidConfigValueError {
                        field: "parents.output_path".to_string(),
                        value: path.clone(),
                        reason: "Must differ from load.output_path".to_string(),
                    });
                }
            }
            validation::validate_non_empty_string("parents.id_field", parents.id_field())?;
            if !self.source.uses_parent_key() {
                tracing::warn!(
                    "⚠️ source.endpoint has no {{parent_key}} placeholder; every parent fetches the same URL"
                );
            }
        } else if self.source.uses_parent_key() {
            return Err(EtlError::MissingConfigError {
                field: "parents".to_string(),
            });
        } else if !self.extract.parent_columns().is_empty() {
            return Err(EtlError::MissingConfigError {
                field: "parents.source".to_string(),
            });
        }

        validation::validate_positive_number(
            "extract.concurrent_requests",
            self.extract.concurrent_requests(),
            1,
        )?;
        if let Some(max) = self.extract.max_records {
            validation::validate_positive_number("extract.max_records", max, 1)?;
        }

        let flatten = self.flatten.options();
        if flatten.separator.is_empty() {
            return Err(EtlError::InvalidConfigValueError {
                field: "flatten.separator".to_string(),
                value: String::new(),
                reason: "Separator cannot be empty".to_string(),
            });
        }
        validation::validate_range("flatten.max_depth", flatten.max_depth, 1, 1024)?;

        validation::validate_path("load.output_path", &self.load.output_path)?;
        validation::validate_file_extension("load.output_path", &self.load.output_path, &["csv"])?;
        if let Some(columns) = &self.load.columns {
            if columns.is_empty() {
                return Err(EtlError::ConfigValidationError {
                    field: "load.columns".to_string(),
                    message: "column list cannot be empty when given".to_string(),
                });
            }
            let mut names = std::collections::HashSet::new();
            for column in columns {
                validation::validate_non_empty_string("load.columns.source", &column.source)?;
                if !names.insert(column.output_name()) {
                    return Err(EtlError::InvalidConfigValueError {
                        field: "load.columns".to_string(),
                        value: column.output_name().to_string(),
                        reason: "Duplicate output column".to_string(),
                    });
                }
            }
        }
        if let Some(column) = &self.load.dedupe_column {
            validation::validate_non_empty_string("load.dedupe_column", column)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const BASIC: &str = r#"
[job]
name = "issues"

[source]
endpoint = "https://ssc.example.com/api/v1/projectVersions/{parent_key}/issues"
page_size = 500
headers = { Authorization = "FortifyToken abc" }
parameters = { orderby = "friority", start = "0", limit = "5000" }

[parents]
keys = ["10028", "10723"]

[extract]
concurrent_requests = 3
parent_key_column = "version_id"

[load]
output_path = "./out/security_issues.csv"
"#;

    #[test]
    fn test_parse_basic_job() {
        let config = JobConfig::from_toml_str(BASIC).unwrap();

        assert_eq!(config.job.name, "issues");
        assert_eq!(config.source.page_size(), 500);
        assert_eq!(config.source.offset_param(), "start");
        assert_eq!(config.source.limit_param(), "limit");
        assert_eq!(config.extract.concurrent_requests(), 3);
        assert!(!config.extract.keep_partial());
        assert_eq!(config.flatten.options(), FlattenOptions::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_base_query_excludes_paging_params() {
        let config = JobConfig::from_toml_str(BASIC).unwrap();
        assert_eq!(
            config.source.base_query(),
            vec![("orderby".to_string(), "friority".to_string())]
        );
    }

    #[test]
    fn test_env_var_substitution() {
        std::env::set_var("VULN_ETL_TEST_TOKEN", "secret-token");

        let toml_content = BASIC.replace("FortifyToken abc", "FortifyToken ${VULN_ETL_TEST_TOKEN}");
        let config = JobConfig::from_toml_str(&toml_content).unwrap();
        let headers = config.source.headers.unwrap();
        assert_eq!(headers["Authorization"], "FortifyToken secret-token");

        std::env::remove_var("VULN_ETL_TEST_TOKEN");
    }

    #[test]
    fn test_placeholder_without_parents_is_rejected() {
        let toml_content = BASIC.replace("[parents]\nkeys = [\"10028\", \"10723\"]\n", "");
        let config = JobConfig::from_toml_str(&toml_content).unwrap();
        assert!(matches!(
            config.validate(),
            Err(EtlError::MissingConfigError { .. })
        ));
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let config = JobConfig::from_toml_str(&BASIC.replace("page_size = 500", "page_size = 0")).unwrap();
        assert!(config.validate().is_err());

        let config =
            JobConfig::from_toml_str(&BASIC.replace("security_issues.csv", "security_issues.json")).unwrap();
        assert!(config.validate().is_err());

        let config = JobConfig::from_toml_str(&BASIC.replace(
            "https://ssc.example.com",
            "ftp://ssc.example.com",
        ))
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_flatten_and_columns_sections() {
        let toml_content = format!(
            "{}\n{}",
            BASIC,
            r#"
[flatten]
separator = "."
list_of_objects = "drop"

[[load.columns]]
source = "id"

[[load.columns]]
source = "primaryTag.value"
name = "tag"
"#
        );
        // [flatten] 與 [[load.columns]] 必須在 [load] 之後仍能解析
        let config = JobConfig::from_toml_str(&toml_content).unwrap();

        let options = config.flatten.options();
        assert_eq!(options.separator, ".");
        assert_eq!(options.list_of_objects, ListPolicy::Drop);

        let columns = config.load.columns.as_ref().unwrap();
        assert_eq!(columns[0].output_name(), "id");
        assert_eq!(columns[1].output_name(), "tag");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_date_window_range() {
        let window = DateWindow {
            days: 7,
            start_param: None,
            end_param: None,
        };
        let now = chrono::NaiveDate::from_ymd_opt(2024, 3, 10)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap();

        let (start, end) = window.range_at(now);
        assert_eq!(start, "2024-03-03T12:00:00");
        assert_eq!(end, "2024-03-10T12:00:00");
        assert_eq!(window.start_param(), "startDate");
    }

    #[test]
    fn test_parent_columns_require_discovered_parents() {
        let literal = BASIC.replace(
            "parent_key_column = \"version_id\"",
            "parent_key_column = \"version_id\"\nparent_columns = [\"name\"]",
        );
        let config = JobConfig::from_toml_str(&literal).unwrap();
        assert_eq!(config.extract.parent_columns(), ["name"]);
        assert_eq!(config.extract.parent_column_prefix(), "parent_");
        assert!(matches!(
            config.validate(),
            Err(EtlError::ConfigValidationError { .. })
        ));

        let discovered = literal.replace(
            "keys = [\"10028\", \"10723\"]",
            "output_path = \"./out/versions.csv\"\n\n[parents.source]\nendpoint = \"https://ssc.example.com/api/v1/projectVersions\"",
        );
        let config = JobConfig::from_toml_str(&discovered).unwrap();
        assert_eq!(
            config.parents.as_ref().unwrap().output_path.as_deref(),
            Some("./out/versions.csv")
        );
        assert!(config.validate().is_ok());

        let clash = discovered.replace("./out/versions.csv", "./out/security_issues.csv");
        let config = JobConfig::from_toml_str(&clash).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_from_file() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(BASIC.as_bytes()).unwrap();

        let config = JobConfig::from_file(temp_file.path()).unwrap();
        assert_eq!(config.parents.unwrap().keys.unwrap().len(), 2);
    }
}
