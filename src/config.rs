//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `NEGOTIATOR__*` 覆盖（双下划线表示嵌套，如 `NEGOTIATOR__AGENT__MAX_ITERATIONS=2`）。
//! 加载后的 AppConfig 以值的形式传入 WorkflowEngine 与各工具，核心逻辑不读取任何全局状态。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub llm: LlmSection,
    #[serde(default)]
    pub agent: AgentSection,
    #[serde(default)]
    pub tools: ToolsSection,
    #[serde(default)]
    pub storage: StorageSection,
}

/// [llm] 段：后端、模型、温度与超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// 后端：groq / openai / mock
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    pub temperature: f32,
    /// 模拟商家回复时使用更高的温度
    pub simulation_temperature: f32,
    pub max_tokens: u32,
    pub api_key: Option<String>,
    /// 主 Key 调用失败时的备用 Key
    pub api_key_secondary: Option<String>,
    pub timeouts: LlmTimeoutsSection,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "groq".to_string(),
            model: "llama-3.3-70b-versatile".to_string(),
            base_url: Some(GROQ_BASE_URL.to_string()),
            temperature: 0.7,
            simulation_temperature: 0.8,
            max_tokens: 2048,
            api_key: None,
            api_key_secondary: None,
            timeouts: LlmTimeoutsSection::default(),
        }
    }
}

pub const GROQ_BASE_URL: &str = "https://api.groq.com/openai/v1";

#[derive(Debug, Clone, Deserialize)]
pub struct LlmTimeoutsSection {
    #[serde(default = "default_request_timeout")]
    pub request: u64,
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self {
            request: default_request_timeout(),
        }
    }
}

fn default_request_timeout() -> u64 {
    60
}

/// [agent] 段：Reflexion 迭代上限、步数上限、候选数量、议价并发与人工审批策略
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    pub max_iterations: u32,
    /// 单次调用最多执行的状态步数，防止状态机缺陷导致死循环
    pub recursion_limit: usize,
    pub max_candidates: usize,
    pub negotiation_concurrency: usize,
    /// negotiation 路径的结果需要人工确认
    pub require_approval: bool,
    pub default_show_all: bool,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            max_iterations: 3,
            recursion_limit: 50,
            max_candidates: 5,
            negotiation_concurrency: 3,
            require_approval: true,
            default_show_all: false,
        }
    }
}

/// [tools] 段：单次工具调用超时与各外部服务
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    pub tool_timeout_secs: u64,
    pub serp: SerpSection,
    pub tavily: TavilySection,
    pub webscraping: WebScrapingSection,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            tool_timeout_secs: 90,
            serp: SerpSection::default(),
            tavily: TavilySection::default(),
            webscraping: WebScrapingSection::default(),
        }
    }
}

/// [tools.serp] 段：SerpStack（Google 搜索）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SerpSection {
    pub api_key: Option<String>,
    pub api_url: String,
    pub timeout_secs: u64,
    pub google_domain: String,
    pub country: String,
    pub num: u32,
}

impl Default for SerpSection {
    fn default() -> Self {
        Self {
            api_key: None,
            api_url: "http://api.serpstack.com/search".to_string(),
            timeout_secs: 15,
            google_domain: "google.co.in".to_string(),
            country: "in".to_string(),
            num: 20,
        }
    }
}

/// [tools.tavily] 段：评价搜索
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TavilySection {
    pub api_key: Option<String>,
    pub api_url: String,
    pub max_results: u32,
    pub timeout_secs: u64,
}

impl Default for TavilySection {
    fn default() -> Self {
        Self {
            api_key: None,
            api_url: "https://api.tavily.com/search".to_string(),
            max_results: 5,
            timeout_secs: 20,
        }
    }
}

/// [tools.webscraping] 段：WebScraping.AI 抓取 + LLM 抽取评价
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebScrapingSection {
    pub api_key: Option<String>,
    pub api_url: String,
    pub timeout_secs: u64,
    /// 送入 LLM 的页面文本上限（字符）
    pub max_page_chars: usize,
}

impl Default for WebScrapingSection {
    fn default() -> Self {
        Self {
            api_key: None,
            api_url: "https://api.webscraping.ai/html".to_string(),
            timeout_secs: 60,
            max_page_chars: 20_000,
        }
    }
}

/// [storage] 段：Checkpoint 数据库路径；为空或 ":memory:" 时使用内存存储
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    pub database_path: String,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            database_path: "./data/checkpoints.db".to_string(),
        }
    }
}

impl StorageSection {
    pub fn is_in_memory(&self) -> bool {
        let p = self.database_path.trim();
        p.is_empty() || p == ":memory:"
    }
}

/// 非空字符串视为已配置
pub(crate) fn configured(key: &Option<String>) -> Option<&str> {
    key.as_deref().map(str::trim).filter(|k| !k.is_empty())
}

/// 从 config 目录加载配置，环境变量 NEGOTIATOR__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 NEGOTIATOR__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("NEGOTIATOR")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_reference_settings() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.agent.max_iterations, 3);
        assert_eq!(cfg.agent.recursion_limit, 50);
        assert_eq!(cfg.llm.model, "llama-3.3-70b-versatile");
        assert!((cfg.llm.temperature - 0.7).abs() < f32::EPSILON);
        assert_eq!(cfg.storage.database_path, "./data/checkpoints.db");
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let cfg: AppConfig = config::Config::builder()
            .add_source(config::File::from_str(
                "[agent]\nmax_iterations = 1\n[storage]\ndatabase_path = \":memory:\"",
                config::FileFormat::Toml,
            ))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();
        assert_eq!(cfg.agent.max_iterations, 1);
        assert_eq!(cfg.agent.max_candidates, 5);
        assert!(cfg.storage.is_in_memory());
        assert_eq!(cfg.tools.serp.api_url, "http://api.serpstack.com/search");
    }

    #[test]
    fn test_configured_ignores_blank_keys() {
        assert_eq!(configured(&Some("  ".to_string())), None);
        assert_eq!(configured(&Some("k".to_string())), Some("k"));
        assert_eq!(configured(&None), None);
    }
}
