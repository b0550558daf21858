//! 工具协作方：每个外部服务一个适配器，统一通过 ToolRegistry / ToolExecutor 调用

pub mod executor;
pub mod places;
pub mod price_compare;
pub mod registry;
pub mod review_extract;
pub mod reviews;
pub mod shop_contact;

use std::sync::Arc;

pub use executor::{is_error_record, ToolExecutor};
pub use places::PlaceSearchTool;
pub use price_compare::{compare_prices, PriceCompareTool, PriceComparison, PricedPlace};
pub use registry::{Tool, ToolRegistry};
pub use review_extract::ReviewExtractTool;
pub use reviews::ReviewSearchTool;
pub use shop_contact::{fallback_response, ShopContactTool};

use crate::config::ToolsSection;
use crate::llm::LlmClient;

pub const SEARCH_PLACES_TOOL: &str = "search_places";
pub const SEARCH_REVIEWS_TOOL: &str = "search_reviews";
pub const CONTACT_SHOP_TOOL: &str = "contact_shop_simulation";
pub const COMPARE_PRICES_TOOL: &str = "compare_prices";
pub const FETCH_REVIEWS_TOOL: &str = "fetch_reviews";

/// 注册全部生产工具：simulation_llm 用于商家模拟，extraction_llm 用于评价抽取
pub fn default_registry(
    cfg: &ToolsSection,
    simulation_llm: Arc<dyn LlmClient>,
    extraction_llm: Arc<dyn LlmClient>,
) -> ToolRegistry {
    let mut tools = ToolRegistry::new();
    tools.register(PlaceSearchTool::new(cfg.serp.clone()));
    tools.register(ReviewSearchTool::new(cfg.tavily.clone()));
    tools.register(ShopContactTool::new(simulation_llm));
    tools.register(PriceCompareTool);
    tools.register(ReviewExtractTool::new(cfg.webscraping.clone(), extraction_llm));
    tools
}
