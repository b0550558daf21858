//! Router：用户意图 → 执行路径
//!
//! 纯函数：同一意图总是得到同一路径；无法识别的意图落到默认路径 info_only，不让工作流失败。

use crate::core::{AgentState, Route, WorkflowStep};

pub const DEFAULT_ROUTE: Route = Route::InfoOnly;

const NEGOTIATION_WORDS: &[&str] = &["negotiation", "negotiate", "deal", "bargain", "discount", "price", "pricing"];
const COMPARISON_WORDS: &[&str] = &["comparison", "compare", "vs", "versus"];
const INFO_WORDS: &[&str] = &["info_only", "info", "information", "details", "lookup"];

/// 统一大小写与分隔符：" Info-Only " → "info_only"
fn normalize(intent: &str) -> String {
    intent
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| if c == '-' || c.is_whitespace() { '_' } else { c })
        .collect()
}

/// 意图到路径的映射；先精确匹配，再按词匹配
pub fn select_route(user_intent: &str) -> Route {
    let intent = normalize(user_intent);
    if let Some(route) = Route::ALL.into_iter().find(|r| r.as_str() == intent) {
        return route;
    }

    let words: Vec<&str> = intent.split('_').filter(|w| !w.is_empty()).collect();
    let has_any = |vocab: &[&str]| words.iter().any(|w| vocab.contains(w));
    if has_any(COMPARISON_WORDS) {
        Route::Comparison
    } else if has_any(NEGOTIATION_WORDS) {
        Route::Negotiation
    } else if has_any(INFO_WORDS) {
        Route::InfoOnly
    } else {
        DEFAULT_ROUTE
    }
}

/// 写入 route 与 current_step；已有 route 时保持不变（只设置一次）
pub fn route_state(state: &mut AgentState) -> Route {
    if let Some(route) = state.route {
        return route;
    }
    let route = select_route(&state.user_intent);
    if normalize(&state.user_intent) != route.as_str() {
        tracing::info!(intent = %state.user_intent, route = %route, "intent resolved by fallback matching");
    }
    state.route = Some(route);
    state.current_step = WorkflowStep::Init;
    route
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::QueryRequest;

    #[test]
    fn test_exact_intents() {
        assert_eq!(select_route("negotiation"), Route::Negotiation);
        assert_eq!(select_route("info_only"), Route::InfoOnly);
        assert_eq!(select_route("comparison"), Route::Comparison);
    }

    #[test]
    fn test_normalized_and_synonym_intents() {
        assert_eq!(select_route(" Info-Only "), Route::InfoOnly);
        assert_eq!(select_route("negotiate a deal"), Route::Negotiation);
        assert_eq!(select_route("compare prices"), Route::Comparison);
    }

    #[test]
    fn test_unknown_intent_uses_default() {
        assert_eq!(select_route("¯\\_(ツ)_/¯"), DEFAULT_ROUTE);
        assert_eq!(select_route(""), DEFAULT_ROUTE);
    }

    #[test]
    fn test_route_set_once() {
        let mut state = AgentState::new(
            QueryRequest {
                user_intent: "negotiation".to_string(),
                ..Default::default()
            },
            "t",
            3,
            false,
        );
        assert_eq!(route_state(&mut state), Route::Negotiation);
        state.user_intent = "comparison".to_string();
        assert_eq!(route_state(&mut state), Route::Negotiation);
        assert_eq!(state.route, Some(Route::Negotiation));
    }
}
