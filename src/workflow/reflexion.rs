//! Reflexion：初始分析 → 模拟议价 → 评估（Critique）→ 修正，以及最终推荐排序
//!
//! 这里只放纯函数，工具调用与状态迁移在 engine 中完成。
//! 评估何时「满意」：每个候选的价格与可用性都已由非预设回复确认，且预算之外的商家都已议价过一次。
//! 本轮修正没有带来任何新信息时视为无结论，按「无需继续」处理。

use std::collections::BTreeMap;

use serde_json::Value;

use crate::core::{
    AgentState, Critique, CritiqueOutcome, PlaceAnalysis, QuestionType, Recommendation,
    ShopResponse,
};
use crate::tools::{is_error_record, PriceComparison, SEARCH_PLACES_TOOL, SEARCH_REVIEWS_TOOL};

const MAX_HIGHLIGHTS: usize = 3;
const HIGHLIGHT_CHARS: usize = 200;

fn as_number(v: Option<&Value>) -> Option<f64> {
    match v? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        format!("{}...", s.chars().take(max).collect::<String>())
    } else {
        s.to_string()
    }
}

/// 评价搜索记录中的单条结果（title / content / url）
fn review_hits(state: &AgentState) -> impl Iterator<Item = &Value> {
    state
        .tavily_reviews
        .iter()
        .filter(|r| !is_error_record(r))
        .filter_map(|r| r.get("results").and_then(Value::as_array))
        .flatten()
}

fn highlights_for(state: &AgentState, name: &str) -> Vec<String> {
    let needle = name.to_lowercase();
    review_hits(state)
        .filter_map(|hit| {
            let title = hit.get("title").and_then(Value::as_str).unwrap_or("");
            let content = hit.get("content").and_then(Value::as_str).unwrap_or("");
            let matches = title.to_lowercase().contains(&needle)
                || content.to_lowercase().contains(&needle);
            (matches && !content.is_empty()).then(|| truncate(content, HIGHLIGHT_CHARS))
        })
        .take(MAX_HIGHLIGHTS)
        .collect()
}

fn rating_order(a: &PlaceAnalysis, b: &PlaceAnalysis) -> std::cmp::Ordering {
    let ra = a.rating.unwrap_or(f64::MIN);
    let rb = b.rating.unwrap_or(f64::MIN);
    rb.total_cmp(&ra)
        .then(b.reviews_count.cmp(&a.reviews_count))
        .then(a.name.cmp(&b.name))
}

/// 由搜索结果生成初始分析；商家搜索失败时退回到评价搜索中的条目
pub fn initial_analysis(state: &AgentState, max_candidates: usize) -> Vec<PlaceAnalysis> {
    let mut candidates: Vec<PlaceAnalysis> = state
        .serp_results
        .iter()
        .filter(|p| !is_error_record(p))
        .filter(|p| p.get("placeholder").and_then(Value::as_bool) != Some(true))
        .filter_map(|p| {
            let name = p.get("name").and_then(Value::as_str)?.trim().to_string();
            (!name.is_empty()).then(|| PlaceAnalysis {
                review_highlights: highlights_for(state, &name),
                name,
                address: p.get("address").and_then(Value::as_str).unwrap_or("").to_string(),
                phone: p.get("phone").and_then(Value::as_str).unwrap_or("").to_string(),
                rating: as_number(p.get("rating")),
                reviews_count: as_number(p.get("reviews_count")).map(|n| n as u64).unwrap_or(0),
                source: SEARCH_PLACES_TOOL.to_string(),
                ..Default::default()
            })
        })
        .collect();

    if candidates.is_empty() {
        candidates = review_hits(state)
            .filter_map(|hit| {
                let title = hit.get("title").and_then(Value::as_str)?.trim();
                (!title.is_empty()).then(|| PlaceAnalysis {
                    name: title.to_string(),
                    address: hit.get("url").and_then(Value::as_str).unwrap_or("").to_string(),
                    review_highlights: hit
                        .get("content")
                        .and_then(Value::as_str)
                        .map(|c| vec![truncate(c, HIGHLIGHT_CHARS)])
                        .unwrap_or_default(),
                    source: SEARCH_REVIEWS_TOOL.to_string(),
                    ..Default::default()
                })
            })
            .collect();
    }

    let mut seen = std::collections::HashSet::new();
    candidates.retain(|c| seen.insert(c.name.to_lowercase()));
    candidates.sort_by(rating_order);
    candidates.truncate(max_candidates);
    candidates
}

/// 本轮要向每个商家提的问题；首轮全部询价，之后只追问 Critique 列出的缺口
pub fn plan_questions(state: &AgentState) -> Vec<(String, QuestionType)> {
    match &state.critique {
        Some(c) if c.outcome == CritiqueOutcome::NeedsRefinement => c
            .follow_ups
            .iter()
            .map(|(name, q)| (name.clone(), *q))
            .collect(),
        _ => state
            .initial_analysis
            .iter()
            .map(|a| (a.name.clone(), QuestionType::Pricing))
            .collect(),
    }
}

/// 把 iteration 轮的商家回复合并进上一版分析，得到新的 refined 分析
pub fn refine(
    state: &AgentState,
    iteration: u32,
    comparison: Option<&PriceComparison>,
) -> Vec<PlaceAnalysis> {
    let base: Vec<PlaceAnalysis> = state.latest_analysis().into_iter().cloned().collect();
    base.into_iter()
        .map(|mut a| {
            a.iteration = iteration;
            for resp in state
                .responses_for(iteration)
                .filter(|r| r.place_name == a.name && !r.fallback)
            {
                if let Some(price) = resp.price() {
                    a.price = Some(price);
                }
                a.available = Some(resp.available);
                for f in &resp.features {
                    if !a.features.contains(f) {
                        a.features.push(f.clone());
                    }
                }
                a.notes.push(format!(
                    "[{}] {}",
                    resp.question_type.as_str(),
                    truncate(&resp.message, HIGHLIGHT_CHARS)
                ));
            }
            a.budget_fit = match (state.budget, comparison) {
                (None, _) => None,
                (Some(_), Some(cmp)) => cmp.budget_fit(&a.name),
                (Some(b), None) => a.price.map(|p| p <= b),
            };
            a
        })
        .collect()
}

/// 给 compare_prices 的输入
pub fn pricing_payload(analysis: &[PlaceAnalysis]) -> Vec<Value> {
    analysis
        .iter()
        .map(|a| match a.price {
            Some(p) => serde_json::json!({"name": a.name, "pricing_info": {"monthly": p}}),
            None => serde_json::json!({"name": a.name}),
        })
        .collect()
}

fn negotiated(responses: &[ShopResponse], name: &str) -> bool {
    responses
        .iter()
        .any(|r| r.place_name == name && r.question_type == QuestionType::Negotiation && !r.fallback)
}

fn same_facts(a: &PlaceAnalysis, b: &PlaceAnalysis) -> bool {
    a.price == b.price && a.available == b.available && a.features == b.features
}

/// 评估修正后的分析，决定是否需要下一轮以及每个商家的追问
pub fn critique(state: &AgentState, refined: &[PlaceAnalysis], iteration: u32) -> Critique {
    let mut follow_ups = BTreeMap::new();
    for a in refined {
        let question = match (a.price, a.available) {
            (None, _) => Some(QuestionType::Pricing),
            (Some(_), None) => Some(QuestionType::Availability),
            (Some(price), Some(_)) => state
                .budget
                .filter(|b| price > *b && !negotiated(&state.shop_responses, &a.name))
                .map(|_| QuestionType::Negotiation),
        };
        if let Some(q) = question {
            follow_ups.insert(a.name.clone(), q);
        }
    }

    let previous = state.latest_analysis();
    let gained_info = refined.iter().any(|r| {
        previous
            .iter()
            .find(|p| p.name == r.name)
            .map_or(true, |p| !same_facts(p, r))
    });

    let outcome = if follow_ups.is_empty() {
        CritiqueOutcome::Satisfied
    } else if !gained_info {
        CritiqueOutcome::Inconclusive
    } else {
        CritiqueOutcome::NeedsRefinement
    };
    Critique {
        iteration,
        outcome,
        follow_ups,
    }
}

fn summary_line(a: &PlaceAnalysis, budget: Option<f64>) -> String {
    let mut parts = Vec::new();
    match a.rating {
        Some(r) => parts.push(format!("rated {r:.1} ({} reviews)", a.reviews_count)),
        None => parts.push("no rating available".to_string()),
    }
    if let Some(p) = a.price {
        let fit = match budget {
            Some(b) if p <= b => ", within budget",
            Some(_) => ", above budget",
            None => "",
        };
        parts.push(format!("₹{p:.0}/month{fit}"));
    }
    match a.available {
        Some(true) => parts.push("available".to_string()),
        Some(false) => parts.push("currently unavailable".to_string()),
        None => {}
    }
    if let Some(h) = a.review_highlights.first() {
        parts.push(format!("review: {h}"));
    }
    parts.join("; ")
}

/// 最终推荐：有预算时排除已知超预算的商家；预算内优先，其次评分、评价数、名称
pub fn build_recommendations(state: &AgentState) -> Vec<Recommendation> {
    let budget = state.budget;
    let fits = |a: &PlaceAnalysis| -> Option<bool> {
        a.budget_fit.or_else(|| budget.zip(a.price).map(|(b, p)| p <= b))
    };

    let mut qualifying: Vec<&PlaceAnalysis> = state
        .latest_analysis()
        .into_iter()
        .filter(|a| budget.is_none() || fits(a) != Some(false))
        .collect();
    qualifying.sort_by(|a, b| {
        let class = |x: &PlaceAnalysis| match fits(x) {
            Some(true) => 0,
            _ => 1,
        };
        class(a).cmp(&class(b)).then(rating_order(a, b))
    });
    if !state.show_all {
        qualifying.truncate(1);
    }

    qualifying
        .into_iter()
        .enumerate()
        .map(|(i, a)| Recommendation {
            rank: i + 1,
            name: a.name.clone(),
            address: a.address.clone(),
            phone: a.phone.clone(),
            rating: a.rating,
            price: a.price,
            within_budget: budget.and_then(|_| fits(a)),
            available: a.available,
            features: a.features.clone(),
            summary: summary_line(a, budget),
        })
        .collect()
}

/// 推荐结果的对话文本
pub fn recommendations_message(recs: &[Recommendation]) -> String {
    if recs.is_empty() {
        return "No place matched your criteria.".to_string();
    }
    recs.iter()
        .map(|r| format!("{}. {} - {}", r.rank, r.name, r.summary))
        .collect::<Vec<_>>()
        .join("\n")
}
