//! 共享状态记录：一次会话（thread_id）内所有步骤共用的唯一可变数据
//!
//! 由 Router 与 WorkflowEngine 修改，工具输出由控制器写回；每一步之后整体写入 CheckpointStore。
//! 不变量：
//! - `messages` 只追加
//! - `0 <= iteration <= max_iterations`
//! - `recommendations` 仅在 `is_complete` 为 true 后非空，且完成后不再变化
//! - `route` 由 Router 设置一次

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::memory::{merge_messages, Message};

/// 执行路径
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Route {
    Negotiation,
    InfoOnly,
    Comparison,
}

impl Route {
    pub const ALL: [Route; 3] = [Route::Negotiation, Route::InfoOnly, Route::Comparison];

    pub fn as_str(&self) -> &'static str {
        match self {
            Route::Negotiation => "negotiation",
            Route::InfoOnly => "info_only",
            Route::Comparison => "comparison",
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 工作流状态机的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowStep {
    Init,
    Searching,
    Analyzing,
    Negotiating,
    Reflecting,
    AwaitingApproval,
    Finalizing,
    Done,
    Failed,
}

impl WorkflowStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStep::Init => "INIT",
            WorkflowStep::Searching => "SEARCHING",
            WorkflowStep::Analyzing => "ANALYZING",
            WorkflowStep::Negotiating => "NEGOTIATING",
            WorkflowStep::Reflecting => "REFLECTING",
            WorkflowStep::AwaitingApproval => "AWAITING_APPROVAL",
            WorkflowStep::Finalizing => "FINALIZING",
            WorkflowStep::Done => "DONE",
            WorkflowStep::Failed => "FAILED",
        }
    }

    /// 进入 FINALIZING 之后不再调用任何工具
    pub fn is_finalizing_or_beyond(&self) -> bool {
        matches!(
            self,
            WorkflowStep::Finalizing | WorkflowStep::AwaitingApproval | WorkflowStep::Done
        )
    }

    pub fn parse(s: &str) -> Option<Self> {
        [
            WorkflowStep::Init,
            WorkflowStep::Searching,
            WorkflowStep::Analyzing,
            WorkflowStep::Negotiating,
            WorkflowStep::Reflecting,
            WorkflowStep::AwaitingApproval,
            WorkflowStep::Finalizing,
            WorkflowStep::Done,
            WorkflowStep::Failed,
        ]
        .into_iter()
        .find(|step| step.as_str().eq_ignore_ascii_case(s.trim()))
    }
}

impl fmt::Display for WorkflowStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 向商家询问的问题类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionType {
    Pricing,
    Availability,
    Features,
    Negotiation,
}

impl QuestionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuestionType::Pricing => "pricing",
            QuestionType::Availability => "availability",
            QuestionType::Features => "features",
            QuestionType::Negotiation => "negotiation",
        }
    }
}

/// 单个候选商家的分析记录（initial_analysis / refined_analysis 的元素）
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PlaceAnalysis {
    pub name: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub phone: String,
    pub rating: Option<f64>,
    #[serde(default)]
    pub reviews_count: u64,
    /// 月费或基础价（来自商家回复）
    pub price: Option<f64>,
    pub available: Option<bool>,
    #[serde(default)]
    pub features: Vec<String>,
    /// Some(true) 预算内，Some(false) 超预算，None 未知或无预算
    pub budget_fit: Option<bool>,
    #[serde(default)]
    pub review_highlights: Vec<String>,
    /// 数据来源：search_places / search_reviews
    #[serde(default)]
    pub source: String,
    /// 所属 Reflexion 轮次，initial_analysis 为 0
    #[serde(default)]
    pub iteration: u32,
    #[serde(default)]
    pub notes: Vec<String>,
}

/// 模拟商家回复（shop_responses 的元素），按 place_name 关联回候选商家
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShopResponse {
    pub place_name: String,
    pub iteration: u32,
    pub question_type: QuestionType,
    pub response_type: String,
    pub message: String,
    pub pricing_info: Option<BTreeMap<String, f64>>,
    pub available: bool,
    #[serde(default)]
    pub features: Vec<String>,
    /// 模拟器不可用或输出无法解析时使用的预设回复
    #[serde(default)]
    pub fallback: bool,
}

impl ShopResponse {
    /// 优先 monthly，其次 base，否则取最小的正数报价
    pub fn price(&self) -> Option<f64> {
        let info = self.pricing_info.as_ref()?;
        info.get("monthly")
            .or_else(|| info.get("base"))
            .copied()
            .filter(|p| *p > 0.0)
            .or_else(|| {
                info.values()
                    .copied()
                    .filter(|p| *p > 0.0)
                    .fold(None, |acc: Option<f64>, p| Some(acc.map_or(p, |a| a.min(p))))
            })
    }
}

/// Critique 的结论
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CritiqueOutcome {
    /// 价格、可用性均已明确
    Satisfied,
    /// 仍有缺口，需要下一轮议价
    NeedsRefinement,
    /// 本轮没有获得新信息，按「无需继续」处理
    Inconclusive,
}

/// 一轮 Reflexion 的评估：结论与下一轮对每个商家要问的问题
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Critique {
    pub iteration: u32,
    pub outcome: CritiqueOutcome,
    #[serde(default)]
    pub follow_ups: BTreeMap<String, QuestionType>,
}

/// 最终推荐
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub rank: usize,
    pub name: String,
    pub address: String,
    pub phone: String,
    pub rating: Option<f64>,
    pub price: Option<f64>,
    pub within_budget: Option<bool>,
    pub available: Option<bool>,
    pub features: Vec<String>,
    pub summary: String,
}

/// 新会话的输入
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryRequest {
    pub city: String,
    pub place_type: String,
    pub user_intent: String,
    pub user_query: String,
    pub budget: Option<f64>,
    /// None 时使用配置中的 default_show_all
    pub show_all: Option<bool>,
    /// None 时自动生成
    pub thread_id: Option<String>,
}

/// 共享状态记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    pub messages: Vec<Message>,

    pub city: String,
    pub place_type: String,
    pub user_intent: String,
    pub user_query: String,
    pub budget: Option<f64>,

    pub serp_results: Vec<Value>,
    pub tavily_reviews: Vec<Value>,
    /// 商家名 -> 抽取到的评价
    pub reviews: BTreeMap<String, Vec<String>>,

    pub human_approved: bool,
    pub human_notes: Option<String>,
    /// 会话初始化时按审批策略确定
    pub approval_required: bool,

    pub route: Option<Route>,
    pub show_all: bool,
    pub current_step: WorkflowStep,

    pub initial_analysis: Vec<PlaceAnalysis>,
    pub shop_responses: Vec<ShopResponse>,
    pub refined_analysis: Vec<PlaceAnalysis>,
    pub critique: Option<Critique>,
    /// comparison 路径的价格对比结果
    pub price_comparison: Option<Value>,
    pub iteration: u32,
    pub max_iterations: u32,

    pub recommendations: Option<Vec<Recommendation>>,
    pub is_complete: bool,

    /// FAILED 时记录的错误与失败前最后完成的步骤（用于重试）
    pub last_error: Option<String>,
    pub failed_after: Option<WorkflowStep>,

    pub thread_id: String,
}

impl AgentState {
    pub fn new(
        request: QueryRequest,
        thread_id: impl Into<String>,
        max_iterations: u32,
        default_show_all: bool,
    ) -> Self {
        let mut state = Self {
            messages: Vec::new(),
            city: request.city,
            place_type: request.place_type,
            user_intent: request.user_intent,
            user_query: request.user_query,
            budget: request.budget,
            serp_results: Vec::new(),
            tavily_reviews: Vec::new(),
            reviews: BTreeMap::new(),
            human_approved: false,
            human_notes: None,
            approval_required: false,
            route: None,
            show_all: request.show_all.unwrap_or(default_show_all),
            current_step: WorkflowStep::Init,
            initial_analysis: Vec::new(),
            shop_responses: Vec::new(),
            refined_analysis: Vec::new(),
            critique: None,
            price_comparison: None,
            iteration: 0,
            max_iterations,
            recommendations: None,
            is_complete: false,
            last_error: None,
            failed_after: None,
            thread_id: thread_id.into(),
        };
        let opening = if state.user_query.trim().is_empty() {
            format!("Find {} in {}", state.place_type, state.city)
        } else {
            state.user_query.clone()
        };
        state.push_messages([Message::user(opening)]);
        state
    }

    pub fn push_messages(&mut self, incoming: impl IntoIterator<Item = Message>) {
        merge_messages(&mut self.messages, incoming);
    }

    /// 人工审批仍未给出结论
    pub fn approval_pending(&self) -> bool {
        self.approval_required && !self.human_approved && self.human_notes.is_none()
    }

    /// 当前最新的分析：有 refined 时取最新一轮 refined，否则为 initial
    pub fn latest_analysis(&self) -> Vec<&PlaceAnalysis> {
        let latest = self.refined_analysis.iter().map(|a| a.iteration).max();
        match latest {
            Some(it) => self
                .refined_analysis
                .iter()
                .filter(|a| a.iteration == it)
                .collect(),
            None => self.initial_analysis.iter().collect(),
        }
    }

    pub fn responses_for(&self, iteration: u32) -> impl Iterator<Item = &ShopResponse> {
        self.shop_responses
            .iter()
            .filter(move |r| r.iteration == iteration)
    }

    /// 写入最终推荐并标记完成；已完成的会话保持不变
    pub fn complete(&mut self, recommendations: Vec<Recommendation>) -> bool {
        if self.is_complete {
            return false;
        }
        self.recommendations = Some(recommendations);
        self.is_complete = true;
        true
    }

    /// 校验不变量，返回第一条违反项
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.iteration > self.max_iterations {
            return Err(format!(
                "iteration {} exceeds max_iterations {}",
                self.iteration, self.max_iterations
            ));
        }
        if self.recommendations.is_some() != self.is_complete {
            return Err("recommendations must be set exactly when complete".to_string());
        }
        if self.is_complete && self.current_step != WorkflowStep::Done {
            return Err(format!("complete state at step {}", self.current_step));
        }
        Ok(())
    }
}
