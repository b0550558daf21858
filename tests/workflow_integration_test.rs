//! 工作流集成测试：用替身协作方驱动完整状态机

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use negotiator::config::AgentSection;
use negotiator::core::{AgentError, AgentState, QueryRequest, Route, WorkflowStep};
use negotiator::tools::{
    PriceCompareTool, Tool, ToolExecutor, ToolRegistry, CONTACT_SHOP_TOOL, FETCH_REVIEWS_TOOL,
    SEARCH_PLACES_TOOL, SEARCH_REVIEWS_TOOL,
};
use negotiator::workflow::{
    ApprovalDecision, CheckpointMeta, CheckpointStore, MemoryCheckpointStore, RunOutcome,
    SqliteCheckpointStore, WorkflowEngine,
};

struct StubPlaces {
    fail: bool,
}

#[async_trait]
impl Tool for StubPlaces {
    fn name(&self) -> &str {
        SEARCH_PLACES_TOOL
    }
    fn description(&self) -> &str {
        "stub place search"
    }
    async fn execute(&self, args: Value) -> Result<Value, String> {
        if self.fail {
            return Err("SerpStack unavailable".to_string());
        }
        assert_eq!(args["city"], "Pune");
        Ok(json!([
            {"name": "Budget Gym", "address": "Kothrud", "phone": "020 1111", "rating": 4.1, "reviews_count": 40},
            {"name": "Pulse Fitness", "address": "Baner", "phone": "020 2222", "rating": 4.8, "reviews_count": 407},
            {"name": "Iron Temple", "address": "Aundh", "phone": "020 3333", "rating": 4.6, "reviews_count": 120},
        ]))
    }
}

struct StubReviews;

#[async_trait]
impl Tool for StubReviews {
    fn name(&self) -> &str {
        SEARCH_REVIEWS_TOOL
    }
    fn description(&self) -> &str {
        "stub review search"
    }
    async fn execute(&self, _args: Value) -> Result<Value, String> {
        Ok(json!({
            "source": "tavily",
            "results": [
                {"title": "Pulse Fitness Baner", "content": "Pulse Fitness has great trainers", "url": "https://example.com/pulse"}
            ]
        }))
    }
}

/// 模拟商家：按名称报价，议价时 Pulse Fitness 降到 3500；记录调用次数与同时进行的调用数
struct StubShop {
    calls: Arc<AtomicUsize>,
    questions: Arc<Mutex<Vec<(String, String)>>>,
    in_flight: Arc<AtomicUsize>,
    peak_in_flight: Arc<AtomicUsize>,
    slow_place: Option<&'static str>,
    fail: bool,
}

#[async_trait]
impl Tool for StubShop {
    fn name(&self) -> &str {
        CONTACT_SHOP_TOOL
    }
    fn description(&self) -> &str {
        "stub shop simulator"
    }
    async fn execute(&self, args: Value) -> Result<Value, String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        let name = args["place_name"].as_str().unwrap_or_default().to_string();
        if self.slow_place == Some(name.as_str()) {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        let question = args["question_type"].as_str().unwrap_or_default().to_string();
        self.questions
            .lock()
            .unwrap()
            .push((name.clone(), question.clone()));
        if self.fail {
            return Err("model overloaded".to_string());
        }
        let monthly = match (name.as_str(), question.as_str()) {
            ("Pulse Fitness", "negotiation") => 3500.0,
            ("Pulse Fitness", _) => 4000.0,
            ("Iron Temple", _) => 2500.0,
            _ => 1500.0,
        };
        Ok(json!({
            "response_type": question,
            "message": format!("{name}: {monthly} per month"),
            "pricing_info": {"monthly": monthly},
            "available": true,
            "features": ["cardio", "weights"],
        }))
    }
}

struct StubFetchReviews;

#[async_trait]
impl Tool for StubFetchReviews {
    fn name(&self) -> &str {
        FETCH_REVIEWS_TOOL
    }
    fn description(&self) -> &str {
        "stub review extraction"
    }
    async fn execute(&self, args: Value) -> Result<Value, String> {
        let query = args["query"].as_str().unwrap_or_default();
        assert!(query.contains("Iron Temple"));
        assert!(query.contains("Pune"));
        Ok(json!(["Clean and spacious", "Friendly staff", "Crowded evenings"]))
    }
}

/// 包装内存存储：第一次保存指定步骤的状态时返回写入错误
struct FlakyStore {
    inner: MemoryCheckpointStore,
    fail_on: WorkflowStep,
    tripped: AtomicBool,
}

impl FlakyStore {
    fn failing_once_on(step: WorkflowStep) -> Self {
        Self {
            inner: MemoryCheckpointStore::new(),
            fail_on: step,
            tripped: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl CheckpointStore for FlakyStore {
    async fn save(&self, thread_id: &str, state: &AgentState) -> Result<(), AgentError> {
        if state.current_step == self.fail_on && !self.tripped.swap(true, Ordering::SeqCst) {
            return Err(AgentError::Checkpoint("disk full".to_string()));
        }
        self.inner.save(thread_id, state).await
    }

    async fn load(&self, thread_id: &str) -> Result<Option<AgentState>, AgentError> {
        self.inner.load(thread_id).await
    }

    async fn history(&self, thread_id: &str) -> Result<Vec<CheckpointMeta>, AgentError> {
        self.inner.history(thread_id).await
    }

    async fn list_threads(&self) -> Result<Vec<String>, AgentError> {
        self.inner.list_threads().await
    }
}

struct Harness {
    shop_calls: Arc<AtomicUsize>,
    questions: Arc<Mutex<Vec<(String, String)>>>,
    peak_in_flight: Arc<AtomicUsize>,
    slow_place: Option<&'static str>,
}

impl Harness {
    fn new() -> Self {
        Self {
            shop_calls: Arc::new(AtomicUsize::new(0)),
            questions: Arc::new(Mutex::new(Vec::new())),
            peak_in_flight: Arc::new(AtomicUsize::new(0)),
            slow_place: None,
        }
    }

    fn with_slow_place(mut self, name: &'static str) -> Self {
        self.slow_place = Some(name);
        self
    }

    fn engine_with(
        &self,
        store: Arc<dyn CheckpointStore>,
        agent: AgentSection,
        places_fail: bool,
        shop_fail: bool,
    ) -> WorkflowEngine {
        let mut registry = ToolRegistry::new();
        registry.register(StubPlaces { fail: places_fail });
        registry.register(StubReviews);
        registry.register(StubShop {
            calls: Arc::clone(&self.shop_calls),
            questions: Arc::clone(&self.questions),
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak_in_flight: Arc::clone(&self.peak_in_flight),
            slow_place: self.slow_place,
            fail: shop_fail,
        });
        registry.register(PriceCompareTool);
        registry.register(StubFetchReviews);
        WorkflowEngine::new(ToolExecutor::new(registry, 5), store, agent)
    }

    fn engine(&self, agent: AgentSection) -> WorkflowEngine {
        self.engine_with(Arc::new(MemoryCheckpointStore::new()), agent, false, false)
    }

    fn calls(&self) -> usize {
        self.shop_calls.load(Ordering::SeqCst)
    }

    fn peak(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

fn no_approval() -> AgentSection {
    AgentSection {
        require_approval: false,
        ..Default::default()
    }
}

fn gym_request(intent: &str, budget: Option<f64>) -> QueryRequest {
    QueryRequest {
        city: "Pune".to_string(),
        place_type: "gym".to_string(),
        user_intent: intent.to_string(),
        user_query: "affordable gym with good trainers".to_string(),
        budget,
        ..Default::default()
    }
}

fn assert_done(state: &AgentState) {
    assert_eq!(state.current_step, WorkflowStep::Done);
    assert!(state.is_complete);
    assert!(state.recommendations.is_some());
    assert!(state.iteration <= state.max_iterations);
    assert!(state.check_invariants().is_ok());
}

#[tokio::test]
async fn test_negotiation_recommends_top_rated_within_budget() {
    let h = Harness::new();
    let engine = h.engine(no_approval());

    let outcome = engine.start(gym_request("negotiation", Some(3000.0))).await.unwrap();
    assert!(outcome.is_completed());
    let state = outcome.into_state();
    assert_done(&state);
    assert_eq!(state.route, Some(Route::Negotiation));

    let recs = state.recommendations.as_ref().unwrap();
    assert_eq!(recs.len(), 1);
    assert_eq!(recs[0].name, "Iron Temple");
    assert_eq!(recs[0].price, Some(2500.0));
    assert_eq!(recs[0].within_budget, Some(true));

    // 首轮三家询价，第二轮只对超预算的 Pulse Fitness 议价
    assert_eq!(state.iteration, 2);
    assert_eq!(h.calls(), 4);
    let questions = h.questions.lock().unwrap().clone();
    assert!(questions.contains(&("Pulse Fitness".to_string(), "negotiation".to_string())));
    assert_eq!(
        questions.iter().filter(|(_, q)| q == "pricing").count(),
        3
    );
}

#[tokio::test]
async fn test_show_all_returns_every_qualifying_place() {
    let h = Harness::new();
    let engine = h.engine(no_approval());
    let mut request = gym_request("negotiation", Some(3000.0));
    request.show_all = Some(true);

    let state = engine.start(request).await.unwrap().into_state();
    let names: Vec<&str> = state
        .recommendations
        .as_ref()
        .unwrap()
        .iter()
        .map(|r| r.name.as_str())
        .collect();
    assert_eq!(names, vec!["Iron Temple", "Budget Gym"]);
    assert!(state
        .recommendations
        .as_ref()
        .unwrap()
        .iter()
        .all(|r| r.price.is_some_and(|p| p <= 3000.0)));
}

#[tokio::test]
async fn test_info_only_never_contacts_shops() {
    let h = Harness::new();
    let engine = h.engine(AgentSection::default());

    let state = engine
        .start(gym_request("info_only", None))
        .await
        .unwrap()
        .into_state();
    assert_done(&state);
    assert_eq!(state.iteration, 0);
    assert_eq!(h.calls(), 0);
    assert!(state.shop_responses.is_empty());
    assert!(!state.approval_required);
    assert_eq!(state.recommendations.as_ref().unwrap()[0].name, "Pulse Fitness");
}

#[tokio::test]
async fn test_unknown_intent_uses_default_route() {
    let h = Harness::new();
    let engine = h.engine(AgentSection::default());

    let state = engine
        .start(gym_request("whatever", None))
        .await
        .unwrap()
        .into_state();
    assert_done(&state);
    assert_eq!(state.route, Some(Route::InfoOnly));
}

#[tokio::test]
async fn test_comparison_route_records_price_comparison() {
    let h = Harness::new();
    let engine = h.engine(AgentSection::default());

    let state = engine
        .start(gym_request("comparison", Some(3000.0)))
        .await
        .unwrap()
        .into_state();
    assert_done(&state);
    assert_eq!(h.calls(), 0);
    assert!(state.price_comparison.is_some());
}

#[tokio::test]
async fn test_place_search_failure_still_completes_from_reviews() {
    let h = Harness::new();
    let engine = h.engine_with(
        Arc::new(MemoryCheckpointStore::new()),
        AgentSection::default(),
        true,
        false,
    );

    let state = engine
        .start(gym_request("info_only", None))
        .await
        .unwrap()
        .into_state();
    assert_done(&state);
    assert!(state.last_error.is_none());
    assert!(state.serp_results.iter().any(|r| r.get("error").is_some()));
    let recs = state.recommendations.as_ref().unwrap();
    assert_eq!(recs.len(), 1);
    assert_eq!(recs[0].name, "Pulse Fitness Baner");
}

#[tokio::test]
async fn test_simulator_failure_uses_canned_responses() {
    let h = Harness::new();
    let engine = h.engine_with(
        Arc::new(MemoryCheckpointStore::new()),
        no_approval(),
        false,
        true,
    );

    let state = engine
        .start(gym_request("negotiation", Some(3000.0)))
        .await
        .unwrap()
        .into_state();
    assert_done(&state);
    // 预设回复不带来新信息，评估无结论后直接收尾
    assert_eq!(state.iteration, 1);
    assert_eq!(h.calls(), 3);
    assert!(state.shop_responses.iter().all(|r| r.fallback));
    assert!(!state.recommendations.as_ref().unwrap().is_empty());
}

#[tokio::test]
async fn test_zero_iterations_skips_negotiation() {
    let h = Harness::new();
    let engine = h.engine(AgentSection {
        max_iterations: 0,
        require_approval: false,
        ..Default::default()
    });

    let state = engine
        .start(gym_request("negotiation", Some(3000.0)))
        .await
        .unwrap()
        .into_state();
    assert_done(&state);
    assert_eq!(state.iteration, 0);
    assert_eq!(h.calls(), 0);
}

#[tokio::test]
async fn test_approval_survives_restart_and_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("checkpoints.db");
    let h = Harness::new();

    let thread_id = {
        let store = Arc::new(SqliteCheckpointStore::open(&db).unwrap());
        let engine = h.engine_with(store, AgentSection::default(), false, false);
        let outcome = engine.start(gym_request("negotiation", Some(3000.0))).await.unwrap();
        let RunOutcome::Suspended(state) = outcome else {
            panic!("expected suspension");
        };
        assert_eq!(state.current_step, WorkflowStep::AwaitingApproval);
        assert!(state.recommendations.is_none());
        assert!(!state.is_complete);
        state.thread_id
    };
    let calls_before = h.calls();
    assert_eq!(calls_before, 4);

    // 新进程：只凭 thread_id 与数据库恢复
    let store = Arc::new(SqliteCheckpointStore::open(&db).unwrap());
    let engine = h.engine_with(store, AgentSection::default(), false, false);

    let suspended = engine.status(&thread_id).await.unwrap();
    let resumed = engine.resume(&thread_id).await.unwrap();
    assert!(!resumed.is_completed());
    assert_eq!(resumed.state().messages.len(), suspended.messages.len());

    let done = engine
        .submit_approval(
            &thread_id,
            ApprovalDecision::Approve {
                notes: Some("go ahead".to_string()),
            },
        )
        .await
        .unwrap()
        .into_state();
    assert_done(&done);
    assert_eq!(done.iteration, suspended.iteration);
    assert_eq!(h.calls(), calls_before);
    assert_eq!(done.recommendations.as_ref().unwrap()[0].name, "Iron Temple");
    assert!(done.messages.len() > suspended.messages.len());

    let again = engine
        .submit_approval(&thread_id, ApprovalDecision::Approve { notes: None })
        .await
        .unwrap()
        .into_state();
    assert_eq!(again.recommendations, done.recommendations);
    assert_eq!(again.messages, done.messages);
    assert_eq!(h.calls(), calls_before);

    let history = engine.history(&thread_id).await.unwrap();
    assert_eq!(history.first().map(|m| m.step), Some(WorkflowStep::Init));
    assert_eq!(history.last().map(|m| m.step), Some(WorkflowStep::Done));
}

#[tokio::test]
async fn test_rejection_completes_with_empty_recommendations() {
    let h = Harness::new();
    let engine = h.engine(AgentSection::default());

    let suspended = engine
        .start(gym_request("negotiation", Some(3000.0)))
        .await
        .unwrap()
        .into_state();
    let state = engine
        .submit_approval(
            &suspended.thread_id,
            ApprovalDecision::Reject {
                notes: "prefer somewhere closer".to_string(),
            },
        )
        .await
        .unwrap()
        .into_state();
    assert_done(&state);
    assert_eq!(state.recommendations, Some(Vec::new()));
    assert!(!state.human_approved);
    assert_eq!(state.human_notes.as_deref(), Some("prefer somewhere closer"));
}

#[tokio::test]
async fn test_thread_errors() {
    let h = Harness::new();
    let engine = h.engine(no_approval());

    let err = engine.resume("missing").await.unwrap_err();
    assert!(matches!(err, AgentError::ThreadNotFound(_)));

    let mut request = gym_request("info_only", None);
    request.thread_id = Some("fixed".to_string());
    engine.start(request.clone()).await.unwrap();
    let err = engine.start(request).await.unwrap_err();
    assert!(matches!(err, AgentError::InvalidState(_)));

    let err = engine
        .submit_approval("missing", ApprovalDecision::Approve { notes: None })
        .await
        .unwrap_err();
    assert!(matches!(err, AgentError::ThreadNotFound(_)));
}

#[tokio::test]
async fn test_fetch_reviews_stores_reviews_on_thread() {
    let h = Harness::new();
    let engine = h.engine(no_approval());

    let state = engine
        .start(gym_request("negotiation", Some(3000.0)))
        .await
        .unwrap()
        .into_state();
    let reviews = engine
        .fetch_reviews(&state.thread_id, "Iron Temple", 2)
        .await
        .unwrap();
    assert_eq!(reviews, vec!["Clean and spacious", "Friendly staff"]);

    let saved = engine.status(&state.thread_id).await.unwrap();
    assert_eq!(saved.reviews.get("Iron Temple"), Some(&reviews));
    assert_eq!(saved.recommendations, state.recommendations);
}

async fn fail_reflection_then_resume(max_iterations: u32) -> (Harness, AgentState, AgentState) {
    let h = Harness::new();
    let store = Arc::new(FlakyStore::failing_once_on(WorkflowStep::Reflecting));
    let engine = h.engine_with(
        store,
        AgentSection {
            max_iterations,
            require_approval: false,
            ..Default::default()
        },
        false,
        false,
    );
    let mut request = gym_request("negotiation", Some(3000.0));
    request.thread_id = Some("flaky".to_string());

    let err = engine.start(request).await.unwrap_err();
    assert!(matches!(err, AgentError::Checkpoint(_)));
    let failed = engine.status("flaky").await.unwrap();

    let resumed = engine.resume("flaky").await.unwrap().into_state();
    (h, failed, resumed)
}

#[tokio::test]
async fn test_failed_save_records_pre_step_state() {
    let (h, failed, resumed) = fail_reflection_then_resume(1).await;

    assert_eq!(failed.current_step, WorkflowStep::Failed);
    assert_eq!(failed.failed_after, Some(WorkflowStep::Negotiating));
    assert!(failed.last_error.as_deref().is_some_and(|e| e.contains("disk full")));
    // 失败的 REFLECTING 没有留下任何痕迹
    assert_eq!(failed.iteration, 0);
    assert!(failed.critique.is_none());
    assert!(failed.refined_analysis.is_empty());
    assert_eq!(failed.shop_responses.len(), 3);

    assert_done(&resumed);
    assert_eq!(resumed.iteration, 1);
    assert!(resumed.last_error.is_none());
    assert!(resumed.failed_after.is_none());
    assert_eq!(h.calls(), 3);
}

#[tokio::test]
async fn test_resume_after_failure_keeps_negotiation_follow_up() {
    let (h, _, resumed) = fail_reflection_then_resume(3).await;

    assert_done(&resumed);
    assert_eq!(resumed.iteration, 2);
    assert_eq!(h.calls(), 4);
    let questions = h.questions.lock().unwrap().clone();
    assert!(questions.contains(&("Pulse Fitness".to_string(), "negotiation".to_string())));
    let reflections = resumed
        .messages
        .iter()
        .filter(|m| m.content.starts_with("Reflection round"))
        .count();
    assert_eq!(reflections, 2);
    assert_eq!(resumed.recommendations.as_ref().unwrap()[0].name, "Iron Temple");
}

#[tokio::test]
async fn test_step_limit_forces_finalizing() {
    let h = Harness::new();
    let engine = h.engine(AgentSection {
        recursion_limit: 3,
        require_approval: false,
        ..Default::default()
    });

    let state = engine
        .start(gym_request("negotiation", Some(3000.0)))
        .await
        .unwrap()
        .into_state();
    assert_done(&state);
    // SEARCHING、ANALYZING、NEGOTIATING 之后直接收尾，REFLECTING 不再执行
    assert_eq!(state.iteration, 0);
    assert!(state.critique.is_none());
    assert_eq!(h.calls(), 3);

    let steps: Vec<WorkflowStep> = engine
        .history(&state.thread_id)
        .await
        .unwrap()
        .into_iter()
        .map(|m| m.step)
        .collect();
    assert_eq!(
        steps,
        vec![
            WorkflowStep::Init,
            WorkflowStep::Searching,
            WorkflowStep::Analyzing,
            WorkflowStep::Negotiating,
            WorkflowStep::Finalizing,
            WorkflowStep::Done,
        ]
    );
}

async fn assert_replies_follow_their_place(concurrency: usize) -> usize {
    let h = Harness::new().with_slow_place("Pulse Fitness");
    let engine = h.engine(AgentSection {
        negotiation_concurrency: concurrency,
        require_approval: false,
        ..Default::default()
    });

    let state = engine
        .start(gym_request("negotiation", Some(3000.0)))
        .await
        .unwrap()
        .into_state();
    assert_done(&state);

    let first_round: Vec<(&str, Option<f64>)> = state
        .shop_responses
        .iter()
        .filter(|r| r.iteration == 1)
        .map(|r| (r.place_name.as_str(), r.price()))
        .collect();
    assert_eq!(
        first_round,
        vec![
            ("Pulse Fitness", Some(4000.0)),
            ("Iron Temple", Some(2500.0)),
            ("Budget Gym", Some(1500.0)),
        ]
    );
    assert!(state
        .shop_responses
        .iter()
        .all(|r| r.message.starts_with(r.place_name.as_str())));
    assert_eq!(state.recommendations.as_ref().unwrap()[0].name, "Iron Temple");
    h.peak()
}

#[tokio::test]
async fn test_slow_reply_is_matched_to_its_place_when_serialized() {
    assert_eq!(assert_replies_follow_their_place(1).await, 1);
}

#[tokio::test]
async fn test_slow_reply_is_matched_to_its_place_when_concurrent() {
    let peak = assert_replies_follow_their_place(3).await;
    assert!(peak > 1 && peak <= 3);
}
