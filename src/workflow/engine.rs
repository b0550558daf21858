//! 工作流引擎：Reflexion 控制器
//!
//! 显式有限状态机：
//! `INIT → SEARCHING → ANALYZING → (NEGOTIATING ⇄ REFLECTING)* → FINALIZING → AWAITING_APPROVAL? → FINALIZING → DONE`，
//! 任一步不可恢复时进入 FAILED。`next_step` 是唯一的分派函数，`execute_step` 只执行副作用。
//!
//! - 每一步完成后写入 Checkpoint；同一 thread_id 的调用在进程内串行
//! - SEARCHING 内商家搜索与评价搜索并发，NEGOTIATING 内按 Semaphore 限制并发
//! - 进入 FINALIZING 之后不再调用工具

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use futures_util::future::join_all;
use serde_json::{json, Value};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, Semaphore};

use crate::config::{AgentSection, AppConfig};
use crate::core::{
    AgentError, AgentState, CritiqueOutcome, QueryRequest, QuestionType, RecoveryAction,
    RecoveryEngine, Route, ShopResponse, WorkflowStep,
};
use crate::llm::create_llm_from_config;
use crate::memory::Message;
use crate::tools::{
    default_registry, fallback_response, is_error_record, PriceComparison, ToolExecutor,
    COMPARE_PRICES_TOOL, CONTACT_SHOP_TOOL, FETCH_REVIEWS_TOOL, SEARCH_PLACES_TOOL,
    SEARCH_REVIEWS_TOOL,
};
use crate::workflow::approval::{self, ApprovalDecision};
use crate::workflow::checkpoint::{create_checkpoint_store, CheckpointMeta, CheckpointStore};
use crate::workflow::reflexion;
use crate::workflow::router::{self, DEFAULT_ROUTE};

/// 一次调用的结束方式；不可恢复错误以 Err 返回
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// 已到达 DONE
    Completed(AgentState),
    /// 停在 AWAITING_APPROVAL，等待外部审批
    Suspended(AgentState),
}

impl RunOutcome {
    pub fn state(&self) -> &AgentState {
        match self {
            RunOutcome::Completed(s) | RunOutcome::Suspended(s) => s,
        }
    }

    pub fn into_state(self) -> AgentState {
        match self {
            RunOutcome::Completed(s) | RunOutcome::Suspended(s) => s,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, RunOutcome::Completed(_))
    }
}

/// 状态分派：(current_step, state) → next_step
pub fn next_step(state: &AgentState) -> WorkflowStep {
    use WorkflowStep::*;
    match state.current_step {
        Init => Searching,
        Searching => Analyzing,
        Analyzing => {
            let route = state.route.unwrap_or(DEFAULT_ROUTE);
            if route == Route::Negotiation
                && state.iteration < state.max_iterations
                && !state.initial_analysis.is_empty()
            {
                Negotiating
            } else {
                Finalizing
            }
        }
        Negotiating => Reflecting,
        Reflecting => {
            let refine_again = state
                .critique
                .as_ref()
                .is_some_and(|c| c.outcome == CritiqueOutcome::NeedsRefinement);
            if state.iteration < state.max_iterations && refine_again {
                Negotiating
            } else {
                Finalizing
            }
        }
        Finalizing | AwaitingApproval => {
            if state.approval_pending() {
                AwaitingApproval
            } else if state.current_step == AwaitingApproval {
                Finalizing
            } else {
                Done
            }
        }
        Done => Done,
        Failed => Failed,
    }
}

pub struct WorkflowEngine {
    executor: Arc<ToolExecutor>,
    store: Arc<dyn CheckpointStore>,
    recovery: RecoveryEngine,
    cfg: AgentSection,
    /// 议价调用的并发上限（所有会话共享，保护补全服务）
    negotiation_pool: Arc<Semaphore>,
    thread_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl WorkflowEngine {
    pub fn new(executor: ToolExecutor, store: Arc<dyn CheckpointStore>, cfg: AgentSection) -> Self {
        let permits = cfg.negotiation_concurrency.max(1);
        Self {
            executor: Arc::new(executor),
            store,
            recovery: RecoveryEngine::new(),
            cfg,
            negotiation_pool: Arc::new(Semaphore::new(permits)),
            thread_locks: Mutex::new(HashMap::new()),
        }
    }

    /// 从完整配置构建：LLM（模拟 / 抽取两种温度）、生产工具、Checkpoint 存储
    pub fn from_config(cfg: &AppConfig) -> Result<Self, AgentError> {
        let simulation_llm = create_llm_from_config(&cfg.llm, cfg.llm.simulation_temperature);
        let extraction_llm = create_llm_from_config(&cfg.llm, 0.0);
        let registry = default_registry(&cfg.tools, simulation_llm, extraction_llm);
        let executor = ToolExecutor::new(registry, cfg.tools.tool_timeout_secs);
        let store = create_checkpoint_store(&cfg.storage)?;
        Ok(Self::new(executor, store, cfg.agent.clone()))
    }

    async fn lock_thread(&self, thread_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self
                .thread_locks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            // 只剩表内引用的锁无人持有也无人等待，可以回收
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            Arc::clone(locks.entry(thread_id.to_string()).or_default())
        };
        lock.lock_owned().await
    }

    async fn load_existing(&self, thread_id: &str) -> Result<AgentState, AgentError> {
        self.store
            .load(thread_id)
            .await?
            .ok_or_else(|| AgentError::ThreadNotFound(thread_id.to_string()))
    }

    /// 新会话：初始化状态 → Router → 运行到 DONE 或挂起
    pub async fn start(&self, request: QueryRequest) -> Result<RunOutcome, AgentError> {
        let thread_id = request
            .thread_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let _guard = self.lock_thread(&thread_id).await;
        if self.store.load(&thread_id).await?.is_some() {
            return Err(AgentError::InvalidState(format!(
                "thread {thread_id} already exists; use resume"
            )));
        }

        let mut state = AgentState::new(
            request,
            thread_id.clone(),
            self.cfg.max_iterations,
            self.cfg.default_show_all,
        );
        let route = router::route_state(&mut state);
        state.approval_required = approval::requires_approval(route, self.cfg.require_approval);
        tracing::info!(thread_id = %thread_id, route = %route, city = %state.city, place_type = %state.place_type, "conversation started");
        self.store.save(&thread_id, &state).await?;

        self.drive(state).await
    }

    /// 从 Checkpoint 继续（进程重启、失败重试、重复调用均可）；已完成的会话原样返回
    pub async fn resume(&self, thread_id: &str) -> Result<RunOutcome, AgentError> {
        let _guard = self.lock_thread(thread_id).await;
        let mut state = self.load_existing(thread_id).await?;
        if state.current_step == WorkflowStep::Failed {
            let retry_from = state.failed_after.take().unwrap_or(WorkflowStep::Init);
            tracing::info!(thread_id = %thread_id, retry_from = %retry_from, "retrying failed conversation");
            state.current_step = retry_from;
            state.last_error = None;
        }
        self.drive(state).await
    }

    /// 审批关口的恢复操作；已完成的会话直接返回，不会重复议价或增加 iteration
    pub async fn submit_approval(
        &self,
        thread_id: &str,
        decision: ApprovalDecision,
    ) -> Result<RunOutcome, AgentError> {
        let _guard = self.lock_thread(thread_id).await;
        let mut state = self.load_existing(thread_id).await?;
        if state.is_complete {
            return Ok(RunOutcome::Completed(state));
        }
        approval::apply_decision(&mut state, decision)?;
        self.store.save(thread_id, &state).await?;
        self.drive(state).await
    }

    pub async fn status(&self, thread_id: &str) -> Result<AgentState, AgentError> {
        self.load_existing(thread_id).await
    }

    pub async fn history(&self, thread_id: &str) -> Result<Vec<CheckpointMeta>, AgentError> {
        self.store.history(thread_id).await
    }

    pub async fn list_threads(&self) -> Result<Vec<String>, AgentError> {
        self.store.list_threads().await
    }

    /// 为指定商家抓取详细评价，写入 state.reviews 并保存
    pub async fn fetch_reviews(
        &self,
        thread_id: &str,
        place_name: &str,
        limit: usize,
    ) -> Result<Vec<String>, AgentError> {
        let _guard = self.lock_thread(thread_id).await;
        let mut state = self.load_existing(thread_id).await?;
        let address = state
            .latest_analysis()
            .into_iter()
            .find(|a| a.name == place_name)
            .map(|a| a.address.clone())
            .unwrap_or_default();
        let query = [place_name, address.as_str(), state.city.as_str()]
            .iter()
            .filter(|s| !s.trim().is_empty())
            .copied()
            .collect::<Vec<_>>()
            .join(" ");

        let value = self
            .executor
            .execute(FETCH_REVIEWS_TOOL, json!({"query": query, "limit": limit}))
            .await?;
        let reviews: Vec<String> = value
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .take(limit)
                    .collect()
            })
            .unwrap_or_default();

        state.reviews.insert(place_name.to_string(), reviews.clone());
        self.store.save(thread_id, &state).await?;
        Ok(reviews)
    }

    /// 状态机主循环：执行步骤直到 DONE、挂起或失败；步数达到 recursion_limit 时强制进入 FINALIZING
    async fn drive(&self, mut state: AgentState) -> Result<RunOutcome, AgentError> {
        let thread_id = state.thread_id.clone();
        let mut steps = 0usize;
        loop {
            match state.current_step {
                WorkflowStep::Done => return Ok(RunOutcome::Completed(state)),
                WorkflowStep::Failed => {
                    return Err(AgentError::InvalidState(format!(
                        "thread {thread_id} is in FAILED state"
                    )))
                }
                _ => {}
            }

            let mut next = next_step(&state);
            if steps >= self.cfg.recursion_limit && !next.is_finalizing_or_beyond() {
                tracing::warn!(thread_id = %thread_id, steps, "step limit reached, finalizing");
                next = WorkflowStep::Finalizing;
            }

            // 失败时持久化的是步骤执行前的快照，重试从 failed_after 重新执行该步骤
            let snapshot = state.clone();
            let from = state.current_step;

            if next == WorkflowStep::AwaitingApproval {
                if from != WorkflowStep::AwaitingApproval {
                    state.push_messages([approval::suspension_message(&state)]);
                    state.current_step = WorkflowStep::AwaitingApproval;
                    if let Err(e) = self.store.save(&thread_id, &state).await {
                        return Err(self.fail(snapshot, e).await);
                    }
                    tracing::info!(thread_id = %thread_id, "suspended awaiting approval");
                }
                return Ok(RunOutcome::Suspended(state));
            }

            tracing::info!(thread_id = %thread_id, from = %from, to = %next, iteration = state.iteration, "transition");
            if let Err(e) = self.execute_step(next, &mut state).await {
                return Err(self.fail(snapshot, e).await);
            }
            state.current_step = next;
            if let Err(e) = self.store.save(&thread_id, &state).await {
                return Err(self.fail(snapshot, e).await);
            }
            steps += 1;
        }
    }

    /// 以步骤执行前的状态记录失败点并尽力持久化，返回原错误
    async fn fail(&self, mut state: AgentState, err: AgentError) -> AgentError {
        let failed_after = state.current_step;
        tracing::error!(thread_id = %state.thread_id, failed_after = %failed_after, error = %err, "workflow failed");
        state.last_error = Some(err.to_string());
        state.failed_after = Some(failed_after);
        state.current_step = WorkflowStep::Failed;
        if let Err(save_err) = self.store.save(&state.thread_id, &state).await {
            tracing::error!(thread_id = %state.thread_id, error = %save_err, "could not persist failed state");
        }
        err
    }

    async fn execute_step(&self, step: WorkflowStep, state: &mut AgentState) -> Result<(), AgentError> {
        match step {
            WorkflowStep::Searching => self.search(state).await,
            WorkflowStep::Analyzing => self.analyze(state).await,
            WorkflowStep::Negotiating => self.negotiate(state).await,
            WorkflowStep::Reflecting => self.reflect(state).await,
            WorkflowStep::Finalizing => Ok(()),
            WorkflowStep::Done => {
                self.finish(state);
                Ok(())
            }
            WorkflowStep::Init | WorkflowStep::AwaitingApproval | WorkflowStep::Failed => Err(
                AgentError::InvalidState(format!("{step} is not an executable step")),
            ),
        }
    }

    /// 调用协作方；可降级的错误转为 `{"error", "source"}` 记录，不可恢复的错误向上返回
    async fn collaborate(&self, tool: &str, args: Value) -> Result<Value, AgentError> {
        match self.executor.execute(tool, args).await {
            Ok(v) => Ok(v),
            Err(e) => match self.recovery.handle(&e, Some(tool)) {
                RecoveryAction::Abort => Err(e),
                action => {
                    tracing::warn!(tool, error = %e, ?action, "collaborator failed, continuing with degraded data");
                    Ok(json!({"error": e.to_string(), "source": tool}))
                }
            },
        }
    }

    async fn search(&self, state: &mut AgentState) -> Result<(), AgentError> {
        let mut place_args = json!({"city": state.city, "place_type": state.place_type});
        if !state.user_query.trim().is_empty() {
            place_args["query"] = json!(state.user_query);
        }
        let review_args = json!({"place_name": state.place_type, "city": state.city});

        let (places, reviews) = tokio::join!(
            self.collaborate(SEARCH_PLACES_TOOL, place_args),
            self.collaborate(SEARCH_REVIEWS_TOOL, review_args),
        );

        state.serp_results = match places? {
            Value::Array(items) => items,
            other => vec![other],
        };
        state.tavily_reviews = match reviews? {
            Value::Array(items) => items,
            other => vec![other],
        };

        let found = state
            .serp_results
            .iter()
            .filter(|p| !is_error_record(p))
            .count();
        state.push_messages([Message::assistant(format!(
            "Searched {} in {}: {} place result(s), {} review source(s).",
            state.place_type,
            state.city,
            found,
            state.tavily_reviews.iter().filter(|r| !is_error_record(r)).count()
        ))]);
        Ok(())
    }

    async fn analyze(&self, state: &mut AgentState) -> Result<(), AgentError> {
        state.initial_analysis = reflexion::initial_analysis(state, self.cfg.max_candidates);

        if state.route == Some(Route::Comparison) && !state.initial_analysis.is_empty() {
            let payload = reflexion::pricing_payload(&state.initial_analysis);
            let value = self
                .collaborate(COMPARE_PRICES_TOOL, json!({"places": payload, "budget": state.budget}))
                .await?;
            state.price_comparison = Some(value);
        }

        let names: Vec<&str> = state.initial_analysis.iter().map(|a| a.name.as_str()).collect();
        let text = if names.is_empty() {
            "No analyzable places were found.".to_string()
        } else {
            format!("Shortlisted: {}.", names.join(", "))
        };
        state.push_messages([Message::assistant(text)]);
        Ok(())
    }

    /// 向候选商家发起模拟咨询；本轮已有回复的商家跳过（恢复时不重复调用）
    async fn negotiate(&self, state: &mut AgentState) -> Result<(), AgentError> {
        let round = state.iteration + 1;
        let pending: Vec<(String, QuestionType)> = reflexion::plan_questions(state)
            .into_iter()
            .filter(|(name, _)| !state.responses_for(round).any(|r| &r.place_name == name))
            .collect();

        let calls = pending.into_iter().map(|(name, question)| {
            let args = json!({
                "place_name": name,
                "place_type": state.place_type,
                "question_type": question.as_str(),
                "user_budget": state.budget,
            });
            let pool = Arc::clone(&self.negotiation_pool);
            async move {
                let _permit = pool
                    .acquire_owned()
                    .await
                    .map_err(|e| AgentError::InvalidState(format!("negotiation pool closed: {e}")))?;
                let value = self.collaborate(CONTACT_SHOP_TOOL, args).await?;
                Ok::<_, AgentError>((name, question, value))
            }
        });

        let mut by_place: BTreeMap<String, ShopResponse> = BTreeMap::new();
        for result in join_all(calls).await {
            let (name, question, value) = result?;
            let value = if is_error_record(&value) {
                fallback_response(question.as_str())
            } else {
                value
            };
            by_place.insert(name.clone(), shop_response(&name, round, question, &value));
        }

        let fallbacks = by_place.values().filter(|r| r.fallback).count();
        if fallbacks > 0 {
            tracing::warn!(thread_id = %state.thread_id, round, fallbacks, "simulator fallback responses used");
        }
        // 按候选顺序写回，而不是按完成顺序
        let order: Vec<String> = state.initial_analysis.iter().map(|a| a.name.clone()).collect();
        for name in order {
            if let Some(resp) = by_place.remove(&name) {
                state.shop_responses.push(resp);
            }
        }
        state.shop_responses.extend(by_place.into_values());
        Ok(())
    }

    async fn reflect(&self, state: &mut AgentState) -> Result<(), AgentError> {
        let round = state.iteration + 1;
        if round > state.max_iterations {
            return Err(AgentError::InvalidState(format!(
                "iteration {round} exceeds max_iterations {}",
                state.max_iterations
            )));
        }

        let draft = reflexion::refine(state, round, None);
        let comparison = match state.budget {
            Some(budget) => {
                let value = self
                    .collaborate(
                        COMPARE_PRICES_TOOL,
                        json!({"places": reflexion::pricing_payload(&draft), "budget": budget}),
                    )
                    .await?;
                serde_json::from_value::<PriceComparison>(value).ok()
            }
            None => None,
        };
        let refined = reflexion::refine(state, round, comparison.as_ref());
        let critique = reflexion::critique(state, &refined, round);

        tracing::info!(thread_id = %state.thread_id, round, outcome = ?critique.outcome, follow_ups = critique.follow_ups.len(), "reflection");
        state.push_messages([Message::assistant(format!(
            "Reflection round {round}: {:?}, {} open question(s).",
            critique.outcome,
            critique.follow_ups.len()
        ))]);
        state.refined_analysis.extend(refined);
        state.critique = Some(critique);
        state.iteration = round;
        Ok(())
    }

    fn finish(&self, state: &mut AgentState) {
        let recs = if approval::is_rejected(state) {
            Vec::new()
        } else {
            reflexion::build_recommendations(state)
        };
        let text = reflexion::recommendations_message(&recs);
        if state.complete(recs) {
            state.push_messages([Message::assistant(text)]);
        }
    }
}

/// 把工具返回的 JSON 转为 ShopResponse，并关联到发起咨询的商家
fn shop_response(name: &str, iteration: u32, question: QuestionType, v: &Value) -> ShopResponse {
    let pricing_info = v
        .get("pricing_info")
        .and_then(Value::as_object)
        .map(|info| {
            info.iter()
                .filter_map(|(k, p)| p.as_f64().map(|p| (k.clone(), p)))
                .collect::<BTreeMap<String, f64>>()
        })
        .filter(|m| !m.is_empty());
    ShopResponse {
        place_name: name.to_string(),
        iteration,
        question_type: question,
        response_type: v
            .get("response_type")
            .and_then(Value::as_str)
            .unwrap_or(question.as_str())
            .to_string(),
        message: v
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string(),
        pricing_info,
        available: v.get("available").and_then(Value::as_bool).unwrap_or(true),
        features: v
            .get("features")
            .and_then(Value::as_array)
            .map(|a| a.iter().filter_map(Value::as_str).map(str::to_string).collect())
            .unwrap_or_default(),
        fallback: v.get("fallback").and_then(Value::as_bool).unwrap_or(false),
    }
}
