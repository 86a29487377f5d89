//! The per-turn state machine.
//!
//! One user instruction is handled as a bounded loop of passes. Each pass
//! builds a request, calls the provider through stream recovery, parses and
//! normalizes the reply, then decides: run tools and go around with a
//! compact follow-up, ask the user and go around with their answers, fire a
//! one-shot retry (strict-change, code-first, lint recovery), or finish by
//! applying edits, running commands and persisting the turn. Every retry
//! flag fires at most once per user turn, so the loop cannot run away.

use std::collections::BTreeMap;
use std::hash::Hash;
use std::hash::Hasher;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use pilot_protocol::EventPhase;
use pilot_protocol::EventStatus;
use pilot_protocol::ExecutionEvent;
use pilot_protocol::ModelReply;
use pilot_protocol::Role;
use pilot_protocol::SessionEntry;
use pilot_protocol::SessionFile;
use pilot_protocol::TaskChange;
use pilot_protocol::TerminalRequest;
use pilot_protocol::normalize_reply;
use regex_lite::Regex;
use serde_json::Value;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::config::ConfigShape;
use crate::config::LOCAL_PROVIDER;
use crate::config::RunPolicy;
use crate::context::RuntimeContext;
use crate::diff_log;
use crate::error::AgentErr;
use crate::error::Result;
use crate::json_repair::parse_lenient;
use crate::mission;
use crate::mission::MissionContext;
use crate::observer::ObserverSnapshot;
use crate::observer::StreamObserver;
use crate::provider::ProviderCallOptions;
use crate::provider::ProviderUsage;
use crate::recovery::RecoveryOptions;
use crate::recovery::RenderThrottle;
use crate::recovery::call_with_recovery;
use crate::session;
use crate::task::TaskInputs;
use crate::task::build_task;
use crate::tools::files;
use crate::tools::mcp;
use crate::tools::search;
use crate::tools::web;

/// Lint may drive this many consecutive cycles before the loop guard fires.
const MAX_CONSECUTIVE_LINT_CYCLES: u32 = 2;
/// Tool follow-up passes per mission step.
const MAX_TOOL_PASSES_MISSION: u32 = 6;
/// Tool follow-up passes in an interactive turn.
const MAX_TOOL_PASSES_INTERACTIVE: u32 = 10;
/// Per-tool output budget in the follow-up instruction.
const TOOL_OUTPUT_CAP: usize = 16 * 1024;
/// Compacted turns enumerated in the synthetic summary entry.
const MAX_SUMMARY_ENTRIES: usize = 24;

pub const SYSTEM_PROMPT: &str = r#"You are a coding assistant operating on the user's machine.
Reply with exactly one JSON object and no code fences around it.
Recognized keys: "response" (markdown for the user), "thought", "plan",
"self_critique", "ask_user_questions" (list), "request_files" (list of paths),
"web_search" (list of queries), "web_search_type", "web_search_limit",
"web_browse" (list of urls), "search_project" (pattern), "detailed_map" (bool),
"find_symbol" (name or {"symbol","regex"}), "index_project" (bool),
"lint_project" (bool), "terminal_spawn"/"terminal_input"/"terminal_read"/
"terminal_kill", "changes" (list of {"file","original","edited"}),
"commands" (list of {"command","reason"}), "mission_complete" (bool),
"mcp_call" ({"server","tool","args"}).
For edits, quote the exact original snippet; an empty "original" writes the
whole file. A repeated "original" is replaced at every occurrence, so quote
an unambiguous snippet for partial edits. Never describe file edits in
prose without a matching "changes" entry."#;

/// How a slash command was (not) handled by the external registry.
pub enum CommandDispatch {
    Handled(String),
    Unknown { suggestion: Option<String> },
}

pub trait CommandRegistry: Send + Sync {
    fn dispatch(&self, line: &str) -> CommandDispatch;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TurnArgs {
    pub plan: bool,
    pub fast: bool,
}

#[derive(Debug)]
pub struct TurnOutcome {
    pub reply: ModelReply,
    pub applied_files: usize,
    pub commands_run: usize,
    pub tool_passes: u32,
    pub ran_tools: bool,
    pub usage: ProviderUsage,
}

impl TurnOutcome {
    /// A step that produced neither tools, edits nor commands is idle.
    pub fn is_idle(&self) -> bool {
        !self.ran_tools && self.applied_files == 0 && self.commands_run == 0
    }
}

/// Entry point for one user turn.
pub async fn run_turn(
    ctx: &RuntimeContext,
    user_text: &str,
    args: TurnArgs,
    registry: Option<&dyn CommandRegistry>,
) -> Result<Option<TurnOutcome>> {
    let trimmed = user_text.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }

    // Route: slash commands go to the external registry.
    if trimmed.starts_with('/') {
        match registry.map(|r| r.dispatch(trimmed)) {
            Some(CommandDispatch::Handled(output)) => {
                if !output.is_empty() {
                    ctx.interaction.notify(&output);
                }
            }
            Some(CommandDispatch::Unknown { suggestion }) => {
                let hint = match suggestion {
                    Some(name) => format!("Unknown command. Did you mean {name}?"),
                    None => "Unknown command. Try /help.".to_string(),
                };
                ctx.interaction.notify(&hint);
            }
            None => ctx.interaction.notify("Commands are not available here."),
        }
        return Ok(None);
    }

    let config = ctx.config_snapshot();

    // Mission dispatch: the outer loop drives its own plan/execute passes.
    if config.flags.mission_mode {
        return mission::drive(ctx, trimmed).await.map(Some);
    }

    // Planning expansion: collect a plan, write the artifact, then execute
    // with the plan appended as context.
    if config.flags.planning_mode && !args.plan {
        let plan_outcome = execute_passes(
            ctx,
            trimmed,
            PassOptions {
                plan: true,
                fast: args.fast,
                mission: None,
            },
        )
        .await?;
        let plan_text = plan_text_of(&plan_outcome.reply);
        if let Err(err) = write_plan_artifact(ctx, trimmed, &plan_outcome.reply) {
            warn!("failed to write plan artifact: {err}");
        }
        let augmented = format!("{trimmed}\n\n[PLAN]\n{plan_text}");
        return execute_passes(
            ctx,
            &augmented,
            PassOptions {
                plan: false,
                fast: args.fast,
                mission: None,
            },
        )
        .await
        .map(Some);
    }

    execute_passes(
        ctx,
        trimmed,
        PassOptions {
            plan: args.plan,
            fast: args.fast,
            mission: None,
        },
    )
    .await
    .map(Some)
}

pub(crate) struct PassOptions {
    pub plan: bool,
    pub fast: bool,
    pub mission: Option<MissionContext>,
}

struct PassState {
    instruction: String,
    tool_passes: u32,
    strict_change_retry_used: bool,
    code_first_retry_used: bool,
    lint_recovery_used: bool,
    lint_depth: u32,
    last_lint_digest: Option<u64>,
    applied_at_last_lint: usize,
    applied_total: usize,
    commands_total: usize,
    ran_tools: bool,
    usage: ProviderUsage,
}

/// The pass loop: states 4-18 of the turn state machine.
pub(crate) async fn execute_passes(
    ctx: &RuntimeContext,
    user_text: &str,
    options: PassOptions,
) -> Result<TurnOutcome> {
    let config = ctx.config_snapshot();
    let provider = ctx.provider()?;
    let mut session_file = ctx.sessions.load_or_create(&ctx.session_name())?;

    maybe_auto_compact(ctx, &config, provider.context_window(), &mut session_file)?;

    let mut state = PassState {
        instruction: user_text.to_string(),
        tool_passes: 0,
        strict_change_retry_used: false,
        code_first_retry_used: false,
        lint_recovery_used: false,
        lint_depth: 0,
        last_lint_digest: None,
        applied_at_last_lint: 0,
        applied_total: 0,
        commands_total: 0,
        ran_tools: false,
        usage: ProviderUsage::default(),
    };
    let tool_pass_cap = if options.mission.is_some() {
        MAX_TOOL_PASSES_MISSION
    } else {
        MAX_TOOL_PASSES_INTERACTIVE
    };

    loop {
        ctx.bus.emit(ExecutionEvent::new(
            EventPhase::Thinking,
            EventStatus::Start,
            "preparing request",
        ));

        // Request build, with a warm continuation when the cache matches.
        let warm = config.active_provider == LOCAL_PROVIDER
            && session::continuation_is_warm(&session_file, provider.model(), SYSTEM_PROMPT);
        let continuation = warm
            .then(|| session::read_continuation(&session_file))
            .flatten()
            .map(|cache| cache.continuation_tokens);

        let payload = {
            let project_map = (options.plan || config.flags.see_project_mode)
                .then(|| search::detailed_map(&ctx.cwd, 200));
            let project_listing = config
                .flags
                .see_project_mode
                .then(|| search::project_listing(&ctx.cwd, 500));
            build_task(
                &config,
                TaskInputs {
                    instruction: &state.instruction,
                    raw_input: user_text,
                    plan_mode: options.plan,
                    fast: options.fast || config.flags.fast_mode,
                    history: &session_file.session,
                    mission_data: options.mission.as_ref().map(MissionContext::to_value),
                    project_map,
                    project_listing,
                    continuation_warm: warm,
                },
                |path| {
                    // Context files ride along on a best-effort basis; the
                    // access prompt only triggers for explicit tool reads.
                    std::fs::read_to_string(path).map_err(|e| e.to_string())
                },
            )
        };

        let called = call_provider(ctx, &config, provider.as_ref(), &payload.to_provider_text(), continuation)
            .await;
        let (response, snapshot, stream_raw) = match called {
            Ok(turn) => turn,
            Err(err) => {
                // Memory is not updated with a fabricated answer; the cached
                // continuation is no longer trustworthy.
                session::invalidate_continuation(&mut session_file);
                let _ = ctx.sessions.save(&session_file);
                ctx.bus.emit(ExecutionEvent::new(
                    EventPhase::Error,
                    EventStatus::End,
                    err.to_string(),
                ));
                return Err(err);
            }
        };

        state.usage.input_tokens += response.usage.input_tokens;
        state.usage.output_tokens += response.usage.output_tokens;
        session::add_spent_tokens(&mut session_file, response.usage.total());

        // Store fresh continuation state for the local provider.
        if config.active_provider == LOCAL_PROVIDER
            && let Some(tokens) = response.provider_state.clone()
        {
            session::write_continuation(
                &mut session_file,
                &session::ContinuationCache {
                    continuation_tokens: tokens,
                    model_name: provider.model().to_string(),
                    saved_at: chrono::Utc::now(),
                    valid: true,
                    prompt_fingerprint: session::fingerprint(SYSTEM_PROMPT),
                },
            );
        }

        // Parse ladder, then alias normalization and observer backfill.
        let parsed = parse_response(&response.text, &stream_raw);
        let mut reply = match &parsed {
            Some(value) => normalize_reply(value),
            None => ModelReply {
                response: response.text.clone(),
                ..ModelReply::default()
            },
        };
        backfill_from_snapshot(&mut reply, &snapshot);
        if !reply.wants_tools() && !reply.is_actionable() && !snapshot.seen_tool_keys.is_empty() {
            // The stream signalled tools whose payloads never completed;
            // nothing can be executed, but the intent is worth surfacing.
            debug!(
                "tool signals without complete payloads: {:?}",
                snapshot.seen_tool_keys
            );
        }
        if reply.response.trim().is_empty() && !reply.wants_tools() && !reply.is_actionable() {
            ctx.interaction
                .notify("The model returned an empty response.");
            reply.response = "(empty response)".to_string();
        }

        // Tool execution and the compact follow-up pass.
        if reply.wants_tools() && state.tool_passes < tool_pass_cap {
            let lint_requested = reply.lint_project;
            let tool_results = run_tools(ctx, &config, &reply).await?;
            state.ran_tools = true;
            state.tool_passes += 1;

            if lint_requested
                && let Some(lint_output) = tool_results.get("lint_project")
            {
                match lint_guard_verdict(&mut state, lint_output) {
                    LintVerdict::Continue => {}
                    LintVerdict::Recover => {
                        state.instruction = format!(
                            "{}\n\n[LOOP GUARD]\nLint has now run {} times without new edits. \
                             Do not call lint_project again. Reply with concrete changes[] \
                             entries that fix the reported problems.",
                            first_non_empty_line(user_text),
                            state.lint_depth,
                        );
                        continue;
                    }
                    LintVerdict::Abort => {
                        ctx.interaction.notify(
                            "Stopping: lint kept failing without the model producing new edits.",
                        );
                        finalize_turn(ctx, &mut session_file, user_text, &reply, &state)?;
                        return Err(AgentErr::LintLoopExceeded);
                    }
                }
            }

            state.instruction = follow_up_instruction(user_text, &tool_results);
            continue;
        }

        // Clarifications: ask sequentially, then go around with the answers.
        if !reply.ask_user_questions.is_empty() {
            let mut answers = String::from("[ASK_USER_ANSWER]\n");
            for question in &reply.ask_user_questions {
                let answer = ctx.interaction.ask(question).await?;
                answers.push_str(&format!("Q: {question}\nA: {answer}\n"));
            }
            state.instruction = format!("{}\n\n{answers}", state.instruction);
            continue;
        }

        // Budget gate.
        if config.numerics.max_budget > 0
            && session::spent_tokens(&session_file) > config.numerics.max_budget
        {
            let keep_going = ctx
                .interaction
                .confirm(&format!(
                    "Session budget of {} tokens exceeded. Continue anyway?",
                    config.numerics.max_budget
                ))
                .await?;
            if !keep_going {
                finalize_turn(ctx, &mut session_file, user_text, &reply, &state)?;
                return Ok(outcome(reply, state));
            }
        }

        // Edit-claim detector: prose says files changed, changes[] is empty.
        if !options.plan
            && reply.changes.is_empty()
            && claims_file_edits(&reply.response)
            && !state.strict_change_retry_used
        {
            state.strict_change_retry_used = true;
            state.instruction = format!(
                "{}\n\n[SYSTEM CORRECTION]\nYour previous reply described file modifications \
                 but `changes` was empty. Reply again with concrete changes[] entries \
                 ({{\"file\",\"original\",\"edited\"}}); do not describe edits in prose.",
                state.instruction
            );
            continue;
        }

        // Code-first retry: a build instruction produced nothing actionable.
        if !options.plan
            && payload.build_intent
            && !reply.is_actionable()
            && !reply.wants_tools()
            && !state.code_first_retry_used
        {
            state.code_first_retry_used = true;
            state.instruction = format!(
                "{}\n\n[SYSTEM CORRECTION]\nThe instruction requires building something, \
                 but your reply contained no changes, commands, or questions. Produce \
                 actionable output now.",
                state.instruction
            );
            continue;
        }

        // Change synthesis from fenced code blocks.
        if !options.plan && reply.changes.is_empty() && claims_file_edits(&reply.response) {
            let synthesized = synthesize_changes(&reply.response);
            if !synthesized.is_empty() {
                info!("synthesized {} change(s) from fenced blocks", synthesized.len());
                reply.changes = synthesized;
            } else {
                debug!("edit claim without changes[]; giving up after strict retry");
            }
        }

        // Side effects (apply turns only).
        if !options.plan {
            state.applied_total += apply_changes(ctx, &config, &mut reply).await?;
            state.commands_total +=
                run_commands(ctx, &config, &reply, options.mission.is_some()).await?;
        }

        finalize_turn(ctx, &mut session_file, user_text, &reply, &state)?;
        return Ok(outcome(reply, state));
    }
}

fn outcome(reply: ModelReply, state: PassState) -> TurnOutcome {
    TurnOutcome {
        reply,
        applied_files: state.applied_total,
        commands_run: state.commands_total,
        tool_passes: state.tool_passes,
        ran_tools: state.ran_tools,
        usage: state.usage,
    }
}

/// State 4: compact the session before the call when it is close to the
/// provider's context window.
fn maybe_auto_compact(
    ctx: &RuntimeContext,
    config: &ConfigShape,
    context_window: u64,
    session_file: &mut SessionFile,
) -> Result<()> {
    let threshold_pct = config.numerics.auto_compact_threshold_pct;
    if threshold_pct == 0 || context_window == 0 {
        return Ok(());
    }
    let threshold = context_window * threshold_pct as u64 / 100;
    if session::session_tokens(session_file) < threshold {
        return Ok(());
    }
    if session::compact(
        session_file,
        config.numerics.auto_compact_keep_recent_turns,
        MAX_SUMMARY_ENTRIES,
    ) {
        info!("session auto-compacted");
        ctx.sessions.save(session_file)?;
    }
    Ok(())
}

/// States 6: provider call through stream recovery, feeding the observer.
async fn call_provider(
    ctx: &RuntimeContext,
    config: &ConfigShape,
    provider: &dyn crate::provider::ModelProvider,
    task_text: &str,
    continuation: Option<Value>,
) -> Result<(crate::provider::ProviderResponse, ObserverSnapshot, String)> {
    let observer = Arc::new(StdMutex::new(StreamObserver::default()));

    let throttle_observer = Arc::clone(&observer);
    let throttle_bus = Arc::clone(&ctx.bus);
    let throttle = Arc::new(RenderThrottle::new(
        config.numerics.stream_render_fps,
        move || {
            let preview = throttle_observer
                .lock()
                .ok()
                .and_then(|obs| obs.field("response").map(str::to_string))
                .unwrap_or_default();
            throttle_bus.emit(ExecutionEvent::new(
                EventPhase::Streaming,
                EventStatus::Progress,
                tail_chars(&preview, 400),
            ));
        },
    ));

    let stream_allowed = config.flags.stream && config.active().stream;
    let recovery = RecoveryOptions {
        stream_retry_count: config.numerics.stream_retry_count,
        stream_timeout_ms: config.numerics.stream_timeout_ms,
    };

    ctx.bus.emit(ExecutionEvent::new(
        EventPhase::Streaming,
        EventStatus::Start,
        "contacting provider",
    ));

    let (result, health) = call_with_recovery(recovery, |stream_enabled| {
        let observer = Arc::clone(&observer);
        let throttle = Arc::clone(&throttle);
        let continuation = continuation.clone();
        async move {
            if let Ok(mut obs) = observer.lock() {
                // Fresh observer per attempt; a failed stream must not
                // leak partial state into the next one.
                *obs = StreamObserver::default();
            }
            let on_chunk = move |chunk: &str| {
                if let Ok(mut obs) = observer.lock() {
                    obs.ingest(chunk);
                }
                throttle.request();
            };
            provider
                .call(
                    SYSTEM_PROMPT,
                    task_text,
                    ProviderCallOptions {
                        stream: stream_enabled && stream_allowed,
                        on_chunk: Some(&on_chunk),
                        continuation,
                    },
                )
                .await
        }
    })
    .await;

    throttle.force_flush();
    debug!(
        "provider call: attempts={} fallback={} throttled={}",
        health.attempts,
        health.fallback_used,
        throttle.throttled_renders()
    );

    let response = result?;
    let (snapshot, raw) = observer
        .lock()
        .map(|obs| (obs.snapshot(), obs.raw().to_string()))
        .unwrap_or_else(|_| {
            (
                ObserverSnapshot {
                    fields: BTreeMap::new(),
                    raw_tail: String::new(),
                    seen_schema_keys: Vec::new(),
                    seen_tool_keys: Vec::new(),
                },
                String::new(),
            )
        });
    ctx.bus.emit(ExecutionEvent::new(
        EventPhase::Streaming,
        EventStatus::End,
        "provider response received",
    ));
    Ok((response, snapshot, raw))
}

/// State 7: strict parse of the response text, strict parse of the stream
/// buffer, then lenient repair of both.
fn parse_response(text: &str, stream_raw: &str) -> Option<Value> {
    serde_json::from_str(text.trim())
        .ok()
        .or_else(|| serde_json::from_str(stream_raw.trim()).ok())
        .or_else(|| parse_lenient(text))
        .or_else(|| {
            if stream_raw.trim().is_empty() {
                None
            } else {
                parse_lenient(stream_raw)
            }
        })
        .filter(|value: &Value| value.is_object() || value.is_array())
}

/// State 8 tail: fill fields the parse missed from the streaming snapshot.
fn backfill_from_snapshot(reply: &mut ModelReply, snapshot: &ObserverSnapshot) {
    if reply.response.trim().is_empty()
        && let Some(response) = snapshot.fields.get("response")
    {
        reply.response = response.clone();
    }
    if reply.thought.is_none()
        && let Some(thought) = snapshot.fields.get("thought")
    {
        reply.thought = Some(thought.clone());
    }
    if reply.plan.is_none()
        && let Some(plan) = snapshot.fields.get("plan")
    {
        reply.plan = Some(pilot_protocol::PlanField::Text(plan.clone()));
    }
    if reply.self_critique.is_none()
        && let Some(critique) = snapshot.fields.get("self_critique")
    {
        reply.self_critique = Some(critique.clone());
    }
    if reply.ask_user_questions.is_empty()
        && let Some(question) = snapshot.fields.get("ask_user")
        && !question.trim().is_empty()
    {
        reply.ask_user_questions.push(question.clone());
    }
}

/// State 9: run every requested tool, independent ones concurrently, and
/// label the outputs.
async fn run_tools(
    ctx: &RuntimeContext,
    config: &ConfigShape,
    reply: &ModelReply,
) -> Result<BTreeMap<String, String>> {
    let mut results: BTreeMap<String, String> = BTreeMap::new();

    // request_files goes through the access policy first.
    if !reply.request_files.is_empty() {
        let paths: Vec<PathBuf> = reply.request_files.iter().map(PathBuf::from).collect();
        let outcome = ctx
            .ensure_session_access_for_paths(&paths, "read project files")
            .await?;
        let mut reads: Vec<(String, std::result::Result<String, String>)> = Vec::new();
        for path in &outcome.allowed {
            let display = path.to_string_lossy().into_owned();
            ctx.bus.emit(
                ExecutionEvent::new(EventPhase::ReadingFile, EventStatus::Start, display.as_str())
                    .with_file(display.as_str()),
            );
            reads.push((display.clone(), files::read_requested_file(&display)));
        }
        for path in &outcome.denied {
            reads.push((
                path.to_string_lossy().into_owned(),
                Err("File access denied by session policy.".to_string()),
            ));
        }
        results.insert("request_files".to_string(), files::format_file_results(&reads));
    }

    // Independent lookups fan out together.
    let web_search_fut = async {
        match &reply.web_search {
            Some(request) if config.flags.web_browsing_allowed => {
                ctx.bus.emit(ExecutionEvent::new(
                    EventPhase::SearchingWeb,
                    EventStatus::Start,
                    request.queries.join(", "),
                ));
                let citations = web::web_search(&ctx.http, request).await;
                Some(web::format_citations(&citations))
            }
            Some(_) => Some("Web access is disabled in the configuration.".to_string()),
            None => None,
        }
    };
    let web_browse_fut = async {
        if reply.web_browse.is_empty() {
            return None;
        }
        if !config.flags.web_browsing_allowed {
            return Some("Web access is disabled in the configuration.".to_string());
        }
        ctx.bus.emit(ExecutionEvent::new(
            EventPhase::SearchingWeb,
            EventStatus::Start,
            reply.web_browse.join(", "),
        ));
        Some(web::web_browse(&ctx.http, &reply.web_browse).await)
    };
    let search_fut = async {
        match &reply.search_project {
            Some(pattern) => {
                let root = ctx.cwd.clone();
                let pattern = pattern.clone();
                tokio::task::spawn_blocking(move || search::search_project(&root, &pattern))
                    .await
                    .ok()
            }
            None => None,
        }
    };
    let symbol_fut = async {
        match &reply.find_symbol {
            Some(request) => {
                let root = ctx.cwd.clone();
                let symbol = request.symbol.clone();
                let as_regex = request.regex;
                tokio::task::spawn_blocking(move || search::find_symbol(&root, &symbol, as_regex))
                    .await
                    .ok()
            }
            None => None,
        }
    };
    let map_fut = async {
        if !reply.detailed_map {
            return None;
        }
        let root = ctx.cwd.clone();
        tokio::task::spawn_blocking(move || search::detailed_map(&root, 200))
            .await
            .ok()
    };
    let index_fut = async {
        if !reply.index_project {
            return None;
        }
        let root = ctx.cwd.clone();
        tokio::task::spawn_blocking(move || search::index_project(&root))
            .await
            .ok()
    };
    let lint_fut = async {
        if !reply.lint_project {
            return None;
        }
        Some(run_lint(ctx, config).await)
    };

    let (web_search_out, web_browse_out, search_out, symbol_out, map_out, index_out, lint_out) = tokio::join!(
        web_search_fut,
        web_browse_fut,
        search_fut,
        symbol_fut,
        map_fut,
        index_fut,
        lint_fut
    );
    for (key, value) in [
        ("web_search", web_search_out),
        ("web_browse", web_browse_out),
        ("search_project", search_out),
        ("find_symbol", symbol_out),
        ("detailed_map", map_out),
        ("index_project", index_out),
        ("lint_project", lint_out),
    ] {
        if let Some(value) = value {
            results.insert(key.to_string(), value);
        }
    }

    // Terminal operations keep their request order.
    for request in &reply.terminal {
        let (key, outcome) = match request {
            TerminalRequest::Spawn { command } => (
                "terminal_spawn",
                ctx.terminals
                    .spawn(command, &ctx.cwd)
                    .await
                    .map(|id| format!("spawned terminal {id}")),
            ),
            TerminalRequest::Input { id, input } => (
                "terminal_input",
                ctx.terminals
                    .input(id, input)
                    .await
                    .map(|_| format!("wrote to terminal {id}")),
            ),
            TerminalRequest::Read { id } => ("terminal_read", ctx.terminals.read(id).await),
            TerminalRequest::Kill { id } => (
                "terminal_kill",
                ctx.terminals
                    .kill(id)
                    .await
                    .map(|_| format!("killed terminal {id}")),
            ),
        };
        let text = match outcome {
            Ok(text) => text,
            Err(error) => format!("[error] {error}"),
        };
        results
            .entry(key.to_string())
            .and_modify(|existing| {
                existing.push('\n');
                existing.push_str(&text);
            })
            .or_insert(text);
    }

    if let Some(call) = &reply.mcp_call {
        let output = if !config.flags.mcp_enabled {
            "MCP is disabled in the configuration.".to_string()
        } else {
            match config.mcp_servers.get(&call.server) {
                Some(server_config) => {
                    match mcp::mcp_call(&call.server, server_config, &call.tool, call.args.clone())
                        .await
                    {
                        Ok(result) => serde_json::to_string_pretty(&result)
                            .unwrap_or_else(|_| result.to_string()),
                        Err(error) => format!("[error] {error}"),
                    }
                }
                None => format!("[error] no MCP server named `{}` is configured", call.server),
            }
        };
        results.insert("mcp_call".to_string(), output);
    }

    Ok(results)
}

async fn run_lint(ctx: &RuntimeContext, config: &ConfigShape) -> String {
    if config.lint_command.trim().is_empty() {
        return "No lint command is configured.".to_string();
    }
    let record = ctx
        .runner
        .run(
            &config.lint_command,
            crate::command_runner::CommandOptions {
                cwd: ctx.cwd.clone(),
                timeout_ms: config.numerics.command_timeout_ms,
                log_enabled: config.flags.command_log_enabled,
                on_stdout: None,
                on_stderr: None,
            },
        )
        .await;
    if record.success {
        format!("Lint Passed\n{}", record.stdout)
    } else {
        format!("Lint Failed\n{}\n{}", record.stdout, record.stderr)
    }
}

enum LintVerdict {
    Continue,
    Recover,
    Abort,
}

/// State 10: detect lint cycles that are not making progress.
fn lint_guard_verdict(state: &mut PassState, lint_output: &str) -> LintVerdict {
    state.lint_depth += 1;
    let digest = hash_of(lint_output);
    let repeated_digest = state.last_lint_digest == Some(digest);
    let no_new_edits = state.lint_depth > 1 && state.applied_total == state.applied_at_last_lint;
    state.last_lint_digest = Some(digest);
    state.applied_at_last_lint = state.applied_total;

    let stuck =
        state.lint_depth > MAX_CONSECUTIVE_LINT_CYCLES || repeated_digest || no_new_edits;
    if !stuck {
        return LintVerdict::Continue;
    }
    if !state.lint_recovery_used {
        state.lint_recovery_used = true;
        return LintVerdict::Recover;
    }
    LintVerdict::Abort
}

fn hash_of(text: &str) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    text.hash(&mut hasher);
    hasher.finish()
}

/// Compact follow-up: the objective's first line plus truncated tool
/// outputs, never the full original prompt.
fn follow_up_instruction(user_text: &str, results: &BTreeMap<String, String>) -> String {
    let mut out = String::from(first_non_empty_line(user_text));
    out.push_str("\n\n[TOOL RESULTS]\n");
    for (key, value) in results {
        out.push_str(&format!(
            "--- {key} ---\n{}\n",
            crate::tools::truncate_for_model(value, TOOL_OUTPUT_CAP)
        ));
    }
    out.push_str("\nContinue with the objective using these results.");
    out
}

fn first_non_empty_line(text: &str) -> &str {
    text.lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or(text)
}

/// State 16: access gate, then the transactional apply with diff stats.
async fn apply_changes(
    ctx: &RuntimeContext,
    config: &ConfigShape,
    reply: &mut ModelReply,
) -> Result<usize> {
    if reply.changes.is_empty() {
        return Ok(0);
    }

    if config.flags.strict_edit_requires_full_access {
        let grant = ctx.access.lock().await;
        if grant.mode() != crate::access::AccessMode::Full {
            drop(grant);
            ctx.interaction.notify(
                "Edits rejected: strict edit mode requires a full access grant (/access full).",
            );
            reply.changes.clear();
            return Ok(0);
        }
    }

    let paths: Vec<PathBuf> = reply
        .changes
        .iter()
        .map(|change| resolve_path(&ctx.cwd, &change.file))
        .collect();
    let outcome = ctx
        .ensure_session_access_for_paths(&paths, "apply file edits")
        .await?;
    if !outcome.all_allowed() {
        let denied: std::collections::HashSet<PathBuf> = outcome.denied.iter().cloned().collect();
        reply.changes = reply
            .changes
            .iter()
            .filter(|change| !denied.contains(&resolve_path(&ctx.cwd, &change.file)))
            .cloned()
            .collect();
    }
    if reply.changes.is_empty() {
        return Ok(0);
    }

    let edits: Vec<pilot_apply::FileEdit> = reply
        .changes
        .iter()
        .map(|change| pilot_apply::FileEdit {
            path: resolve_path(&ctx.cwd, &change.file),
            original: change.original.clone(),
            edited: change.edited.clone(),
        })
        .collect();

    let bus = Arc::clone(&ctx.bus);
    let mut progress = |path: &Path, existed: bool, idx: usize, total: usize, phase| {
        let status = match phase {
            pilot_apply::ProgressPhase::Start => EventStatus::Start,
            pilot_apply::ProgressPhase::Done => EventStatus::Progress,
        };
        bus.emit(
            ExecutionEvent::new(
                EventPhase::WritingFile,
                status,
                format!(
                    "{} {} ({}/{total})",
                    if existed { "editing" } else { "creating" },
                    path.display(),
                    idx + 1,
                ),
            )
            .with_file(path.to_string_lossy()),
        );
    };

    let applied = {
        let mut applier = ctx.applier.lock().await;
        applier.apply(&edits, Some(&mut progress))
    };
    match applied {
        Ok(applied) => {
            ctx.diff_log.record(&diff_log::batch_stats(&applied));
            ctx.bus.emit(
                ExecutionEvent::new(
                    EventPhase::WritingFile,
                    EventStatus::End,
                    format!("applied {} file(s)", applied.len()),
                )
                .with_outcome(None, true),
            );
            Ok(applied.iter().filter(|file| !file.noop).count())
        }
        Err(err) => {
            ctx.bus.emit(ExecutionEvent::new(
                EventPhase::Error,
                EventStatus::End,
                format!("apply failed and was rolled back: {err}"),
            ));
            Err(err.into())
        }
    }
}

fn resolve_path(cwd: &Path, file: &str) -> PathBuf {
    let path = Path::new(file);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        cwd.join(path)
    }
}

/// State 17: run commands under the configured policy.
async fn run_commands(
    ctx: &RuntimeContext,
    config: &ConfigShape,
    reply: &ModelReply,
    mission_context: bool,
) -> Result<usize> {
    if reply.commands.is_empty() {
        return Ok(0);
    }
    if config.policies.run_policy == RunPolicy::Never && !mission_context {
        ctx.interaction
            .notify("Commands skipped: run_policy is `never`.");
        return Ok(0);
    }

    let mut ran = 0usize;
    for task_command in &reply.commands {
        let always = mission_context || config.policies.run_policy == RunPolicy::Always;
        if !always {
            let prompt = match &task_command.reason {
                Some(reason) => format!("Run `{}`? ({reason})", task_command.command),
                None => format!("Run `{}`?", task_command.command),
            };
            // Declining one command stops the rest of the sequence.
            if !ctx.interaction.confirm(&prompt).await? {
                ctx.interaction.notify("Remaining commands skipped.");
                break;
            }
        }
        let record = ctx
            .runner
            .run(
                &task_command.command,
                crate::command_runner::CommandOptions {
                    cwd: ctx.cwd.clone(),
                    timeout_ms: config.numerics.command_timeout_ms,
                    log_enabled: config.flags.command_log_enabled,
                    on_stdout: None,
                    on_stderr: None,
                },
            )
            .await;
        ran += 1;
        if !record.success {
            debug!(
                "command failed (exit {:?}): {}",
                record.exit_code, task_command.command
            );
        }
    }
    Ok(ran)
}

/// State 18: persist the turn and emit `finished`.
fn finalize_turn(
    ctx: &RuntimeContext,
    session_file: &mut SessionFile,
    user_text: &str,
    reply: &ModelReply,
    state: &PassState,
) -> Result<()> {
    session_file
        .session
        .push(SessionEntry::new(Role::User, user_text, 0));
    session_file.session.push(SessionEntry::new(
        Role::Assistant,
        reply.response.clone(),
        state.applied_total,
    ));
    ctx.sessions.save(session_file)?;
    ctx.bus.emit(
        ExecutionEvent::new(EventPhase::Finished, EventStatus::End, "turn complete")
            .with_outcome(None, true),
    );
    Ok(())
}

/// State 13 detector: the visible response claims edits with a file-shaped
/// token nearby.
pub(crate) fn claims_file_edits(response: &str) -> bool {
    static VERB: std::sync::LazyLock<Regex> = std::sync::LazyLock::new(|| {
        #[allow(clippy::unwrap_used)]
        let re = Regex::new(
            r"(?i)\b(created|modified|updated|saved|wrote|written|edited|added|renamed)\b",
        )
        .unwrap();
        re
    });
    static FILE_TOKEN: std::sync::LazyLock<Regex> = std::sync::LazyLock::new(|| {
        #[allow(clippy::unwrap_used)]
        let re = Regex::new(r"[A-Za-z0-9_./\\-]+\.[A-Za-z0-9]{1,8}\b").unwrap();
        re
    });
    VERB.is_match(response) && FILE_TOKEN.is_match(response)
}

/// State 15: rebuild changes[] from claimed paths and fenced code blocks.
/// Each claimed path takes the nearest preceding fenced block, falling back
/// to the nearest following one; a single claim with a single block pairs
/// directly.
pub(crate) fn synthesize_changes(response: &str) -> Vec<TaskChange> {
    let blocks = fenced_blocks(response);
    if blocks.is_empty() {
        return Vec::new();
    }

    static FILE_TOKEN: std::sync::LazyLock<Regex> = std::sync::LazyLock::new(|| {
        #[allow(clippy::unwrap_used)]
        let re = Regex::new(r"[A-Za-z0-9_][A-Za-z0-9_./\\-]*\.[A-Za-z0-9]{1,8}\b").unwrap();
        re
    });

    let mut claimed: Vec<(usize, String)> = Vec::new();
    let mut seen = std::collections::HashSet::new();
    for hit in FILE_TOKEN.find_iter(response) {
        if block_containing(&blocks, hit.start()).is_some() {
            continue;
        }
        let path = hit.as_str().to_string();
        if seen.insert(path.clone()) {
            claimed.push((hit.start(), path));
        }
    }

    if claimed.len() == 1 && blocks.len() == 1 {
        return vec![TaskChange {
            file: claimed.remove(0).1,
            original: String::new(),
            edited: blocks[0].content.clone(),
        }];
    }

    let mut changes = Vec::new();
    for (position, path) in claimed {
        let preceding = blocks
            .iter()
            .filter(|block| block.end <= position)
            .max_by_key(|block| block.end);
        let following = blocks
            .iter()
            .filter(|block| block.start >= position)
            .min_by_key(|block| block.start);
        if let Some(block) = preceding.or(following) {
            changes.push(TaskChange {
                file: path,
                original: String::new(),
                edited: block.content.clone(),
            });
        }
    }
    pilot_protocol::dedupe_changes(changes)
}

struct FencedBlock {
    start: usize,
    end: usize,
    content: String,
}

fn fenced_blocks(text: &str) -> Vec<FencedBlock> {
    let mut blocks = Vec::new();
    let mut cursor = 0;
    while let Some(open) = text[cursor..].find("```").map(|i| cursor + i) {
        // Skip the info string on the opening fence line.
        let Some(content_start) = text[open..].find('\n').map(|i| open + i + 1) else {
            break;
        };
        let Some(close) = text[content_start..].find("```").map(|i| content_start + i) else {
            break;
        };
        blocks.push(FencedBlock {
            start: open,
            end: close + 3,
            content: text[content_start..close].trim_end().to_string(),
        });
        cursor = close + 3;
    }
    blocks
}

fn block_containing(blocks: &[FencedBlock], position: usize) -> Option<usize> {
    blocks
        .iter()
        .position(|block| block.start <= position && position < block.end)
}

pub(crate) fn plan_text_of(reply: &ModelReply) -> String {
    reply
        .plan
        .as_ref()
        .map(|plan| plan.as_text())
        .filter(|text| !text.trim().is_empty())
        .unwrap_or_else(|| reply.response.clone())
}

/// Plan artifacts land under `<agent-home>/plans/`.
pub(crate) fn write_plan_artifact(ctx: &RuntimeContext, request: &str, reply: &ModelReply) -> Result<()> {
    let dir = ctx.home.join("plans");
    std::fs::create_dir_all(&dir)?;
    let stamp = chrono::Utc::now().format("%Y-%m-%dT%H-%M-%SZ");
    let path = dir.join(format!("plan-{stamp}.md"));

    let config = ctx.config_snapshot();
    let body = format!(
        "# Plan\n\n## Request\n\n{request}\n\n## Plan\n\n{}\n\n## Reasoning Notes\n\n{}\n\n## Execution Policy\n\nrun_policy: {:?}, strict_edit_requires_full_access: {}\n",
        plan_text_of(reply),
        reply.thought.as_deref().unwrap_or("(none)"),
        config.policies.run_policy,
        config.flags.strict_edit_requires_full_access,
    );
    std::fs::write(&path, body)?;
    info!("plan artifact written to {}", path.display());
    Ok(())
}

fn tail_chars(text: &str, n: usize) -> String {
    let count = text.chars().count();
    if count <= n {
        return text.to_string();
    }
    text.chars().skip(count - n).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn edit_claims_need_both_a_verb_and_a_file_token() {
        assert!(claims_file_edits("I created src/main.rs with the new entry point."));
        assert!(claims_file_edits("Updated the parser in lib/parse.ts."));
        assert!(!claims_file_edits("I created a plan for the next step."));
        assert!(!claims_file_edits("Look at src/main.rs for details."));
    }

    #[test]
    fn single_claim_single_block_pairs_directly() {
        let response = "I created hello.py:\n```python\nprint('hi')\n```";
        let changes = synthesize_changes(response);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].file, "hello.py");
        assert_eq!(changes[0].edited, "print('hi')");
        assert_eq!(changes[0].original, "");
    }

    #[test]
    fn paths_inside_code_blocks_are_not_claims() {
        let response = "Updated config.json:\n```json\n{\"path\": \"other.json\"}\n```";
        let changes = synthesize_changes(response);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].file, "config.json");
    }

    #[test]
    fn each_claim_takes_its_nearest_preceding_block() {
        let response = "\
```\ncontent a\n```\nsaved as a.txt\n```\ncontent b\n```\nsaved as b.txt";
        let changes = synthesize_changes(response);
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].file, "a.txt");
        assert_eq!(changes[0].edited, "content a");
        assert_eq!(changes[1].file, "b.txt");
        assert_eq!(changes[1].edited, "content b");
    }

    #[test]
    fn claim_before_every_block_falls_back_to_the_following_one() {
        let response = "Saved hello.sh below:\n```\necho hi\n```";
        let changes = synthesize_changes(response);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].file, "hello.sh");
        assert_eq!(changes[0].edited, "echo hi");
    }

    #[test]
    fn lint_guard_allows_first_cycles_then_recovers_then_aborts() {
        let mut state = PassState {
            instruction: String::new(),
            tool_passes: 0,
            strict_change_retry_used: false,
            code_first_retry_used: false,
            lint_recovery_used: false,
            lint_depth: 0,
            last_lint_digest: None,
            applied_at_last_lint: 0,
            applied_total: 0,
            commands_total: 0,
            ran_tools: false,
            usage: ProviderUsage::default(),
        };

        // First lint is always allowed.
        assert!(matches!(
            lint_guard_verdict(&mut state, "error A"),
            LintVerdict::Continue
        ));
        // Second with edits in between is allowed.
        state.applied_total = 2;
        assert!(matches!(
            lint_guard_verdict(&mut state, "error B"),
            LintVerdict::Continue
        ));
        // Identical output repeats: one-shot recovery.
        assert!(matches!(
            lint_guard_verdict(&mut state, "error B"),
            LintVerdict::Recover
        ));
        // Still stuck after recovery: abort.
        assert!(matches!(
            lint_guard_verdict(&mut state, "error C"),
            LintVerdict::Abort
        ));
    }

    #[test]
    fn follow_up_uses_only_the_first_objective_line() {
        let mut results = BTreeMap::new();
        results.insert("search_project".to_string(), "a.rs:1: hit".to_string());
        let text = follow_up_instruction("Fix the bug\n\nLong context here...", &results);
        assert!(text.starts_with("Fix the bug\n"));
        assert!(text.contains("--- search_project ---"));
        assert!(!text.contains("Long context here"));
    }

    #[test]
    fn parse_ladder_prefers_strict_then_repairs() {
        let value = parse_response(r#"{"response":"ok"}"#, "").expect("strict");
        assert_eq!(value["response"], "ok");

        let value = parse_response("prose first {\"response\": \"found\"}", "").expect("repair");
        assert_eq!(value["response"], "found");

        assert!(parse_response("nothing to find", "").is_none());
    }

    #[test]
    fn fenced_block_scanner_handles_info_strings() {
        let blocks = fenced_blocks("pre\n```rust\nfn x() {}\n```\npost");
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].content, "fn x() {}");
    }
}
