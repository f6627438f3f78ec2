//! Multi-step task processing.
//!
//! A task is a question the model works on over several turns of one chat.
//! Each iteration moves through the phases
//!
//! ```text
//! Planning → Executing → Evaluating ─┬→ Planning (next iteration)
//!                                    └→ Terminated
//! ```
//!
//! - **Planning** builds the prompt: the question, the todo list, every key
//!   finding so far, the last decision and, once history has been
//!   summarized, the running summary.
//! - **Executing** sends the prompt as a chat turn.
//! - **Evaluating** reads the reply: checklist items update the todo list,
//!   `Key Finding:` lines are added to the findings, and a `Final Answer:`
//!   ends the task. When a decision model is configured and the reply lists
//!   options, the decision model picks one for the next iteration.
//!
//! The loop stops at the first `Final Answer:` or after `max_iterations`. The
//! second case is not an error: the result carries the solution text
//! [`MAX_ITERATIONS_SOLUTION`].
//!
//! A failed iteration (for example a completion that errored after all
//! retries) is noted in the transcript and the loop moves on. Only failing to
//! set up the chat aborts the task.
//!
//! # Examples
//!
//! ```rust,no_run
//! use webui_chat::{Client, TaskEvent, TaskOptions};
//! use futures::StreamExt;
//!
//! # async fn example(client: Client) {
//! let options = TaskOptions::new("Plan a three-day trip to Lisbon", "Lisbon trip")
//!     .max_iterations(5);
//!
//! let mut events = client.stream_process_task(options);
//! while let Some(event) = events.next().await {
//!     match event {
//!         TaskEvent::Content { text } => print!("{}", text),
//!         TaskEvent::Complete { result } => println!("\n{}", result.solution),
//!         TaskEvent::Error { message } => eprintln!("{}", message),
//!         _ => {}
//!     }
//! }
//! # }
//! ```

use crate::client::{Client, History};
use crate::context::{
    ConversationTurn, is_approaching_limit, render_transcript, truncate_turns,
};
use crate::session::{ChatSession, MessageRole};
use crate::types::{CompletionMessage, FileRef, ModelSelector};
use crate::{Error, Result};
use futures::stream::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::pin::Pin;

/// Literal that ends a task; the solution is the text after it.
pub const TERMINAL_MARKER: &str = "Final Answer:";

/// Solution reported when the iteration budget runs out.
pub const MAX_ITERATIONS_SOLUTION: &str = "Max iterations reached.";

/// Turns kept verbatim after the history is summarized
const TURNS_KEPT_AFTER_SUMMARY: usize = 2;

/// Boxed stream of task events.
pub type TaskEventStream = Pin<Box<dyn Stream<Item = TaskEvent> + Send>>;

/// Options for [`Client::process_task`] and [`Client::stream_process_task`]
#[derive(Debug, Clone)]
pub struct TaskOptions {
    pub question: String,
    pub chat_title: String,
    /// Model working on the task; the client's default model when `None`
    pub model: Option<String>,
    pub max_iterations: u32,
    /// Model that picks between options the main model presents
    pub decision_model_id: Option<String>,
    /// Replace older turns with a running summary once they grow too large
    pub summarize_history: bool,
    /// Estimated token size of the history sent with a completion (the chat
    /// branch, or the turns since the last summary) that triggers a summary
    pub summary_threshold_tokens: usize,
    pub tool_ids: Vec<String>,
    /// Knowledge base names attached to every iteration
    pub knowledge_bases: Vec<String>,
}

impl TaskOptions {
    pub fn new(question: impl Into<String>, chat_title: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            chat_title: chat_title.into(),
            model: None,
            max_iterations: 10,
            decision_model_id: None,
            summarize_history: false,
            summary_threshold_tokens: 4000,
            tool_ids: Vec::new(),
            knowledge_bases: Vec::new(),
        }
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn max_iterations(mut self, iterations: u32) -> Self {
        self.max_iterations = iterations;
        self
    }

    pub fn decision_model(mut self, model: impl Into<String>) -> Self {
        self.decision_model_id = Some(model.into());
        self
    }

    pub fn summarize_history(mut self, enabled: bool) -> Self {
        self.summarize_history = enabled;
        self
    }

    pub fn summary_threshold_tokens(mut self, tokens: usize) -> Self {
        self.summary_threshold_tokens = tokens;
        self
    }

    pub fn tool_id(mut self, id: impl Into<String>) -> Self {
        self.tool_ids.push(id.into());
        self
    }

    pub fn knowledge_base(mut self, name: impl Into<String>) -> Self {
        self.knowledge_bases.push(name.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    Pending,
    InProgress,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TodoItem {
    pub task: String,
    pub status: TodoStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskPhase {
    Planning,
    Executing,
    Evaluating,
    Terminated,
}

/// Working state of a task, mutated once per iteration.
#[derive(Debug, Clone)]
pub struct TaskState {
    pub question: String,
    pub todo_list: Vec<TodoItem>,
    /// Facts found so far, in discovery order
    pub key_findings: Vec<String>,
    pub iteration: u32,
    pub phase: TaskPhase,
    /// Running summary that stands in for turns older than `recent`
    pub summary: Option<String>,
    pub solution: Option<String>,
    /// Decision picked for the previous iteration's options
    pub last_decision: Option<String>,
    history: Vec<ConversationTurn>,
    recent: Vec<ConversationTurn>,
}

impl TaskState {
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            todo_list: Vec::new(),
            key_findings: Vec::new(),
            iteration: 0,
            phase: TaskPhase::Planning,
            summary: None,
            solution: None,
            last_decision: None,
            history: Vec::new(),
            recent: Vec::new(),
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.phase == TaskPhase::Terminated
    }

    /// Full transcript of the task.
    pub fn history(&self) -> &[ConversationTurn] {
        &self.history
    }

    fn transition(&mut self, phase: TaskPhase) {
        log::debug!(
            "Task iteration {}: {:?} -> {:?}",
            self.iteration,
            self.phase,
            phase
        );
        self.phase = phase;
    }

    fn begin_iteration(&mut self, iteration: u32) {
        self.iteration = iteration;
        self.transition(TaskPhase::Planning);
    }

    fn record(&mut self, turn: ConversationTurn) {
        self.recent.push(turn.clone());
        self.history.push(turn);
    }

    /// Folds a model reply into the state. Returns true when the reply
    /// carries the terminal marker.
    pub fn absorb_reply(&mut self, reply: &str) -> bool {
        let todos = parse_todo_list(reply);
        if !todos.is_empty() {
            self.todo_list = todos;
        }

        for finding in parse_key_findings(reply) {
            if !self.key_findings.contains(&finding) {
                self.key_findings.push(finding);
            }
        }

        match extract_final_answer(reply) {
            Some(solution) => {
                self.solution = Some(solution);
                self.transition(TaskPhase::Terminated);
                true
            }
            None => false,
        }
    }

    fn into_result(self, chat_id: String) -> TaskResult {
        TaskResult {
            solution: self
                .solution
                .unwrap_or_else(|| MAX_ITERATIONS_SOLUTION.to_string()),
            todo_list: self.todo_list,
            conversation_history: self.history,
            key_findings: self.key_findings,
            iterations: self.iteration,
            chat_id,
        }
    }
}

/// Outcome of a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    /// Text after `Final Answer:`, or [`MAX_ITERATIONS_SOLUTION`]
    pub solution: String,
    pub todo_list: Vec<TodoItem>,
    pub conversation_history: Vec<ConversationTurn>,
    pub key_findings: Vec<String>,
    pub iterations: u32,
    pub chat_id: String,
}

impl TaskResult {
    /// False when the task stopped because it ran out of iterations.
    pub fn is_solved(&self) -> bool {
        self.solution != MAX_ITERATIONS_SOLUTION
    }
}

/// Progress of a streamed task.
///
/// Per iteration: one `IterationStart`, zero or more `Content`, one
/// `IterationComplete`. The stream ends with exactly one `Complete` or
/// `Error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEvent {
    IterationStart { iteration: u32, total_iterations: u32 },
    Content { text: String },
    IterationComplete { iteration: u32, is_final: bool },
    Complete { result: TaskResult },
    Error { message: String },
}

impl TaskEvent {
    /// True for `Complete` and `Error`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskEvent::Complete { .. } | TaskEvent::Error { .. })
    }
}

/// Drives the task loop on top of a [`Client`].
pub struct TaskOrchestrator {
    client: Client,
    options: TaskOptions,
}

/// Chat, model and attachments a task runs with
struct TaskSetup {
    session: ChatSession,
    model: String,
    files: Vec<FileRef>,
}

impl TaskOrchestrator {
    pub fn new(client: Client, options: TaskOptions) -> Self {
        Self { client, options }
    }

    /// Runs the task and returns its result.
    ///
    /// # Errors
    ///
    /// Only setup failures: invalid options, an unknown knowledge base lookup
    /// failing, or the chat not being found or created.
    pub async fn run(self) -> Result<TaskResult> {
        let TaskSetup {
            mut session,
            model,
            files,
        } = self.setup().await?;
        let mut state = TaskState::new(self.options.question.clone());

        for iteration in 1..=self.options.max_iterations {
            state.begin_iteration(iteration);
            self.maybe_summarize(&mut state, &session, &model).await;

            let prompt = self.build_prompt(&state);
            let history = self.history(&state);
            state.record(ConversationTurn::user(prompt.clone()));
            state.transition(TaskPhase::Executing);

            let outcome = self
                .client
                .run_turn(
                    &mut session,
                    &prompt,
                    &model,
                    history,
                    &files,
                    &self.options.tool_ids,
                )
                .await;

            match outcome {
                Ok(reply) => {
                    if self.evaluate(&mut state, &reply.response).await {
                        break;
                    }
                }
                Err(e) => record_failure(&mut state, &e),
            }
        }

        log_outcome(&state);
        Ok(state.into_result(session.id))
    }

    /// Runs the task, yielding [`TaskEvent`]s as it goes.
    pub fn stream(self) -> TaskEventStream {
        Box::pin(async_stream::stream! {
            let TaskSetup { mut session, model, files } = match self.setup().await {
                Ok(setup) => setup,
                Err(e) => {
                    yield TaskEvent::Error { message: e.to_string() };
                    return;
                }
            };
            let total_iterations = self.options.max_iterations;
            let mut state = TaskState::new(self.options.question.clone());

            for iteration in 1..=total_iterations {
                yield TaskEvent::IterationStart { iteration, total_iterations };

                state.begin_iteration(iteration);
                self.maybe_summarize(&mut state, &session, &model).await;

                let prompt = self.build_prompt(&state);
                let history = self.history(&state);
                state.record(ConversationTurn::user(prompt.clone()));
                state.transition(TaskPhase::Executing);

                let mut is_final = false;
                let started = self
                    .client
                    .start_stream_turn(&mut session, &prompt, &model, history, &files, &self.options.tool_ids)
                    .await;

                match started {
                    Ok((mut writer, mut fragments)) => {
                        let mut failure = None;
                        while let Some(item) = fragments.next().await {
                            match item {
                                Ok(text) => {
                                    writer.push(self.client.synchronizer(), &mut session, &text).await;
                                    yield TaskEvent::Content { text };
                                }
                                Err(e) => {
                                    failure = Some(e);
                                    break;
                                }
                            }
                        }
                        let reply = writer.finish(self.client.synchronizer(), &mut session).await;
                        match failure {
                            None => is_final = self.evaluate(&mut state, &reply).await,
                            Some(e) => record_failure(&mut state, &e),
                        }
                    }
                    Err(e) => record_failure(&mut state, &e),
                }

                yield TaskEvent::IterationComplete { iteration, is_final };
                if is_final {
                    break;
                }
            }

            log_outcome(&state);
            yield TaskEvent::Complete { result: state.into_result(session.id) };
        })
    }

    async fn setup(&self) -> Result<TaskSetup> {
        if self.options.question.trim().is_empty() {
            return Err(Error::invalid_input("task question is empty"));
        }
        if self.options.max_iterations == 0 {
            return Err(Error::invalid_input("max_iterations must be at least 1"));
        }

        let model = self
            .options
            .model
            .clone()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| self.client.options().default_model().to_string());
        let files = self
            .client
            .knowledge_base_refs(&self.options.knowledge_bases)
            .await?;
        let session = self
            .client
            .open_session(&self.options.chat_title, &ModelSelector::Single(model.clone()))
            .await?;

        log::info!(
            "Starting task in chat {} with {} (up to {} iterations)",
            session.id,
            model,
            self.options.max_iterations
        );
        Ok(TaskSetup {
            session,
            model,
            files,
        })
    }

    fn build_prompt(&self, state: &TaskState) -> String {
        let mut prompt = format!("Task: {}\n", state.question);

        if let Some(summary) = &state.summary {
            prompt.push_str(&format!("\nSummary of progress so far:\n{}\n", summary));
        }

        if state.todo_list.is_empty() {
            prompt.push_str(
                "\nStart by writing a plan as a markdown checklist (\"- [ ] step\").\n",
            );
        } else {
            prompt.push_str("\nTodo list:\n");
            for item in &state.todo_list {
                let mark = match item.status {
                    TodoStatus::Pending => ' ',
                    TodoStatus::InProgress => '~',
                    TodoStatus::Completed => 'x',
                };
                prompt.push_str(&format!("- [{}] {}\n", mark, item.task));
            }
        }

        if !state.key_findings.is_empty() {
            prompt.push_str("\nKey findings so far:\n");
            for finding in &state.key_findings {
                prompt.push_str(&format!("- {}\n", finding));
            }
        }

        if let Some(decision) = &state.last_decision {
            prompt.push_str(&format!("\nChosen option: {}\n", decision));
        }

        prompt.push_str(&format!(
            "\nIteration {} of {}. Work on the next open item and repeat the checklist with \
             updated marks ([ ] pending, [~] in progress, [x] done). Put each new fact on its own \
             line starting with \"Key Finding:\". If there are alternatives to choose from, list \
             them under \"Options:\" as \"Option 1: ...\". When the task is solved, write \
             \"{}\" followed by the solution.",
            state.iteration, self.options.max_iterations, TERMINAL_MARKER
        ));
        prompt
    }

    /// Server branch by default; summary-backed recent turns once summarized.
    fn history(&self, state: &TaskState) -> History {
        if state.summary.is_none() {
            return History::Branch;
        }
        History::Detached(
            state
                .recent
                .iter()
                .map(|turn| CompletionMessage::new(turn.role.as_str(), turn.content.clone()))
                .collect(),
        )
    }

    /// Summarizes the history the next completion would carry once it grows
    /// past the threshold: the whole chat branch (earlier runs under the same
    /// title included) until the first summary, the recent turns after it.
    async fn maybe_summarize(&self, state: &mut TaskState, session: &ChatSession, model: &str) {
        if !self.options.summarize_history {
            return;
        }
        let pending = match state.summary {
            Some(_) => state.recent.clone(),
            None => session.branch_turns(),
        };
        if !is_approaching_limit(&pending, self.options.summary_threshold_tokens, 1.0) {
            return;
        }

        let transcript = render_transcript(&pending);
        let content = match &state.summary {
            Some(previous) => format!(
                "Earlier summary:\n{}\n\nConversation since then:\n{}",
                previous, transcript
            ),
            None => transcript,
        };
        let messages = vec![
            CompletionMessage::new(
                MessageRole::System.as_str(),
                format!(
                    "Summarize the progress on this task: {}. Keep every fact, decision and \
                     open step needed to continue.",
                    state.question
                ),
            ),
            CompletionMessage::new(MessageRole::User.as_str(), content),
        ];

        match self.client.complete_detached(model, messages).await {
            Ok(summary) => {
                log::info!(
                    "Summarized {} turns at iteration {}",
                    pending.len(),
                    state.iteration
                );
                state.summary = Some(summary.trim().to_string());
                state.recent = truncate_turns(&pending, TURNS_KEPT_AFTER_SUMMARY, false);
            }
            Err(e) => log::warn!("History summary failed, keeping full history: {}", e),
        }
    }

    /// Evaluating phase. Returns true when the task is finished.
    async fn evaluate(&self, state: &mut TaskState, reply: &str) -> bool {
        state.transition(TaskPhase::Evaluating);
        state.record(ConversationTurn::assistant(reply));
        state.last_decision = None;

        if state.absorb_reply(reply) {
            return true;
        }

        if let Some(choice) = self.decide(state, reply).await {
            state.record(ConversationTurn::system(format!("Decision: {}", choice)));
            state.last_decision = Some(choice);
        }
        false
    }

    /// Asks the decision model to pick one of the options in `reply`.
    async fn decide(&self, state: &TaskState, reply: &str) -> Option<String> {
        let decision_model = self.options.decision_model_id.as_deref()?;
        let options = parse_options(reply);
        if options.len() < 2 {
            return None;
        }

        let listing = options
            .iter()
            .enumerate()
            .map(|(i, option)| format!("{}. {}", i + 1, option))
            .collect::<Vec<_>>()
            .join("\n");
        let findings = if state.key_findings.is_empty() {
            "none".to_string()
        } else {
            state.key_findings.join("; ")
        };
        let messages = vec![
            CompletionMessage::new(
                MessageRole::System.as_str(),
                "You choose the best option for an ongoing task. Reply with the option number only.",
            ),
            CompletionMessage::new(
                MessageRole::User.as_str(),
                format!(
                    "Task: {}\nKey findings: {}\n\nOptions:\n{}",
                    state.question, findings, listing
                ),
            ),
        ];

        let answer = match self.client.complete_detached(decision_model, messages).await {
            Ok(answer) => answer,
            Err(e) => {
                log::warn!("Decision model {} failed: {}", decision_model, e);
                return None;
            }
        };

        let picked = first_number(&answer)
            .and_then(|n| n.checked_sub(1))
            .and_then(|index| options.get(index));
        match picked {
            Some(option) => {
                log::debug!("Decision model picked: {}", option);
                Some(option.clone())
            }
            None => {
                log::warn!("Decision model answer '{}' names no listed option", answer.trim());
                None
            }
        }
    }
}

fn record_failure(state: &mut TaskState, error: &Error) {
    log::warn!("Task iteration {} failed: {}", state.iteration, error);
    state.record(ConversationTurn::system(format!(
        "Iteration {} failed: {}",
        state.iteration, error
    )));
}

fn log_outcome(state: &TaskState) {
    if state.is_terminated() {
        log::info!("Task finished after {} iterations", state.iteration);
    } else {
        log::info!("Task stopped after {} iterations without an answer", state.iteration);
    }
}

/// Text after the first `Final Answer:`, trimmed.
pub fn extract_final_answer(text: &str) -> Option<String> {
    text.find(TERMINAL_MARKER)
        .map(|start| text[start + TERMINAL_MARKER.len()..].trim().to_string())
}

/// Markdown checklist items: `- [ ]` pending, `- [~]` or `- [-]` in
/// progress, `- [x]` completed.
pub fn parse_todo_list(text: &str) -> Vec<TodoItem> {
    text.lines()
        .filter_map(|line| {
            let line = line.trim_start();
            let rest = line
                .strip_prefix("- [")
                .or_else(|| line.strip_prefix("* ["))?;
            let mut chars = rest.chars();
            let status = match chars.next()? {
                ' ' => TodoStatus::Pending,
                '~' | '-' => TodoStatus::InProgress,
                'x' | 'X' => TodoStatus::Completed,
                _ => return None,
            };
            let task = chars.as_str().strip_prefix(']')?.trim();
            if task.is_empty() {
                return None;
            }
            Some(TodoItem {
                task: task.to_string(),
                status,
            })
        })
        .collect()
}

/// `Key Finding: ...` lines and bullets under a `Key Findings:` header.
pub fn parse_key_findings(text: &str) -> Vec<String> {
    let mut findings = Vec::new();
    let mut in_section = false;

    for raw in text.lines() {
        let line = raw.trim();
        let bare = line.trim_start_matches(['-', '*', ' ']);

        if let Some(rest) = strip_prefix_ignore_case(bare, "key finding:") {
            push_finding(&mut findings, rest);
            in_section = false;
            continue;
        }

        if header_name(line) == "key findings" {
            in_section = true;
            continue;
        }

        if in_section {
            match line.strip_prefix("- ").or_else(|| line.strip_prefix("* ")) {
                Some(item) => push_finding(&mut findings, item),
                None => in_section = false,
            }
        }
    }

    findings
}

fn push_finding(findings: &mut Vec<String>, text: &str) {
    let text = text.trim_start_matches('*').trim();
    if !text.is_empty() && !findings.iter().any(|f| f == text) {
        findings.push(text.to_string());
    }
}

/// Alternatives listed under an `Options:` header, as `Option N: ...` or
/// `N. ...` lines.
pub fn parse_options(text: &str) -> Vec<String> {
    let mut options = Vec::new();
    let mut in_section = false;

    for raw in text.lines() {
        let line = raw.trim();
        if !in_section {
            in_section = header_name(line) == "options";
            continue;
        }
        if line.is_empty() {
            if options.is_empty() {
                continue;
            }
            break;
        }
        match option_text(line) {
            Some(option) => options.push(option),
            None => break,
        }
    }

    options
}

fn option_text(line: &str) -> Option<String> {
    let line = line.trim_start_matches(['-', '*']).trim();
    let numbered = strip_prefix_ignore_case(line, "option ").unwrap_or(line);
    let rest = numbered.trim_start_matches(|c: char| c.is_ascii_digit());
    if rest.len() == numbered.len() {
        return None;
    }
    let rest = rest
        .strip_prefix(':')
        .or_else(|| rest.strip_prefix('.'))
        .or_else(|| rest.strip_prefix(')'))?;
    let rest = rest.trim_start_matches('*').trim();
    if rest.is_empty() {
        None
    } else {
        Some(rest.to_string())
    }
}

/// Lowercased heading text without markdown decoration or a trailing colon.
fn header_name(line: &str) -> String {
    line.trim_start_matches('#')
        .trim()
        .trim_matches('*')
        .trim()
        .trim_end_matches(':')
        .trim()
        .to_ascii_lowercase()
}

fn strip_prefix_ignore_case<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    if text.len() >= prefix.len()
        && text.is_char_boundary(prefix.len())
        && text[..prefix.len()].eq_ignore_ascii_case(prefix)
    {
        Some(&text[prefix.len()..])
    } else {
        None
    }
}

fn first_number(text: &str) -> Option<usize> {
    text.split(|c: char| !c.is_ascii_digit())
        .find(|part| !part.is_empty())?
        .parse()
        .ok()
}
