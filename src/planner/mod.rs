//! 规划层：可插拔的决策策略
//!
//! Planner 只有 plan / replan 两个方法：读 PlannerState，返回下一批 Action。
//! 策略通过 PlannerRegistry 按名称注册与创建，引擎其它部分无需改动。
//! 这里还放着各策略共用的提示词拼装与 LLM 输出解析。

pub mod evaluator;
pub mod react;
pub mod registry;
pub mod tree_search;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use schemars::{schema_for, JsonSchema};
use serde::Deserialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::config::{ReactSection, TreeSearchSection};
use crate::core::{Action, CallId, EngineError, Metadata, PlannerState, ToolCall};
use crate::handoff;
use crate::llm::{LlmClient, LlmReply, ToolCallRequest};
use crate::memory::{LongTermMemory, Message};

pub use evaluator::{BranchEvaluator, FnBranchEvaluator, LlmBranchEvaluator};
pub use react::ReActPlanner;
pub use registry::{PlannerFactory, PlannerRegistry};
pub use tree_search::{Branch, TreeSearchPlanner};

/// 一次规划的结果：动作 + 可选的策略私有元数据（Some 时整体替换 state.metadata）
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Plan {
    pub actions: Vec<Action>,
    pub metadata: Option<Metadata>,
}

impl Plan {
    pub fn single(action: Action) -> Self {
        Self {
            actions: vec![action],
            metadata: None,
        }
    }

    pub fn batch(actions: Vec<Action>) -> Self {
        Self {
            actions,
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

#[async_trait]
pub trait Planner: Send + Sync {
    fn name(&self) -> &str;

    /// 首轮（或交接后首轮）
    async fn plan(&self, cancel: &CancellationToken, state: &PlannerState) -> Result<Plan, EngineError>;

    /// 后续各轮：state 已包含最新的 Observation
    async fn replan(&self, cancel: &CancellationToken, state: &PlannerState) -> Result<Plan, EngineError>;
}

/// 创建 Planner 所需的协作者与参数
#[derive(Clone)]
pub struct PlannerConfig {
    pub llm: Arc<dyn LlmClient>,
    /// TreeSearch 的评分器；未设置时用 LlmBranchEvaluator
    pub evaluator: Option<Arc<dyn BranchEvaluator>>,
    pub memory: Option<Arc<dyn LongTermMemory>>,
    pub system_prompt: String,
    pub react: ReactSection,
    pub tree_search: TreeSearchSection,
    /// 自定义策略的额外参数
    pub extra: HashMap<String, Value>,
}

impl std::fmt::Debug for PlannerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlannerConfig")
            .field("system_prompt", &self.system_prompt)
            .field("react", &self.react)
            .field("tree_search", &self.tree_search)
            .field("evaluator", &self.evaluator.is_some())
            .field("memory", &self.memory.is_some())
            .finish_non_exhaustive()
    }
}

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are an autonomous agent. Use the available tools when they help. \
To call a tool, reply with exactly one JSON object {\"tool\": \"name\", \"args\": {...}}. \
When you know the answer, reply with plain text starting with \"Final Answer:\".";

impl PlannerConfig {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self {
            llm,
            evaluator: None,
            memory: None,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            react: ReactSection::default(),
            tree_search: TreeSearchSection::default(),
            extra: HashMap::new(),
        }
    }

    pub fn with_evaluator(mut self, evaluator: Arc<dyn BranchEvaluator>) -> Self {
        self.evaluator = Some(evaluator);
        self
    }

    pub fn with_memory(mut self, memory: Arc<dyn LongTermMemory>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_react(mut self, react: ReactSection) -> Self {
        self.react = react;
        self
    }

    pub fn with_tree_search(mut self, tree_search: TreeSearchSection) -> Self {
        self.tree_search = tree_search;
        self
    }
}

/// 文本协议的 JSON Schema，由解析用的结构体派生
pub fn command_schema_json() -> String {
    serde_json::to_string_pretty(&schema_for!(TextCommand)).unwrap_or_default()
}

/// System 消息：人设 + 基础提示词；有可用工具时附上指令格式
pub(crate) fn system_message(state: &PlannerState, base: &str) -> Message {
    let persona = &state.persona;
    let mut text = String::new();
    if !persona.name.is_empty() {
        text.push_str(&format!("You are {}.\n", persona.name));
    }
    if !persona.instructions.is_empty() {
        text.push_str(&persona.instructions);
        text.push('\n');
    }
    text.push_str(base);
    if !state.tools.is_empty() {
        text.push_str("\nCommand format (JSON Schema):\n");
        text.push_str(&command_schema_json());
    }
    Message::system(text)
}

/// 完整提示：System + 对话（含未折叠的 Observation）
pub(crate) fn prompt_messages(state: &PlannerState, base: &str) -> Vec<Message> {
    let conversation = state.conversation();
    let mut messages = Vec::with_capacity(conversation.len() + 1);
    messages.push(system_message(state, base));
    messages.extend(conversation);
    messages
}

pub(crate) fn new_call_id() -> CallId {
    format!("call_{}", uuid::Uuid::new_v4().simple())
}

/// 工具调用转为 Action；交接工具转为 Handoff
pub(crate) fn tool_action(id: &str, name: &str, args: Value, depends_on: Vec<CallId>) -> Action {
    if let Some(target) = handoff::handoff_target(name) {
        let message = args
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or_default();
        return Action::handoff(target, message);
    }
    let id = if id.is_empty() { new_call_id() } else { id.to_string() };
    let args = if args.is_null() { Value::Object(Default::default()) } else { args };
    Action::ToolCall(ToolCall::new(id, name, args).depends_on(depends_on))
}

fn request_action(req: &ToolCallRequest) -> Action {
    tool_action(&req.id, &req.name, req.arguments.clone(), req.depends_on.clone())
}

/// 文本协议中的一条指令
#[derive(Debug, Deserialize, JsonSchema)]
struct TextCommand {
    /// Tool name, one of the available tools
    #[serde(default)]
    tool: String,
    /// Tool arguments, matching the tool's parameter schema
    #[serde(default)]
    args: Value,
    /// Optional call id, referenced by depends_on of later calls in the same batch
    #[serde(default)]
    id: String,
    #[serde(default)]
    depends_on: Vec<CallId>,
    /// Text shown to the user without ending the run
    #[serde(default)]
    respond: Option<String>,
    /// Final answer; ends the run
    #[serde(default, alias = "final_answer")]
    finish: Option<String>,
}

impl TextCommand {
    fn into_action(self) -> Option<Action> {
        if !self.tool.is_empty() {
            return Some(tool_action(&self.id, &self.tool, self.args, self.depends_on));
        }
        if let Some(text) = self.finish {
            return Some(Action::Finish(text));
        }
        self.respond.map(Action::Respond)
    }
}

fn strip_final_answer(text: &str) -> Option<&str> {
    let trimmed = text.trim();
    let prefix = "final answer:";
    if trimmed.len() >= prefix.len()
        && trimmed.is_char_boundary(prefix.len())
        && trimmed[..prefix.len()].eq_ignore_ascii_case(prefix)
    {
        Some(trimmed[prefix.len()..].trim())
    } else {
        None
    }
}

/// 提取 ```json 块或首尾花括号之间的内容；看起来不像 JSON 时返回 None
fn extract_json(trimmed: &str) -> Option<&str> {
    if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        return Some(rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim()));
    }
    let looks_structured = trimmed.starts_with('{')
        || trimmed.starts_with('[')
        || trimmed.contains("\"tool\"");
    if !looks_structured {
        return None;
    }
    let (open, close) = if trimmed.starts_with('[') { ('[', ']') } else { ('{', '}') };
    let start = trimmed.find(open)?;
    match trimmed.rfind(close) {
        Some(end) if end > start => Some(&trimmed[start..=end]),
        // 未闭合：交给 serde 报错
        _ => Some(&trimmed[start..]),
    }
}

/// 解析 LLM 文本输出为单个 Action
///
/// - `Final Answer: ...` 或不含 JSON 的纯文本 → Finish
/// - `{"tool": "...", "args": {...}}` → ToolCall（交接工具 → Handoff）
/// - `{"respond": "..."}` → Respond，`{"finish": "..."}` → Finish
///
/// JSON 无法解析时返回 Err(原始片段)，由调用方决定是否重试。
pub fn parse_llm_output(output: &str) -> Result<Action, String> {
    let trimmed = output.trim();
    if let Some(answer) = strip_final_answer(trimmed) {
        return Ok(Action::Finish(answer.to_string()));
    }
    let Some(json_str) = extract_json(trimmed) else {
        return Ok(Action::Finish(trimmed.to_string()));
    };
    let command: TextCommand =
        serde_json::from_str(json_str).map_err(|e| format!("{}: {}", e, json_str))?;
    Ok(command
        .into_action()
        .unwrap_or_else(|| Action::Finish(trimmed.to_string())))
}

/// 回复中的第一个动作：优先原生工具调用，否则解析文本
pub(crate) fn first_action(reply: &LlmReply) -> Result<Action, String> {
    match reply.tool_calls.first() {
        Some(req) => Ok(request_action(req)),
        None => parse_llm_output(&reply.text),
    }
}

/// 解析一条候选分支：原生工具调用为一步；文本可以是指令数组（每个元素一步）或单条指令
pub(crate) fn parse_steps(reply: &LlmReply) -> Result<Vec<Vec<Action>>, String> {
    if !reply.tool_calls.is_empty() {
        return Ok(vec![reply.tool_calls.iter().map(request_action).collect()]);
    }
    let trimmed = reply.text.trim();
    if let Some(json_str) = extract_json(trimmed).filter(|s| s.starts_with('[')) {
        let commands: Vec<TextCommand> =
            serde_json::from_str(json_str).map_err(|e| format!("{}: {}", e, json_str))?;
        let steps: Vec<Vec<Action>> = commands
            .into_iter()
            .filter_map(TextCommand::into_action)
            .map(|a| vec![a])
            .collect();
        return Ok(steps);
    }
    parse_llm_output(trimmed).map(|a| vec![vec![a]])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Persona;
    use serde_json::json;

    #[test]
    fn test_parse_tool_call_json() {
        let action = parse_llm_output(r#"{"tool": "add", "args": {"a": 2, "b": 3}}"#).unwrap();
        match action {
            Action::ToolCall(tc) => {
                assert_eq!(tc.name, "add");
                assert_eq!(tc.input, json!({"a": 2, "b": 3}));
                assert!(tc.id.starts_with("call_"));
            }
            other => panic!("expected tool call, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_fenced_json_with_prose() {
        let out = "I'll look it up.\n```json\n{\"tool\": \"echo\", \"args\": {\"text\": \"x\"}}\n```";
        assert!(matches!(parse_llm_output(out).unwrap(), Action::ToolCall(_)));
    }

    #[test]
    fn test_parse_plain_text_and_final_answer() {
        assert_eq!(parse_llm_output("  5 ").unwrap(), Action::finish("5"));
        assert_eq!(
            parse_llm_output("Final Answer: it is 5").unwrap(),
            Action::finish("it is 5")
        );
        assert_eq!(
            parse_llm_output("the set {1, 2} has two members").unwrap(),
            Action::finish("the set {1, 2} has two members")
        );
    }

    #[test]
    fn test_parse_respond_and_handoff() {
        assert_eq!(
            parse_llm_output(r#"{"respond": "working on it"}"#).unwrap(),
            Action::respond("working on it")
        );
        assert_eq!(
            parse_llm_output(r#"{"tool": "transfer_to_billing", "args": {"message": "refund"}}"#)
                .unwrap(),
            Action::handoff("billing", "refund")
        );
    }

    #[test]
    fn test_parse_malformed_json_is_error() {
        let err = parse_llm_output(r#"{"tool": "add", "args": "#).unwrap_err();
        assert!(err.contains("\"tool\""));
    }

    #[test]
    fn test_native_tool_call_wins_over_text() {
        let reply = LlmReply {
            text: "Final Answer: no".into(),
            tool_calls: vec![ToolCallRequest::new("c9", "add", json!({"a": 1}))],
        };
        assert_eq!(
            first_action(&reply).unwrap(),
            Action::tool("c9", "add", json!({"a": 1}))
        );
    }

    #[test]
    fn test_parse_steps_array() {
        let reply = LlmReply::text(
            r#"[{"tool": "search", "args": {"q": "x"}, "id": "s1"}, {"finish": "done"}]"#,
        );
        let steps = parse_steps(&reply).unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[1], vec![Action::finish("done")]);
    }

    #[test]
    fn test_system_message_includes_persona() {
        let mut state = PlannerState::new("hi");
        state.persona = Persona::new("billing", "Handle refunds.");
        let msg = system_message(&state, "base");
        assert!(msg.content.contains("You are billing."));
        assert!(msg.content.contains("Handle refunds."));
        assert!(msg.content.ends_with("base"));
    }

    #[test]
    fn test_system_message_lists_command_format_when_tools_exist() {
        let mut state = PlannerState::new("hi");
        state.tools.push(crate::core::ToolSpec {
            name: "echo".into(),
            description: "Echo".into(),
            parameters: json!({"type": "object"}),
        });
        let msg = system_message(&state, "base");
        assert!(msg.content.contains("Command format"));
        assert!(msg.content.contains("\"depends_on\""));
        assert!(msg.content.contains("\"args\""));
    }
}
