//! 常用的交接输入过滤器
//!
//! 过滤器的输出就是目标智能体看到的完整历史；交接消息非空时追加为最后一条 user 消息。

use crate::handoff::HandoffInput;
use crate::memory::{Message, Role};

pub(crate) fn with_message(mut history: Vec<Message>, input: &HandoffInput) -> Vec<Message> {
    if !input.message.trim().is_empty() {
        history.push(Message::user(input.message.clone()));
    }
    history
}

/// 只保留最后 n 条
pub fn keep_last(n: usize) -> impl Fn(&HandoffInput) -> Vec<Message> + Send + Sync + 'static {
    move |input| {
        let skip = input.history.len().saturating_sub(n);
        with_message(input.history[skip..].to_vec(), input)
    }
}

pub fn user_messages_only() -> impl Fn(&HandoffInput) -> Vec<Message> + Send + Sync + 'static {
    |input| {
        let history = input
            .history
            .iter()
            .filter(|m| m.role == Role::User)
            .cloned()
            .collect();
        with_message(history, input)
    }
}

/// 去掉工具结果及其调用记录
pub fn remove_tool_messages() -> impl Fn(&HandoffInput) -> Vec<Message> + Send + Sync + 'static {
    |input| {
        let history = input
            .history
            .iter()
            .filter(|m| m.role != Role::Tool && !m.content.starts_with("Tool call: "))
            .cloned()
            .collect();
        with_message(history, input)
    }
}
