use std::collections::HashMap;

use serde_json::Value;

use crate::events::AgentEvent;
use crate::ids::MessageId;
use crate::messages::{ChatMessage, MessagePart, PartState, Role, ToolState};
use crate::partial_json::parse_partial;

/// Builds one assistant [`ChatMessage`] from a turn's stream of [`AgentEvent`]s.
///
/// One instance per turn. Purely in-memory; never fails. Deltas that arrive
/// for an id with no preceding start event create the part on demand.
#[derive(Debug)]
pub struct MessageAccumulator {
    message_id: MessageId,
    parts: Vec<MessagePart>,
    metadata: Option<Value>,
    text_parts: HashMap<String, usize>,
    reasoning_parts: HashMap<String, usize>,
    tool_parts: HashMap<String, usize>,
    tool_input_text: HashMap<String, String>,
}

impl Default for MessageAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageAccumulator {
    pub fn new() -> Self {
        Self {
            message_id: MessageId::new(),
            parts: Vec::new(),
            metadata: None,
            text_parts: HashMap::new(),
            reasoning_parts: HashMap::new(),
            tool_parts: HashMap::new(),
            tool_input_text: HashMap::new(),
        }
    }

    pub fn process_event(&mut self, event: &AgentEvent) {
        match event {
            AgentEvent::Start {
                message_id,
                message_metadata,
            } => {
                if let Some(id) = message_id {
                    self.message_id = MessageId::from_raw(id.clone());
                }
                if let Some(meta) = message_metadata {
                    self.merge_metadata(meta);
                }
            }
            AgentEvent::TextStart { id } => {
                let _ = self.text_part(id);
            }
            AgentEvent::TextDelta { id, delta } => {
                if let MessagePart::Text { text, .. } = self.text_part(id) {
                    text.push_str(delta);
                }
            }
            AgentEvent::TextEnd { id } => {
                if let MessagePart::Text { state, .. } = self.text_part(id) {
                    *state = PartState::Done;
                }
            }
            AgentEvent::ReasoningStart { id } => {
                let _ = self.reasoning_part(id);
            }
            AgentEvent::ReasoningDelta { id, delta } => {
                if let MessagePart::Reasoning { text, .. } = self.reasoning_part(id) {
                    text.push_str(delta);
                }
            }
            AgentEvent::ReasoningEnd { id } => {
                if let MessagePart::Reasoning { state, .. } = self.reasoning_part(id) {
                    *state = PartState::Done;
                }
            }
            AgentEvent::ToolInputStart {
                tool_call_id,
                tool_name,
            } => {
                self.update_tool(tool_call_id, Some(tool_name), |_| {});
            }
            AgentEvent::ToolInputDelta {
                tool_call_id,
                input_text_delta,
            } => {
                let buf = self.tool_input_text.entry(tool_call_id.clone()).or_default();
                buf.push_str(input_text_delta);
                let parsed = parse_partial(buf);
                self.update_tool(tool_call_id, None, |part| {
                    if let MessagePart::Tool { input, .. } = part {
                        if let Some(v) = parsed {
                            *input = Some(v);
                        }
                    }
                });
            }
            AgentEvent::ToolInputAvailable {
                tool_call_id,
                tool_name,
                input,
            } => {
                self.tool_input_text.remove(tool_call_id);
                self.update_tool(tool_call_id, Some(tool_name), |part| {
                    if let MessagePart::Tool {
                        state, input: slot, ..
                    } = part
                    {
                        *state = ToolState::InputAvailable;
                        *slot = Some(input.clone());
                    }
                });
            }
            AgentEvent::ToolInputError {
                tool_call_id,
                tool_name,
                input,
                error_text,
            } => {
                self.tool_input_text.remove(tool_call_id);
                self.update_tool(tool_call_id, Some(tool_name), |part| {
                    if let MessagePart::Tool {
                        state,
                        input: slot,
                        error_text: err,
                        ..
                    } = part
                    {
                        *state = ToolState::InputError;
                        if !input.is_null() {
                            *slot = Some(input.clone());
                        }
                        *err = Some(error_text.clone());
                    }
                });
            }
            AgentEvent::ToolOutputAvailable {
                tool_call_id,
                output,
            } => {
                self.update_tool(tool_call_id, None, |part| {
                    if let MessagePart::Tool {
                        state, output: slot, ..
                    } = part
                    {
                        *state = ToolState::OutputAvailable;
                        *slot = Some(output.clone());
                    }
                });
            }
            AgentEvent::ToolOutputError {
                tool_call_id,
                error_text,
            } => {
                self.update_tool(tool_call_id, None, |part| {
                    if let MessagePart::Tool {
                        state,
                        error_text: err,
                        ..
                    } = part
                    {
                        *state = ToolState::OutputError;
                        *err = Some(error_text.clone());
                    }
                });
            }
            AgentEvent::ToolOutputDenied { tool_call_id } => {
                self.update_tool(tool_call_id, None, |part| {
                    if let MessagePart::Tool { state, .. } = part {
                        *state = ToolState::OutputDenied;
                    }
                });
            }
            AgentEvent::File { url, media_type } => self.parts.push(MessagePart::File {
                url: url.clone(),
                media_type: media_type.clone(),
            }),
            AgentEvent::SourceUrl {
                source_id,
                url,
                title,
            } => self.parts.push(MessagePart::SourceUrl {
                source_id: source_id.clone(),
                url: url.clone(),
                title: title.clone(),
            }),
            AgentEvent::SourceDocument {
                source_id,
                media_type,
                title,
                filename,
            } => self.parts.push(MessagePart::SourceDocument {
                source_id: source_id.clone(),
                media_type: media_type.clone(),
                title: title.clone(),
                filename: filename.clone(),
            }),
            AgentEvent::MessageMetadata { message_metadata } => {
                self.merge_metadata(message_metadata);
            }
            AgentEvent::Finish { message_metadata } => {
                if let Some(meta) = message_metadata {
                    self.merge_metadata(meta);
                }
                self.close_streaming_parts();
            }
            AgentEvent::SessionStarted { .. } | AgentEvent::Error { .. } | AgentEvent::Unknown => {}
        }
    }

    /// Current, possibly partial, message.
    pub fn message(&self) -> ChatMessage {
        ChatMessage {
            id: self.message_id.clone(),
            role: Role::Assistant,
            parts: self.parts.clone(),
            metadata: self.metadata.clone(),
        }
    }

    pub fn has_content(&self) -> bool {
        !self.parts.is_empty()
    }

    pub fn metadata(&self) -> Option<&Value> {
        self.metadata.as_ref()
    }

    fn merge_metadata(&mut self, incoming: &Value) {
        match (&mut self.metadata, incoming) {
            (Some(Value::Object(existing)), Value::Object(new)) => {
                for (k, v) in new {
                    existing.insert(k.clone(), v.clone());
                }
            }
            (slot, v) => *slot = Some(v.clone()),
        }
    }

    fn close_streaming_parts(&mut self) {
        for part in &mut self.parts {
            if let MessagePart::Text { state, .. } | MessagePart::Reasoning { state, .. } = part {
                *state = PartState::Done;
            }
        }
    }

    fn text_part(&mut self, id: &str) -> &mut MessagePart {
        let idx = match self.text_parts.get(id) {
            Some(&idx) => idx,
            None => {
                self.parts.push(MessagePart::Text {
                    text: String::new(),
                    state: PartState::Streaming,
                });
                let idx = self.parts.len() - 1;
                self.text_parts.insert(id.to_owned(), idx);
                idx
            }
        };
        &mut self.parts[idx]
    }

    fn reasoning_part(&mut self, id: &str) -> &mut MessagePart {
        let idx = match self.reasoning_parts.get(id) {
            Some(&idx) => idx,
            None => {
                self.parts.push(MessagePart::Reasoning {
                    text: String::new(),
                    state: PartState::Streaming,
                });
                let idx = self.parts.len() - 1;
                self.reasoning_parts.insert(id.to_owned(), idx);
                idx
            }
        };
        &mut self.parts[idx]
    }

    fn update_tool(
        &mut self,
        tool_call_id: &str,
        tool_name: Option<&String>,
        apply: impl FnOnce(&mut MessagePart),
    ) {
        let idx = match self.tool_parts.get(tool_call_id) {
            Some(&idx) => idx,
            None => {
                self.parts.push(MessagePart::Tool {
                    tool_call_id: tool_call_id.to_owned(),
                    tool_name: String::new(),
                    state: ToolState::InputStreaming,
                    input: None,
                    output: None,
                    error_text: None,
                });
                let idx = self.parts.len() - 1;
                self.tool_parts.insert(tool_call_id.to_owned(), idx);
                idx
            }
        };
        let part = &mut self.parts[idx];
        if let (Some(name), MessagePart::Tool { tool_name: slot, .. }) = (tool_name, &mut *part) {
            if !name.is_empty() {
                slot.clone_from(name);
            }
        }
        apply(part);
    }
}
