use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use helm_core::agent::{AgentControl, AgentGateway, AgentPrompt, AgentRun, RunOptions};
use helm_core::errors::AgentError;
use helm_core::events::AgentEvent;

/// One step of a scripted run.
#[derive(Clone, Debug)]
pub enum ScriptStep {
    /// Yield an event.
    Event(AgentEvent),
    /// Yield a stream error.
    Fail(AgentError),
    /// Pause before the next step. Ends early if the run is cancelled.
    Sleep(Duration),
    /// Stay pending until the run is cancelled, then end the stream.
    Hang,
}

/// Pre-programmed outcome of one `run` call.
#[derive(Clone, Debug)]
pub enum ScriptedResponse {
    Steps(Vec<ScriptStep>),
    /// `run` itself fails.
    StartError(AgentError),
    /// Wait, then resolve the inner response.
    Delay(Duration, Box<ScriptedResponse>),
}

impl ScriptedResponse {
    /// A complete single-text-part reply.
    pub fn text(text: &str) -> Self {
        Self::Steps(text_events(text).into_iter().map(ScriptStep::Event).collect())
    }

    /// A reply that reports a resume token first and usage at the end.
    pub fn text_with_session(text: &str, resume_token: &str) -> Self {
        let mut steps = vec![ScriptStep::Event(AgentEvent::SessionStarted {
            resume_token: resume_token.into(),
        })];
        steps.extend(text_events(text).into_iter().map(ScriptStep::Event));
        if let Some(ScriptStep::Event(AgentEvent::Finish { message_metadata })) = steps.last_mut() {
            *message_metadata = Some(json!({
                "usage": {"inputTokens": 10, "outputTokens": 5},
                "totalCostUsd": 0.01
            }));
        }
        Self::Steps(steps)
    }

    /// Emit some text, then hang until cancelled.
    pub fn hang_after_text(text: &str) -> Self {
        Self::Steps(vec![
            ScriptStep::Event(AgentEvent::Start {
                message_id: None,
                message_metadata: None,
            }),
            ScriptStep::Event(AgentEvent::TextStart { id: "t0".into() }),
            ScriptStep::Event(AgentEvent::TextDelta {
                id: "t0".into(),
                delta: text.into(),
            }),
            ScriptStep::Hang,
        ])
    }

    /// Emit some text, then an error event.
    pub fn error_after_text(text: &str, error: &str) -> Self {
        Self::Steps(vec![
            ScriptStep::Event(AgentEvent::TextStart { id: "t0".into() }),
            ScriptStep::Event(AgentEvent::TextDelta {
                id: "t0".into(),
                delta: text.into(),
            }),
            ScriptStep::Event(AgentEvent::Error {
                error_text: error.into(),
            }),
        ])
    }

    pub fn delayed(delay: Duration, inner: ScriptedResponse) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

fn text_events(text: &str) -> Vec<AgentEvent> {
    vec![
        AgentEvent::Start {
            message_id: None,
            message_metadata: None,
        },
        AgentEvent::TextStart { id: "t0".into() },
        AgentEvent::TextDelta {
            id: "t0".into(),
            delta: text.into(),
        },
        AgentEvent::TextEnd { id: "t0".into() },
        AgentEvent::Finish {
            message_metadata: None,
        },
    ]
}

/// Agent that replays [`ScriptedResponse`]s in order and records what it
/// was asked to do.
#[derive(Default)]
pub struct ScriptedAgent {
    responses: Mutex<VecDeque<ScriptedResponse>>,
    prompts: Mutex<Vec<(AgentPrompt, RunOptions)>>,
    stats: Arc<ControlStats>,
    fail_cancel: bool,
}

#[derive(Default)]
struct ControlStats {
    cancel_calls: AtomicUsize,
    responses: Mutex<Vec<(String, Value)>>,
}

impl ScriptedAgent {
    pub fn new(responses: Vec<ScriptedResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            ..Default::default()
        }
    }

    /// Make every `cancel()` call fail without stopping the stream.
    pub fn with_failing_cancel(mut self) -> Self {
        self.fail_cancel = true;
        self
    }

    pub fn push(&self, response: ScriptedResponse) {
        self.responses.lock().push_back(response);
    }

    pub fn call_count(&self) -> usize {
        self.prompts.lock().len()
    }

    /// Prompt texts in call order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts
            .lock()
            .iter()
            .map(|(p, _)| p.content.clone())
            .collect()
    }

    pub fn run_options(&self) -> Vec<RunOptions> {
        self.prompts.lock().iter().map(|(_, o)| o.clone()).collect()
    }

    pub fn cancel_calls(&self) -> usize {
        self.stats.cancel_calls.load(Ordering::SeqCst)
    }

    /// Tool responses forwarded through `respond`, in order.
    pub fn tool_responses(&self) -> Vec<(String, Value)> {
        self.stats.responses.lock().clone()
    }
}

#[async_trait]
impl AgentGateway for ScriptedAgent {
    async fn run(&self, prompt: AgentPrompt, options: RunOptions) -> Result<AgentRun, AgentError> {
        self.prompts.lock().push((prompt, options));
        let next = self.responses.lock().pop_front();
        let Some(mut response) = next else {
            return Err(AgentError::Spawn("no scripted response left".into()));
        };

        let steps = loop {
            match response {
                ScriptedResponse::Steps(steps) => break steps,
                ScriptedResponse::StartError(e) => return Err(e),
                ScriptedResponse::Delay(d, inner) => {
                    tokio::time::sleep(d).await;
                    response = *inner;
                }
            }
        };

        let token = CancellationToken::new();
        let events = stream::unfold(
            (steps.into_iter(), token.clone()),
            |(mut steps, token)| async move {
                loop {
                    match steps.next()? {
                        ScriptStep::Event(e) => return Some((Ok(e), (steps, token))),
                        ScriptStep::Fail(e) => return Some((Err(e), (steps, token))),
                        ScriptStep::Sleep(d) => {
                            tokio::select! {
                                () = token.cancelled() => return None,
                                () = tokio::time::sleep(d) => {}
                            }
                        }
                        ScriptStep::Hang => {
                            token.cancelled().await;
                            return None;
                        }
                    }
                }
            },
        );

        Ok(AgentRun {
            events: Box::pin(events),
            control: Arc::new(ScriptedControl {
                token,
                stats: self.stats.clone(),
                fail_cancel: self.fail_cancel,
            }),
        })
    }
}

struct ScriptedControl {
    token: CancellationToken,
    stats: Arc<ControlStats>,
    fail_cancel: bool,
}

#[async_trait]
impl AgentControl for ScriptedControl {
    async fn cancel(&self) -> Result<(), AgentError> {
        self.stats.cancel_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_cancel {
            return Err(AgentError::Cancel("scripted cancel failure".into()));
        }
        self.token.cancel();
        Ok(())
    }

    async fn respond(&self, tool_call_id: &str, response: Value) -> Result<(), AgentError> {
        self.stats
            .responses
            .lock()
            .push((tool_call_id.to_owned(), response));
        Ok(())
    }
}
