//! Run loop: one agent's turn-taking state machine.
//!
//! ```text
//! Idle -> Submitting -> Streaming -> ToolDispatch -> Submitting
//!                                 -> Completing   -> Idle
//!                                 -> Aborted      -> Idle
//! ```
//!
//! The loop is a single task that exclusively owns the agent's
//! [`Conversation`] and [`InterruptController`]. Bus arrivals and stream
//! fragments are multiplexed with `tokio::select!`, so a message that lands
//! mid-generation is appended, makes the in-flight generation stale, and
//! triggers a fresh submission over the extended state.

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::error::Elapsed;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::context::ContextBuilder;
use super::interrupt::{GenerationHandle, InterruptController};
use super::lineage;
use crate::bus::{Bus, BusMessage, Qos};
use crate::config::{AgentConfig, Config};
use crate::error::{Result, TachikomaError};
use crate::providers::{ChatBackend, StreamEvent};
use crate::session::{Action, Conversation, HistoryStore, Message, Role, SystemEvent, ToolCall};
use crate::tools::{Dispatch, ToolContext, ToolRegistry};
use crate::topic::{
    decode_payload, decode_system_event, encode_payload, encode_system_event, is_system_topic,
    system_filter, system_topic, Command, RoutingTuple, TopicTemplate, STATUS_ERROR, STATUS_INFO,
};

/// Observable side effects of a turn, for a console or telemetry sink.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnEvent {
    /// A generation was submitted over `expected_len` messages.
    Submitted { generation: u64, expected_len: usize },
    /// A streamed content fragment.
    Content(String),
    /// A requested tool call was processed (`found == false`: skipped).
    ToolDispatched { name: String, found: bool },
    /// The generation was cancelled and its partial reply discarded.
    Aborted { generation: u64 },
    /// A reply was acknowledged by the bus and committed.
    Published(Message),
    /// A reply could not be published and was dropped.
    PublishFailed(String),
    /// The backend failed; the turn ended without a reply.
    GenerationFailed(String),
}

enum Stimulus {
    Turn(Message),
    Control(Command),
    Ignore,
}

enum Outcome {
    Idle,
    Resubmit,
    Stop,
}

enum Step {
    Shutdown,
    Inbound(Option<BusMessage>),
    Event(std::result::Result<Option<Result<StreamEvent>>, Elapsed>),
}

/// One agent on the bus.
pub struct RunLoop {
    speaker_id: String,
    namespace: String,
    channel: String,
    model_name: String,
    settings: AgentConfig,
    template: TopicTemplate,
    bus: Arc<dyn Bus>,
    backend: Arc<dyn ChatBackend>,
    tools: ToolRegistry,
    context: ContextBuilder,
    state: Conversation,
    interrupt: InterruptController,
    history: Option<HistoryStore>,
    events: Option<mpsc::UnboundedSender<TurnEvent>>,
    shutdown: CancellationToken,
}

impl RunLoop {
    /// Create a run loop with an empty conversation and no tools.
    ///
    /// # Errors
    ///
    /// Returns an error if the configured topic template does not parse.
    pub fn new(config: &Config, bus: Arc<dyn Bus>, backend: Arc<dyn ChatBackend>) -> Result<Self> {
        let speaker_id = config.agent.speaker_id.clone();
        Ok(Self {
            context: ContextBuilder::new(&speaker_id).with_system_prompt(&config.agent.system_prompt),
            speaker_id,
            namespace: config.bus.namespace.clone(),
            channel: config.bus.channel.clone(),
            model_name: config.backend.model.clone(),
            settings: config.agent.clone(),
            template: config.topic_template()?,
            bus,
            backend,
            tools: ToolRegistry::new(),
            state: Conversation::new(),
            interrupt: InterruptController::new(),
            history: None,
            events: None,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    /// Resume from `state` and save every committed reply to `store`.
    pub fn with_history(mut self, store: HistoryStore, state: Conversation) -> Self {
        self.history = Some(store);
        self.state = state;
        self
    }

    pub fn with_events(mut self, events: mpsc::UnboundedSender<TurnEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Stop the loop when `token` is cancelled.
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn speaker_id(&self) -> &str {
        &self.speaker_id
    }

    pub fn state(&self) -> &Conversation {
        &self.state
    }

    /// Subscribe, announce, and process bus messages until shutdown, a
    /// `KILL` command, or the inbound channel closes.
    ///
    /// Returns the final conversation.
    ///
    /// # Errors
    ///
    /// Returns an error only if the initial subscriptions fail. Turn-level
    /// failures are reported and the loop carries on.
    pub async fn run(mut self, mut inbound: mpsc::UnboundedReceiver<BusMessage>) -> Result<Conversation> {
        self.bus
            .subscribe(&self.template.channel_filter(&self.namespace, &self.channel), Qos::AtMostOnce)
            .await?;
        self.bus
            .subscribe(&system_filter(&self.namespace), Qos::ExactlyOnce)
            .await?;
        self.announce(Action::Join).await;
        info!(
            speaker = %self.speaker_id,
            channel = %self.channel,
            backend = %self.backend.name(),
            tools = self.tools.len(),
            history = self.state.len(),
            "Agent joined"
        );

        let shutdown = self.shutdown.clone();
        loop {
            let received = tokio::select! {
                _ = shutdown.cancelled() => None,
                received = inbound.recv() => received,
            };
            let Some(message) = received else {
                break;
            };
            let outcome = match self.classify(&message) {
                Stimulus::Turn(turn) => self.turn(turn, &mut inbound).await,
                Stimulus::Control(Command::Kill) => Outcome::Stop,
                Stimulus::Control(Command::Abort) => {
                    debug!("ABORT with no active generation");
                    Outcome::Idle
                }
                Stimulus::Ignore => Outcome::Idle,
            };
            if matches!(outcome, Outcome::Stop) {
                break;
            }
        }

        self.announce(Action::Leave).await;
        info!(speaker = %self.speaker_id, "Agent left");
        Ok(self.state)
    }

    fn classify(&self, message: &BusMessage) -> Stimulus {
        if is_system_topic(&message.topic) {
            match decode_system_event(&message.payload) {
                Ok(event) if event.speaker_id != self.speaker_id => {
                    info!(
                        participant = %event.speaker_id,
                        action = ?event.action,
                        model = event.model_name.as_deref().unwrap_or(""),
                        "Participant event"
                    );
                }
                Ok(_) => {}
                Err(e) => warn!(topic = %message.topic, error = %e, "Dropping malformed system event"),
            }
            return Stimulus::Ignore;
        }

        let tuple = self.template.decode(&message.topic);
        if let Some(command) = tuple.command() {
            if tuple.context_id.is_empty() || tuple.context_id == self.speaker_id {
                info!(command = ?command, from = %tuple.speaker_id, "Control command");
                return Stimulus::Control(command);
            }
            return Stimulus::Ignore;
        }
        if tuple.status == STATUS_ERROR {
            debug!(topic = %message.topic, "Ignoring error report");
            return Stimulus::Ignore;
        }

        let mut turn = match decode_payload(&message.payload) {
            Ok(turn) => turn,
            Err(e) => {
                warn!(topic = %message.topic, error = %e, "Dropping malformed payload");
                return Stimulus::Ignore;
            }
        };
        if turn.speaker_id.is_empty() {
            turn.speaker_id = tuple.speaker_id;
        }
        if turn.speaker_id == self.speaker_id {
            return Stimulus::Ignore;
        }
        if turn.role == Role::Tool {
            debug!(speaker = %turn.speaker_id, "Ignoring another agent's tool result");
            return Stimulus::Ignore;
        }
        Stimulus::Turn(turn)
    }

    /// Submitting with a new inbound message, then every restart it causes.
    async fn turn(
        &mut self,
        message: Message,
        inbound: &mut mpsc::UnboundedReceiver<BusMessage>,
    ) -> Outcome {
        debug!(speaker = %message.speaker_id, id = %message.id, "Inbound turn");
        self.state.push(message);
        let mut tool_rounds = 0;
        loop {
            match self.generate(inbound, &mut tool_rounds).await {
                Outcome::Resubmit => continue,
                other => return other,
            }
        }
    }

    async fn generate(
        &mut self,
        inbound: &mut mpsc::UnboundedReceiver<BusMessage>,
        tool_rounds: &mut usize,
    ) -> Outcome {
        let expected_len = self.state.len();
        let snapshot = lineage::snapshot(&self.state);
        let mut handle = self.interrupt.begin().await;
        let generation = handle.id();

        let request = self.context.build_request(&self.state, self.tools.definitions());
        match self.backend.chat(request).await {
            Ok(stream) => handle.attach(stream),
            Err(e) => {
                self.interrupt.cancel(handle).await;
                self.report_failure(e).await;
                return Outcome::Idle;
            }
        }
        self.emit(TurnEvent::Submitted {
            generation,
            expected_len,
        });

        let span = info_span!("turn", generation, expected_len);
        self.stream(handle, expected_len, snapshot, inbound, tool_rounds)
            .instrument(span)
            .await
    }

    async fn stream(
        &mut self,
        mut handle: GenerationHandle,
        expected_len: usize,
        snapshot: Vec<String>,
        inbound: &mut mpsc::UnboundedReceiver<BusMessage>,
        tool_rounds: &mut usize,
    ) -> Outcome {
        let shutdown = self.shutdown.clone();
        let stream_timeout = self.settings.stream_timeout();
        let mut inbound_open = true;
        let mut reply = String::new();
        // Only backend fragments move the deadline; bus traffic does not.
        let mut deadline = Instant::now() + stream_timeout;

        loop {
            if lineage::is_stale(&self.state, expected_len) {
                let generation = handle.id();
                self.interrupt.cancel(handle).await;
                debug!(discarded = reply.len(), "Generation stale, resubmitting");
                self.emit(TurnEvent::Aborted { generation });
                return Outcome::Resubmit;
            }

            let step = tokio::select! {
                biased;
                _ = shutdown.cancelled() => Step::Shutdown,
                received = inbound.recv(), if inbound_open => Step::Inbound(received),
                event = tokio::time::timeout_at(deadline, handle.next()) => Step::Event(event),
            };
            if matches!(step, Step::Event(Ok(_))) {
                deadline = Instant::now() + stream_timeout;
            }

            match step {
                Step::Shutdown => {
                    self.interrupt.cancel(handle).await;
                    return Outcome::Stop;
                }
                Step::Inbound(None) => inbound_open = false,
                Step::Inbound(Some(message)) => match self.classify(&message) {
                    Stimulus::Turn(turn) => {
                        debug!(speaker = %turn.speaker_id, id = %turn.id, "Inbound turn");
                        self.state.push(turn);
                    }
                    Stimulus::Control(command) => {
                        let generation = handle.id();
                        self.interrupt.cancel(handle).await;
                        self.emit(TurnEvent::Aborted { generation });
                        return match command {
                            Command::Abort => Outcome::Idle,
                            Command::Kill => Outcome::Stop,
                        };
                    }
                    Stimulus::Ignore => {}
                },
                Step::Event(Err(_)) => {
                    self.interrupt.cancel(handle).await;
                    self.report_failure(TachikomaError::Timeout(stream_timeout.as_secs()))
                        .await;
                    return Outcome::Idle;
                }
                Step::Event(Ok(Some(Err(e)))) => {
                    self.interrupt.cancel(handle).await;
                    self.report_failure(e).await;
                    return Outcome::Idle;
                }
                Step::Event(Ok(Some(Ok(StreamEvent::Content(text))))) => {
                    reply.push_str(&text);
                    self.emit(TurnEvent::Content(text));
                }
                Step::Event(Ok(Some(Ok(StreamEvent::ToolCalls(calls))))) => {
                    self.interrupt.cancel(handle).await;
                    *tool_rounds += 1;
                    if *tool_rounds > self.settings.max_tool_rounds {
                        warn!(rounds = *tool_rounds, "Tool loop reached maximum rounds, abandoning turn");
                        return Outcome::Idle;
                    }
                    self.dispatch_tools(calls).await;
                    return Outcome::Resubmit;
                }
                Step::Event(Ok(Some(Ok(StreamEvent::Done)))) | Step::Event(Ok(None)) => {
                    self.interrupt.complete(handle).await;
                    self.complete(reply, snapshot).await;
                    return Outcome::Idle;
                }
            }
        }
    }

    async fn dispatch_tools(&mut self, calls: Vec<ToolCall>) {
        let ctx = ToolContext::new(&self.speaker_id);
        let timeout = self.settings.tool_timeout();
        for call in calls {
            let outcome = self
                .tools
                .dispatch(&call.name, call.arguments.clone(), &ctx, timeout)
                .await;
            let content = match outcome {
                Dispatch::NotFound => {
                    debug!(tool = %call.name, "No tool registered under this name, skipping");
                    self.emit(TurnEvent::ToolDispatched {
                        name: call.name,
                        found: false,
                    });
                    continue;
                }
                Dispatch::Completed(value) => value.to_string(),
                Dispatch::Failed(reason) => {
                    warn!(tool = %call.name, error = %reason, "Tool failed");
                    serde_json::json!({ "error": reason }).to_string()
                }
            };

            let name = call.name.clone();
            self.state.push(Message::tool_invocation(&self.speaker_id, call));
            let result = Message::tool_result(&self.speaker_id, &content);
            if self.settings.publish_tool_results {
                let tuple = RoutingTuple::new(&self.namespace, &self.channel, &self.speaker_id)
                    .with_role(Role::Tool.as_str());
                self.publish_best_effort(&tuple, &result).await;
            }
            self.state.push(result);
            self.emit(TurnEvent::ToolDispatched { name, found: true });
        }
    }

    /// Completing: publish, and commit only once the bus acknowledges.
    async fn complete(&mut self, content: String, snapshot: Vec<String>) {
        let mut reply = Message::assistant(&self.speaker_id, &content);
        let parent = snapshot.first().cloned().unwrap_or_default();
        lineage::stamp(&mut reply, snapshot);

        let topic = self.template.encode(
            &RoutingTuple::new(&self.namespace, &self.channel, &self.speaker_id)
                .with_role(Role::Assistant.as_str())
                .with_context_id(&parent),
        );
        let published = match encode_payload(&reply) {
            Ok(payload) => self.bus.publish(&topic, payload, Qos::AtMostOnce).await,
            Err(e) => Err(e),
        };
        match published {
            Ok(()) => {
                info!(topic = %topic, id = %reply.id, chars = content.len(), "Reply published");
                self.state.push(reply.clone());
                self.emit(TurnEvent::Published(reply));
                self.persist().await;
            }
            Err(e) => {
                error!(topic = %topic, error = %e, "Failed to publish reply, dropping it");
                self.emit(TurnEvent::PublishFailed(e.to_string()));
            }
        }
    }

    async fn report_failure(&self, failure: TachikomaError) {
        if failure.is_cancelled() {
            return;
        }
        error!(speaker = %self.speaker_id, error = %failure, "Generation failed");
        let notice = Message::new(&self.speaker_id, Role::System, &failure.to_string());
        let tuple = RoutingTuple::new(&self.namespace, &self.channel, &self.speaker_id)
            .with_status(STATUS_ERROR)
            .with_role(Role::System.as_str());
        self.publish_best_effort(&tuple, &notice).await;
        self.emit(TurnEvent::GenerationFailed(failure.to_string()));
    }

    async fn publish_best_effort(&self, tuple: &RoutingTuple, message: &Message) {
        let topic = self.template.encode(tuple);
        let result = match encode_payload(message) {
            Ok(payload) => self.bus.publish(&topic, payload, Qos::AtMostOnce).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(topic = %topic, error = %e, "Best-effort publish failed");
        }
    }

    async fn announce(&self, action: Action) {
        let event = SystemEvent::new(&self.speaker_id, action, Role::Assistant, &self.channel)
            .with_model(&self.model_name, &self.settings.system_prompt);
        let topic = system_topic(&self.namespace, STATUS_INFO);
        let result = match encode_system_event(&event) {
            Ok(payload) => self.bus.publish(&topic, payload, Qos::ExactlyOnce).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(action = ?action, error = %e, "Failed to announce");
        }
    }

    async fn persist(&self) {
        if let Some(store) = &self.history {
            if let Err(e) = store.save(&self.speaker_id, &self.state).await {
                warn!(error = %e, "Failed to save history");
            }
        }
    }

    fn emit(&self, event: TurnEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }
}
