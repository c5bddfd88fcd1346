//! Topic codec
//!
//! Maps a structured [`RoutingTuple`] to a slash-delimited topic string and
//! back, following a configurable [`TopicTemplate`]:
//!
//! ```text
//! {namespace}/{channel}/{speaker_id}/{status}/{role}/{phase}/{context_id}
//! ```
//!
//! Decoding never fails: slots the topic does not reach decode as empty
//! strings, and segments beyond the template are kept positionally in
//! [`RoutingTuple::extra`] so `encode(decode(topic)) == topic` for every
//! topic that matches the template.
//!
//! Join/leave announcements use the reserved `{namespace}/system/{status}`
//! branch instead of the template.

pub mod payload;

pub use payload::{decode_payload, decode_system_event, encode_payload, encode_system_event};

use serde::Serialize;

use crate::error::{Result, TachikomaError};

/// Status of an ordinary informational turn.
pub const STATUS_INFO: &str = "INFO";
/// Status of a turn-failure report.
pub const STATUS_ERROR: &str = "ERROR";
/// Channel segment reserved for lifecycle announcements.
pub const SYSTEM_CHANNEL: &str = "system";

/// A named slot in the topic template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Namespace,
    Channel,
    SpeakerId,
    Status,
    Role,
    Phase,
    ContextId,
}

impl Field {
    /// Resolve a placeholder name. Accepts the older `protocol`, `provider`,
    /// `agent_id` and `version` spellings.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "namespace" | "protocol" => Some(Field::Namespace),
            "channel" | "provider" => Some(Field::Channel),
            "speaker_id" | "agent_id" => Some(Field::SpeakerId),
            "status" | "version" => Some(Field::Status),
            "role" => Some(Field::Role),
            "phase" => Some(Field::Phase),
            "context_id" => Some(Field::ContextId),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Slot {
    Field(Field),
    Literal(String),
}

/// Decoded form of a topic string.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RoutingTuple {
    pub namespace: String,
    pub channel: String,
    pub speaker_id: String,
    pub status: String,
    pub role: String,
    pub phase: String,
    pub context_id: String,
    /// Trailing segments past the template, in order
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub extra: Vec<String>,
}

impl RoutingTuple {
    pub fn new(namespace: &str, channel: &str, speaker_id: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            channel: channel.to_string(),
            speaker_id: speaker_id.to_string(),
            status: STATUS_INFO.to_string(),
            ..Self::default()
        }
    }

    pub fn with_status(mut self, status: &str) -> Self {
        self.status = status.to_string();
        self
    }

    pub fn with_role(mut self, role: &str) -> Self {
        self.role = role.to_string();
        self
    }

    pub fn with_phase(mut self, phase: &str) -> Self {
        self.phase = phase.to_string();
        self
    }

    pub fn with_context_id(mut self, context_id: &str) -> Self {
        self.context_id = context_id.to_string();
        self
    }

    pub fn get(&self, field: Field) -> &str {
        match field {
            Field::Namespace => &self.namespace,
            Field::Channel => &self.channel,
            Field::SpeakerId => &self.speaker_id,
            Field::Status => &self.status,
            Field::Role => &self.role,
            Field::Phase => &self.phase,
            Field::ContextId => &self.context_id,
        }
    }

    fn set(&mut self, field: Field, value: &str) {
        let slot = match field {
            Field::Namespace => &mut self.namespace,
            Field::Channel => &mut self.channel,
            Field::SpeakerId => &mut self.speaker_id,
            Field::Status => &mut self.status,
            Field::Role => &mut self.role,
            Field::Phase => &mut self.phase,
            Field::ContextId => &mut self.context_id,
        };
        *slot = value.to_string();
    }

    /// Out-of-band control command carried in the status slot, if any.
    pub fn command(&self) -> Option<Command> {
        Command::from_status(&self.status)
    }
}

/// Control command that bypasses normal turn accumulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Cancel the active generation without regenerating.
    Abort,
    /// Cancel the active generation and stop the agent.
    Kill,
}

impl Command {
    pub fn from_status(status: &str) -> Option<Self> {
        if status.eq_ignore_ascii_case("ABORT") {
            Some(Command::Abort)
        } else if status.eq_ignore_ascii_case("KILL") {
            Some(Command::Kill)
        } else {
            None
        }
    }
}

/// Parsed topic template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicTemplate {
    slots: Vec<Slot>,
}

impl TopicTemplate {
    /// Parse a template such as `a2a/{channel}/{speaker_id}/{status}`.
    ///
    /// A trailing slash is ignored. Placeholders must be known field names
    /// and may appear at most once.
    ///
    /// # Errors
    ///
    /// Returns [`TachikomaError::Config`] for an empty template, an unknown
    /// placeholder, or a repeated field.
    pub fn parse(template: &str) -> Result<Self> {
        let template = template.strip_suffix('/').unwrap_or(template);
        if template.is_empty() {
            return Err(TachikomaError::Config("topic template is empty".into()));
        }
        let mut slots = Vec::new();
        for part in template.split('/') {
            let slot = match part.strip_prefix('{').and_then(|p| p.strip_suffix('}')) {
                Some(name) => {
                    let field = Field::from_name(name).ok_or_else(|| {
                        TachikomaError::Config(format!("unknown topic placeholder '{{{}}}'", name))
                    })?;
                    if slots.contains(&Slot::Field(field)) {
                        return Err(TachikomaError::Config(format!(
                            "topic placeholder '{{{}}}' repeated",
                            name
                        )));
                    }
                    Slot::Field(field)
                }
                None => Slot::Literal(part.to_string()),
            };
            slots.push(slot);
        }
        Ok(Self { slots })
    }

    /// Number of segments a fully-populated topic has.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Render a tuple. Unset slots become empty segments so the slash count
    /// is preserved.
    pub fn encode(&self, tuple: &RoutingTuple) -> String {
        let mut segments: Vec<&str> = self
            .slots
            .iter()
            .map(|slot| match slot {
                Slot::Field(field) => tuple.get(*field),
                Slot::Literal(text) => text.as_str(),
            })
            .collect();
        segments.extend(tuple.extra.iter().map(String::as_str));
        segments.join("/")
    }

    /// Decode a topic. Never fails; short topics pad with empty strings.
    pub fn decode(&self, topic: &str) -> RoutingTuple {
        let segments: Vec<&str> = topic.split('/').collect();
        let mut tuple = RoutingTuple::default();
        for (index, slot) in self.slots.iter().enumerate() {
            if let Slot::Field(field) = slot {
                tuple.set(*field, segments.get(index).copied().unwrap_or(""));
            }
        }
        if segments.len() > self.slots.len() {
            tuple.extra = segments[self.slots.len()..]
                .iter()
                .map(|s| s.to_string())
                .collect();
        }
        tuple
    }

    /// Subscription filter covering every topic of one channel.
    ///
    /// Keeps the leading literal, namespace and channel segments and ends
    /// with a `#` wildcard at the first per-message slot.
    pub fn channel_filter(&self, namespace: &str, channel: &str) -> String {
        let mut segments = Vec::new();
        for slot in &self.slots {
            match slot {
                Slot::Literal(text) => segments.push(text.as_str()),
                Slot::Field(Field::Namespace) => segments.push(namespace),
                Slot::Field(Field::Channel) => segments.push(channel),
                Slot::Field(_) => break,
            }
        }
        segments.push("#");
        segments.join("/")
    }
}

/// Topic for a lifecycle announcement: `{namespace}/system/{status}`.
pub fn system_topic(namespace: &str, status: &str) -> String {
    format!("{}/{}/{}", namespace, SYSTEM_CHANNEL, status)
}

/// Subscription filter for the system branch.
pub fn system_filter(namespace: &str) -> String {
    format!("{}/{}/#", namespace, SYSTEM_CHANNEL)
}

/// Whether `topic` lies on the reserved system branch.
pub fn is_system_topic(topic: &str) -> bool {
    topic.split('/').nth(1) == Some(SYSTEM_CHANNEL)
}
