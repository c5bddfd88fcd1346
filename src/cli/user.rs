//! Interactive human participant.

use anyhow::{Context, Result};
use rustyline::DefaultEditor;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{connect_bus, shutdown_on_ctrl_c};
use crate::bus::{Bus, BusMessage, Qos};
use crate::config::Config;
use crate::session::{Action, Message, Role, SystemEvent};
use crate::topic::{
    decode_payload, decode_system_event, encode_payload, encode_system_event, is_system_topic,
    system_filter, system_topic, RoutingTuple, TopicTemplate, STATUS_INFO,
};

const HELP: &str = "\
Type a message and press enter to send it.
  /abort [agent]  stop the current reply (of one agent, or all)
  /kill <agent>   stop an agent
  help            show this help
  exit            leave the chat";

#[derive(Debug, PartialEq, Eq)]
enum Input {
    Say(String),
    Abort(Option<String>),
    Kill(String),
    Help,
    Exit,
    Empty,
}

fn parse_input(line: &str) -> Input {
    let line = line.trim();
    let mut words = line.split_whitespace();
    match words.next() {
        None => Input::Empty,
        Some("exit") if words.next().is_none() => Input::Exit,
        Some("help") if words.next().is_none() => Input::Help,
        Some("/abort") => Input::Abort(words.next().map(str::to_string)),
        Some("/kill") => match words.next() {
            Some(agent) => Input::Kill(agent.to_string()),
            None => Input::Help,
        },
        Some(_) => Input::Say(line.to_string()),
    }
}

struct Participant {
    speaker_id: String,
    namespace: String,
    channel: String,
    template: TopicTemplate,
    bus: Arc<dyn Bus>,
}

impl Participant {
    fn tuple(&self) -> RoutingTuple {
        RoutingTuple::new(&self.namespace, &self.channel, &self.speaker_id)
    }

    async fn say(&self, text: &str) -> Result<()> {
        let message = Message::user(&self.speaker_id, text);
        let topic = self.template.encode(&self.tuple().with_role(Role::User.as_str()));
        self.bus
            .publish(&topic, encode_payload(&message)?, Qos::AtMostOnce)
            .await?;
        Ok(())
    }

    async fn command(&self, status: &str, target: Option<&str>) -> Result<()> {
        let tuple = self
            .tuple()
            .with_status(status)
            .with_context_id(target.unwrap_or(""));
        self.bus
            .publish(&self.template.encode(&tuple), Vec::new(), Qos::AtLeastOnce)
            .await?;
        Ok(())
    }

    async fn announce(&self, action: Action) -> Result<()> {
        let event = SystemEvent::new(&self.speaker_id, action, Role::User, &self.channel);
        self.bus
            .publish(
                &system_topic(&self.namespace, STATUS_INFO),
                encode_system_event(&event)?,
                Qos::ExactlyOnce,
            )
            .await?;
        Ok(())
    }

    fn render(&self, message: &BusMessage) -> Option<String> {
        if is_system_topic(&message.topic) {
            let event = decode_system_event(&message.payload).ok()?;
            if event.speaker_id == self.speaker_id {
                return None;
            }
            return Some(format!("[{}]", event.content.unwrap_or_default()));
        }
        let tuple = self.template.decode(&message.topic);
        if tuple.speaker_id == self.speaker_id || tuple.role == Role::Tool.as_str() {
            return None;
        }
        match decode_payload(&message.payload) {
            Ok(turn) if turn.speaker_id != self.speaker_id => {
                Some(format!("{}: {}", tuple.speaker_id, turn.content))
            }
            Ok(_) => None,
            Err(e) => {
                debug!(topic = %message.topic, error = %e, "Unreadable message");
                None
            }
        }
    }
}

pub(super) async fn run(config: Config) -> Result<()> {
    let (bus, mut inbound) = connect_bus(&config.bus)?;
    let participant = Arc::new(Participant {
        speaker_id: config.agent.user_id.clone(),
        namespace: config.bus.namespace.clone(),
        channel: config.bus.channel.clone(),
        template: config.topic_template()?,
        bus: Arc::clone(&bus),
    });

    bus.subscribe(
        &participant
            .template
            .channel_filter(&participant.namespace, &participant.channel),
        Qos::AtMostOnce,
    )
    .await?;
    bus.subscribe(&system_filter(&participant.namespace), Qos::ExactlyOnce)
        .await?;
    participant.announce(Action::Join).await.context("failed to join")?;

    let printer = Arc::clone(&participant);
    tokio::spawn(async move {
        while let Some(message) = inbound.recv().await {
            if let Some(line) = printer.render(&message) {
                println!("{}", line);
            }
        }
    });

    let (lines_tx, mut lines) = mpsc::unbounded_channel();
    let prompt = format!("{} > ", participant.speaker_id);
    tokio::task::spawn_blocking(move || {
        let mut editor = match DefaultEditor::new() {
            Ok(editor) => editor,
            Err(e) => {
                warn!(error = %e, "Cannot open line editor");
                return;
            }
        };
        while let Ok(line) = editor.readline(&prompt) {
            let _ = editor.add_history_entry(line.as_str());
            if lines_tx.send(line).is_err() {
                break;
            }
        }
    });

    println!("{}", HELP);
    let shutdown = shutdown_on_ctrl_c();
    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => break,
            line = lines.recv() => match line {
                Some(line) => line,
                None => break,
            },
        };
        let sent = match parse_input(&line) {
            Input::Exit => break,
            Input::Empty => Ok(()),
            Input::Help => {
                println!("{}", HELP);
                Ok(())
            }
            Input::Say(text) => participant.say(&text).await,
            Input::Abort(target) => participant.command("ABORT", target.as_deref()).await,
            Input::Kill(target) => participant.command("KILL", Some(target.as_str())).await,
        };
        if let Err(e) = sent {
            eprintln!("not sent: {}", e);
        }
    }

    participant.announce(Action::Leave).await?;
    bus.disconnect().await?;
    println!("Bye!");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBroker;
    use crate::config::DEFAULT_TOPIC_TEMPLATE;

    #[test]
    fn test_parse_input() {
        assert_eq!(parse_input("  "), Input::Empty);
        assert_eq!(parse_input("exit"), Input::Exit);
        assert_eq!(parse_input("exit now please"), Input::Say("exit now please".into()));
        assert_eq!(parse_input("/abort"), Input::Abort(None));
        assert_eq!(parse_input("/abort blue"), Input::Abort(Some("blue".into())));
        assert_eq!(parse_input("/kill"), Input::Help);
        assert_eq!(parse_input("/kill blue"), Input::Kill("blue".into()));
        assert_eq!(parse_input(" hello there "), Input::Say("hello there".into()));
    }

    fn participant(bus: Arc<dyn Bus>) -> Participant {
        Participant {
            speaker_id: "user".into(),
            namespace: "a2a".into(),
            channel: "default".into(),
            template: TopicTemplate::parse(DEFAULT_TOPIC_TEMPLATE).unwrap(),
            bus,
        }
    }

    #[tokio::test]
    async fn test_say_and_command_topics() {
        let broker = MemoryBroker::new();
        let (listener, mut rx) = broker.connect("listener");
        listener.subscribe("a2a/#", Qos::AtMostOnce).await.unwrap();
        let (bus, _user_rx) = broker.connect("user");
        let participant = participant(Arc::new(bus));

        participant.say("hi all").await.unwrap();
        let said = rx.recv().await.unwrap();
        assert_eq!(said.topic, "a2a/default/user/INFO/user//");
        assert_eq!(decode_payload(&said.payload).unwrap().content, "hi all");

        participant.command("ABORT", Some("blue")).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().topic, "a2a/default/user/ABORT///blue");
    }

    #[test]
    fn test_render_skips_own_messages() {
        let broker = MemoryBroker::new();
        let (bus, _user_rx) = broker.connect("user");
        let participant = participant(Arc::new(bus));

        let reply = Message::assistant("blue", "hello");
        let from_agent = BusMessage::new(
            "a2a/default/blue/INFO/assistant//x",
            encode_payload(&reply).unwrap(),
        );
        assert_eq!(participant.render(&from_agent).as_deref(), Some("blue: hello"));

        let own = Message::user("user", "me");
        let echo = BusMessage::new("a2a/default/user/INFO/user//", encode_payload(&own).unwrap());
        assert!(participant.render(&echo).is_none());

        let join = SystemEvent::new("blue", Action::Join, Role::Assistant, "default");
        let system = BusMessage::new("a2a/system/INFO", encode_system_event(&join).unwrap());
        assert_eq!(
            participant.render(&system).as_deref(),
            Some("[\"blue\" joined the chat.]")
        );
    }
}
