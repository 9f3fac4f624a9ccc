//! CLI commands for agentbus using clap.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use futures::StreamExt;
use serde_json::Value;

use crate::broker::{self, Broker, MemoryTransport, Subscription};
use crate::channels::{validate_id, TopicRouter};
use crate::config::{Backend, Settings};
use crate::protocol::{EnvelopeBuilder, Heartbeat, MessageContent, MessageEnvelope};

/// agentbus - publish/subscribe messaging for cooperating agents.
#[derive(Parser)]
#[command(name = "agentbus")]
#[command(version)]
#[command(about = "Topic-based message bus for multi-agent systems", long_about = None)]
pub struct Commands {
    /// Settings file (default: ~/.agentbus/settings.json)
    #[arg(long, global = true, env = "AGENTBUS_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Publish one message and print how many subscribers received it
    Publish {
        /// Destination topic, e.g. agent:A:tasks
        topic: String,

        /// Message type tag, e.g. heartbeat or task_assignment
        #[arg(long = "type", default_value = "custom")]
        message_type: String,

        /// Sending agent
        #[arg(long, default_value = "cli")]
        sender: String,

        /// Content as a JSON object
        #[arg(long, default_value = "{}")]
        content: String,

        /// Recipient agent (repeatable); omit to broadcast
        #[arg(long = "recipient")]
        recipients: Vec<String>,

        /// Id of the request this message answers
        #[arg(long)]
        correlation_id: Option<String>,
    },

    /// Print envelopes published to a topic
    #[command(alias = "sub")]
    Subscribe {
        topic: String,

        /// Stop after this many messages
        #[arg(long)]
        count: Option<usize>,
    },

    /// Print envelopes published to any topic matching a glob pattern
    #[command(alias = "psub")]
    Psubscribe {
        /// Pattern, e.g. agent:A:*
        pattern: String,

        /// Stop after this many messages
        #[arg(long)]
        count: Option<usize>,
    },

    /// List topics with at least one subscriber
    Channels,

    /// Show the subscriber count of a topic
    Numsub { channel: String },

    /// Keyed store with expiry
    #[command(subcommand)]
    Kv(KvCommand),

    /// Print the topic a message of the given kind is routed to
    Topic {
        #[arg(value_enum)]
        route: Route,

        /// Agent, workflow, task or project id (not used by collaboration/system)
        id: Option<String>,
    },

    /// Run a heartbeat round trip on an in-process bus
    Demo,
}

#[derive(Subcommand)]
pub enum KvCommand {
    /// Store a JSON value
    Set {
        key: String,

        /// JSON value; plain text is stored as a string
        value: String,

        /// Lifetime in seconds (default: broker.default_ttl_seconds)
        #[arg(long)]
        ttl: Option<u64>,
    },

    /// Fetch a value
    Get { key: String },

    /// Delete a key
    #[command(alias = "rm")]
    Del { key: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Route {
    Task,
    Status,
    Heartbeat,
    Workflow,
    Result,
    Coordination,
    Collaboration,
    System,
}

impl Route {
    /// Topic for this route, if the required id is present.
    pub fn topic(self, id: Option<&str>) -> Result<String> {
        let require = |what: &str| require_id(id, what);

        Ok(match self {
            Route::Task => TopicRouter::route_task_assignment(require("agent")?),
            Route::Status => TopicRouter::route_status_update(require("agent")?),
            Route::Heartbeat => TopicRouter::route_heartbeat(require("agent")?),
            Route::Workflow => TopicRouter::route_workflow_update(require("workflow")?),
            Route::Result => TopicRouter::route_result_delivery(require("task")?),
            Route::Coordination => TopicRouter::route_coordination_request(require("project")?),
            Route::Collaboration => TopicRouter::route_collaboration_request(),
            Route::System => TopicRouter::route_system_event(),
        })
    }
}

fn require_id<'a>(id: Option<&'a str>, what: &str) -> Result<&'a str> {
    let Some(id) = id else {
        bail!("{} id is required for this route", what);
    };
    validate_id(id).with_context(|| format!("invalid {} id", what))?;
    Ok(id)
}

impl Commands {
    /// Load settings from `--config` when given, otherwise the default path.
    ///
    /// Also returns any problems hit while loading, for logging once the
    /// subscriber is installed.
    pub fn settings(&self) -> (Settings, Vec<String>) {
        crate::config::load_settings_with_fallback(self.config.as_deref())
    }

    pub async fn run(&self, settings: &Settings) -> Result<()> {
        match &self.command {
            Command::Publish {
                topic,
                message_type,
                sender,
                content,
                recipients,
                correlation_id,
            } => {
                cmd_publish(
                    settings,
                    topic,
                    message_type,
                    sender,
                    content,
                    recipients,
                    correlation_id.as_deref(),
                )
                .await
            }
            Command::Subscribe { topic, count } => cmd_subscribe(settings, topic, *count).await,
            Command::Psubscribe { pattern, count } => {
                cmd_psubscribe(settings, pattern, *count).await
            }
            Command::Channels => cmd_channels(settings).await,
            Command::Numsub { channel } => cmd_numsub(settings, channel).await,
            Command::Kv(cmd) => cmd_kv(settings, cmd).await,
            Command::Topic { route, id } => {
                println!("{}", route.topic(id.as_deref())?);
                Ok(())
            }
            Command::Demo => cmd_demo().await,
        }
    }
}

/// Broker for the configured backend; callers run their work through
/// [`Broker::scoped`] so it is disconnected on every exit path.
fn open_broker(settings: &Settings) -> Result<Broker> {
    if settings.broker.backend == Backend::Memory {
        tracing::warn!("Using the in-process memory backend; other processes will not see these messages");
    }
    broker::open(&settings.broker)
        .with_context(|| format!("Failed to open the {:?} backend", settings.broker.backend))
}

fn parse_json_object(raw: &str) -> Result<Value> {
    let value: Value = serde_json::from_str(raw).context("content must be valid JSON")?;
    if !value.is_object() {
        bail!("content must be a JSON object");
    }
    Ok(value)
}

async fn cmd_publish(
    settings: &Settings,
    topic: &str,
    message_type: &str,
    sender: &str,
    content: &str,
    recipients: &[String],
    correlation_id: Option<&str>,
) -> Result<()> {
    let mut builder = EnvelopeBuilder::for_tag(message_type)?
        .sender(sender)
        .topic(topic)
        .content(parse_json_object(content)?);
    if !recipients.is_empty() {
        builder = builder.recipients(recipients.iter().cloned());
    }
    if let Some(id) = correlation_id {
        builder = builder.correlation_id(id);
    }
    let envelope = builder.build()?;
    let id = envelope.id.clone();

    let receivers = open_broker(settings)?
        .scoped(|broker| async move { Ok::<_, anyhow::Error>(broker.publish(topic, &envelope).await?) })
        .await?;

    println!("{} (id {}) -> {} subscriber(s)", topic, id, receivers);
    Ok(())
}

async fn print_until<T, F>(mut subscription: Subscription<T>, count: Option<usize>, render: F) -> Result<()>
where
    F: Fn(&T) -> Result<String>,
{
    let mut seen = 0usize;
    loop {
        if count.is_some_and(|limit| seen >= limit) {
            break;
        }
        tokio::select! {
            item = subscription.next() => match item {
                Some(Ok(item)) => {
                    println!("{}", render(&item)?);
                    seen += 1;
                }
                Some(Err(e)) => {
                    subscription.cancel().await;
                    return Err(e.into());
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    subscription.cancel().await;
    Ok(())
}

async fn cmd_subscribe(settings: &Settings, topic: &str, count: Option<usize>) -> Result<()> {
    open_broker(settings)?
        .scoped(|broker| async move {
            let subscription = broker.subscribe(topic).await?;
            eprintln!("Listening on {} (Ctrl+C to stop)", topic);

            print_until(subscription, count, |envelope: &MessageEnvelope| {
                Ok(envelope.to_json()?)
            })
            .await
        })
        .await
}

async fn cmd_psubscribe(settings: &Settings, pattern: &str, count: Option<usize>) -> Result<()> {
    open_broker(settings)?
        .scoped(|broker| async move {
            let subscription = broker.pattern_subscribe(pattern).await?;
            eprintln!("Listening on pattern {} (Ctrl+C to stop)", pattern);

            print_until(subscription, count, |(topic, envelope): &(String, MessageEnvelope)| {
                Ok(format!("{}\t{}", topic, envelope.to_json()?))
            })
            .await
        })
        .await
}

async fn cmd_channels(settings: &Settings) -> Result<()> {
    let channels = open_broker(settings)?
        .scoped(|broker| async move { Ok::<_, anyhow::Error>(broker.list_channels().await?) })
        .await?;

    if channels.is_empty() {
        println!("No active channels");
    }
    for channel in channels {
        println!("{}", channel);
    }
    Ok(())
}

async fn cmd_numsub(settings: &Settings, channel: &str) -> Result<()> {
    let count = open_broker(settings)?
        .scoped(|broker| async move { Ok::<_, anyhow::Error>(broker.subscriber_count(channel).await?) })
        .await?;

    println!("{} {}", channel, count);
    Ok(())
}

async fn cmd_kv(settings: &Settings, cmd: &KvCommand) -> Result<()> {
    open_broker(settings)?
        .scoped(|broker| async move { run_kv(&broker, cmd).await })
        .await
}

async fn run_kv(broker: &Broker, cmd: &KvCommand) -> Result<()> {
    match cmd {
        KvCommand::Set { key, value, ttl } => {
            let value = serde_json::from_str::<Value>(value)
                .unwrap_or_else(|_| Value::String(value.clone()));
            match ttl {
                Some(ttl) => broker.set_with_expiry(key, &value, *ttl).await?,
                None => broker.set_with_default_expiry(key, &value).await?,
            }
            println!("OK");
        }
        KvCommand::Get { key } => match broker.get::<Value>(key).await? {
            Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
            None => println!("(nil)"),
        },
        KvCommand::Del { key } => {
            let existed = broker.delete(key).await?;
            println!("{}", if existed { "1" } else { "0" });
        }
    }
    Ok(())
}

/// Publish a heartbeat before and after subscribing, on a fresh in-process bus.
async fn cmd_demo() -> Result<()> {
    let topic = TopicRouter::route_heartbeat("A");
    let envelope = EnvelopeBuilder::from_content(Heartbeat {
        agent_id: Some("A".to_string()),
        agent_state: "idle".to_string(),
        active_tasks_count: 0,
        memory_mb: None,
        cpu_percent: None,
    })?
    .sender("A")
    .topic(&topic)
    .build()?;

    Broker::new(Arc::new(MemoryTransport::new()))
        .scoped(|broker| async move {
            let before = broker.publish(&topic, &envelope).await?;
            println!("published to {} with no subscribers -> {}", topic, before);

            let mut subscription = broker.subscribe(&topic).await?;
            let after = broker.publish(&topic, &envelope).await?;
            println!("published to {} after subscribing -> {}", topic, after);

            let received = tokio::time::timeout(std::time::Duration::from_secs(5), subscription.next())
                .await
                .context("timed out waiting for the heartbeat")?
                .context("subscription ended unexpectedly")??;
            subscription.cancel().await;

            match received.content()? {
                MessageContent::Heartbeat(heartbeat) => {
                    println!(
                        "received heartbeat {} from {}: state={}",
                        received.id, received.sender_agent_id, heartbeat.agent_state
                    );
                    Ok(())
                }
                other => bail!("unexpected content: {:?}", other),
            }
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_topics() {
        assert_eq!(Route::Task.topic(Some("A")).unwrap(), "agent:A:tasks");
        assert_eq!(Route::Result.topic(Some("t1")).unwrap(), "results:t1");
        assert_eq!(Route::Coordination.topic(Some("p1")).unwrap(), "project:p1:events");
        assert_eq!(Route::Collaboration.topic(None).unwrap(), "coordination:requests");
        assert_eq!(Route::System.topic(None).unwrap(), "broadcast:system");
        assert!(Route::Heartbeat.topic(None).is_err());
    }

    #[test]
    fn test_route_rejects_reserved_ids() {
        assert!(Route::Task.topic(Some("A:B")).is_err());
        assert!(Route::Result.topic(Some("t*")).is_err());
        assert!(Route::Coordination.topic(Some("")).is_err());
    }

    #[test]
    fn test_parse_publish() {
        let args = Commands::try_parse_from([
            "agentbus",
            "publish",
            "agent:A:tasks",
            "--type",
            "heartbeat",
            "--recipient",
            "A",
            "--recipient",
            "B",
        ])
        .unwrap();
        match args.command {
            Command::Publish {
                topic,
                message_type,
                recipients,
                ..
            } => {
                assert_eq!(topic, "agent:A:tasks");
                assert_eq!(message_type, "heartbeat");
                assert_eq!(recipients, vec!["A", "B"]);
            }
            _ => panic!("expected publish"),
        }
    }

    #[test]
    fn test_content_must_be_object() {
        assert!(parse_json_object(r#"{"a": 1}"#).is_ok());
        assert!(parse_json_object("[1]").is_err());
        assert!(parse_json_object("nope").is_err());
    }

    #[tokio::test]
    async fn test_demo_runs() {
        cmd_demo().await.unwrap();
    }

    #[tokio::test]
    async fn test_kv_on_memory_backend() {
        let broker = Broker::new(Arc::new(MemoryTransport::new()));
        broker.connect().await.unwrap();

        run_kv(
            &broker,
            &KvCommand::Set {
                key: "k".into(),
                value: "plain".into(),
                ttl: Some(30),
            },
        )
        .await
        .unwrap();
        assert_eq!(broker.get::<Value>("k").await.unwrap(), Some(Value::String("plain".into())));

        run_kv(&broker, &KvCommand::Del { key: "k".into() }).await.unwrap();
        assert_eq!(broker.get::<Value>("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_kv_error_still_reported() {
        let err = cmd_kv(
            &Settings::default(),
            &KvCommand::Set {
                key: "k".into(),
                value: "1".into(),
                ttl: Some(0),
            },
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("ttl"), "{err}");
    }
}
