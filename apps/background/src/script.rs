//! Line-oriented driver that plays the UI side of the extension.
//!
//! Each non-blank line of a script is one JSON command, for example
//! `{"connect": "dFrame-abc123"}` or
//! `{"send": {"endpoint": "dFrame-abc123", "event": "decrypt-message"}}`.
//! Lines starting with `#` are comments.

use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::{anyhow, bail, Context};
use channel::MemoryHost;
use messaging::EventHandler;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use shared::{
    domain::EndpointName,
    protocol::{Envelope, Event},
};
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinSet,
};
use tracing::{debug, warn};

/// How long a bare-kind `connect` waits for the matching surface request.
const SURFACE_WAIT: Duration = Duration::from_secs(1);
/// How long outstanding sends may take once the script has run out.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    /// Connects an endpoint. A bare kind tag connects the surface most recently
    /// requested for that kind.
    Connect(String),
    Emit(Message),
    Send(Message),
    /// Answers every future request for `event` on `endpoint` with `result`.
    Respond {
        endpoint: String,
        event: Event,
        #[serde(default)]
        result: Value,
    },
    Disconnect(String),
    SleepMs(u64),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Message {
    pub endpoint: String,
    pub event: Event,
    #[serde(default)]
    pub data: Value,
}

/// Everything the scripted endpoints see, printed as one JSON object per line.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Observation {
    Envelope { endpoint: String, envelope: Envelope },
    Reply { endpoint: String, event: Event, result: Value },
    Failed { endpoint: String, event: Event, error: String },
    Surface { name: String },
}

pub fn parse(source: &str) -> anyhow::Result<Vec<Command>> {
    source
        .lines()
        .enumerate()
        .filter(|(_, line)| {
            let line = line.trim();
            !line.is_empty() && !line.starts_with('#')
        })
        .map(|(index, line)| {
            serde_json::from_str(line.trim())
                .with_context(|| format!("script line {}: invalid command", index + 1))
        })
        .collect()
}

pub struct Console {
    host: Arc<MemoryHost>,
    endpoints: HashMap<String, EventHandler>,
    surfaces: broadcast::Receiver<EndpointName>,
    requested: HashMap<String, EndpointName>,
    observations: mpsc::UnboundedSender<Observation>,
    inflight: JoinSet<()>,
}

impl Console {
    pub fn new(host: Arc<MemoryHost>) -> (Self, mpsc::UnboundedReceiver<Observation>) {
        let (observations, rx) = mpsc::unbounded_channel();
        let surfaces = host.subscribe_surfaces();
        (
            Self {
                host,
                endpoints: HashMap::new(),
                surfaces,
                requested: HashMap::new(),
                observations,
                inflight: JoinSet::new(),
            },
            rx,
        )
    }

    /// Runs every command in order, then waits for outstanding sends.
    pub async fn run(&mut self, commands: Vec<Command>) -> anyhow::Result<()> {
        for command in commands {
            self.execute(command).await?;
        }
        self.drain().await;
        Ok(())
    }

    pub async fn execute(&mut self, command: Command) -> anyhow::Result<()> {
        debug!(?command, "script command");
        match command {
            Command::Connect(name) => self.connect(&name).await,
            Command::Emit(message) => {
                self.endpoint(&message.endpoint)?
                    .emit(message.event, message.data)?;
                Ok(())
            }
            Command::Send(message) => self.send(message),
            Command::Respond {
                endpoint,
                event,
                result,
            } => self.respond(&endpoint, event, result),
            Command::Disconnect(name) => {
                let handler = self
                    .endpoints
                    .remove(&name)
                    .ok_or_else(|| anyhow!("endpoint '{name}' is not connected"))?;
                handler.disconnect();
                Ok(())
            }
            Command::SleepMs(ms) => {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(())
            }
        }
    }

    /// Disconnects every scripted endpoint.
    pub fn close(&mut self) {
        for (_, handler) in self.endpoints.drain() {
            handler.disconnect();
        }
    }

    async fn connect(&mut self, name: &str) -> anyhow::Result<()> {
        let name = if name.contains('-') {
            name.to_string()
        } else {
            self.requested_surface(name).await?.to_string()
        };
        if self.endpoints.contains_key(&name) {
            bail!("endpoint '{name}' is already connected");
        }

        let handler = EventHandler::connect(&*self.host, &name)?;
        for event in Event::ALL {
            let observations = self.observations.clone();
            let endpoint = name.clone();
            handler.on(event.clone(), move |envelope| {
                let _ = observations.send(Observation::Envelope {
                    endpoint: endpoint.clone(),
                    envelope: envelope.clone(),
                });
            })?;
        }
        self.endpoints.insert(name, handler);
        Ok(())
    }

    fn send(&mut self, message: Message) -> anyhow::Result<()> {
        let pending = self
            .endpoint(&message.endpoint)?
            .send(message.event.clone(), message.data)?;
        let observations = self.observations.clone();
        // Sends run in the background so a script can answer the prompts they trigger.
        self.inflight.spawn(async move {
            let observation = match pending.await {
                Ok(result) => Observation::Reply {
                    endpoint: message.endpoint,
                    event: message.event,
                    result,
                },
                Err(err) => Observation::Failed {
                    endpoint: message.endpoint,
                    event: message.event,
                    error: err.to_string(),
                },
            };
            let _ = observations.send(observation);
        });
        Ok(())
    }

    fn respond(&mut self, endpoint: &str, event: Event, result: Value) -> anyhow::Result<()> {
        let handler = self.endpoint(endpoint)?.clone();
        let responder = handler.clone();
        handler.on(event, move |envelope| {
            let Some(id) = envelope.id.clone().filter(|_| envelope.is_request()) else {
                return;
            };
            if let Err(err) = responder.reply(id, envelope.event.clone(), Ok(result.clone())) {
                warn!(endpoint = %responder.name(), error = %err, "scripted reply failed");
            }
        })?;
        Ok(())
    }

    async fn requested_surface(&mut self, kind: &str) -> anyhow::Result<EndpointName> {
        self.collect_surfaces();
        if let Some(name) = self.requested.remove(kind) {
            return Ok(name);
        }
        tokio::time::timeout(SURFACE_WAIT, async {
            loop {
                match self.surfaces.recv().await {
                    Ok(name) => {
                        self.record_surface(&name);
                        if name.kind_tag() == kind {
                            self.requested.remove(kind);
                            return Ok(name);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => {
                        bail!("host stopped opening surfaces")
                    }
                }
            }
        })
        .await
        .with_context(|| format!("no surface of kind '{kind}' was requested"))?
    }

    fn collect_surfaces(&mut self) {
        loop {
            match self.surfaces.try_recv() {
                Ok(name) => self.record_surface(&name),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
    }

    fn record_surface(&mut self, name: &EndpointName) {
        self.requested
            .insert(name.kind_tag().to_string(), name.clone());
        let _ = self.observations.send(Observation::Surface {
            name: name.to_string(),
        });
    }

    fn endpoint(&self, name: &str) -> anyhow::Result<&EventHandler> {
        self.endpoints
            .get(name)
            .ok_or_else(|| anyhow!("endpoint '{name}' is not connected"))
    }

    async fn drain(&mut self) {
        let waited = tokio::time::timeout(DRAIN_GRACE, async {
            while self.inflight.join_next().await.is_some() {}
        })
        .await;
        if waited.is_err() {
            warn!(outstanding = self.inflight.len(), "sends still pending at end of script");
            self.inflight.abort_all();
        }
        self.collect_surfaces();
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use controllers::{kinds::register_all, Registry, Services};
    use crypto::PassthroughCrypto;
    use keyring::InMemoryKeyStore;
    use serde_json::json;

    use super::*;

    fn console() -> (Console, mpsc::UnboundedReceiver<Observation>, Registry) {
        let (host, incoming) = MemoryHost::new();
        let services = Services::new(
            Arc::new(PassthroughCrypto::new()),
            Arc::new(InMemoryKeyStore::new()),
            host.clone(),
        )
        .with_version("1.2.3")
        .with_watch_list(vec!["*.example.org".into()]);
        let registry = Registry::new(services);
        register_all(&registry, &HashMap::new()).expect("register kinds");
        tokio::spawn(registry.clone().serve(incoming));
        let (console, observations) = Console::new(host);
        (console, observations, registry)
    }

    fn collected(observations: &mut mpsc::UnboundedReceiver<Observation>) -> Vec<Observation> {
        let mut seen = Vec::new();
        while let Ok(observation) = observations.try_recv() {
            seen.push(observation);
        }
        seen
    }

    #[test]
    fn parses_commands_and_skips_comments() {
        let commands = parse(
            r#"
            # open the main content script
            {"connect": "mainCS-main"}

            {"send": {"endpoint": "mainCS-main", "event": "get-watch-list"}}
            {"respond": {"endpoint": "eFrame-1", "event": "get-recipients", "result": {"recipients": []}}}
            {"sleep_ms": 10}
            "#,
        )
        .expect("parse");

        assert_eq!(commands.len(), 4);
        assert_eq!(commands[0], Command::Connect("mainCS-main".into()));
        assert_eq!(
            commands[1],
            Command::Send(Message {
                endpoint: "mainCS-main".into(),
                event: Event::GetWatchList,
                data: Value::Null,
            })
        );
        assert_eq!(commands[3], Command::SleepMs(10));
    }

    #[test]
    fn parse_errors_name_the_line() {
        let err = parse("{\"connect\": \"app-main\"}\n{\"launch\": 1}\n").expect_err("invalid");
        assert!(err.to_string().contains("line 2"), "{err}");
    }

    #[tokio::test]
    async fn replies_are_observed() {
        let (mut console, mut observations, _registry) = console();
        console
            .run(parse(
                r#"
                {"connect": "app-main"}
                {"send": {"endpoint": "app-main", "event": "get-version"}}
                "#,
            )
            .expect("parse"))
            .await
            .expect("run");

        let seen = collected(&mut observations);
        assert!(seen.contains(&Observation::Reply {
            endpoint: "app-main".into(),
            event: Event::GetVersion,
            result: json!("1.2.3"),
        }));
    }

    #[tokio::test]
    async fn a_bare_kind_connects_the_requested_surface() {
        let (mut console, mut observations, _registry) = console();
        console
            .run(parse(
                r#"
                {"connect": "menu-1"}
                {"send": {"endpoint": "menu-1", "event": "browser-action", "data": {"action": "generate-key"}}}
                {"sleep_ms": 50}
                {"connect": "keyGenDialog"}
                "#,
            )
            .expect("parse"))
            .await
            .expect("run");

        let seen = collected(&mut observations);
        let surface = seen
            .iter()
            .find_map(|observation| match observation {
                Observation::Surface { name } => Some(name.clone()),
                _ => None,
            })
            .expect("surface requested");
        assert!(surface.starts_with("keyGenDialog-"));
        assert!(console.endpoints.contains_key(&surface));
    }

    #[tokio::test]
    async fn unknown_endpoints_are_script_errors() {
        let (mut console, _observations, _registry) = console();
        let err = console
            .execute(Command::Disconnect("dFrame-1".into()))
            .await
            .expect_err("not connected");
        assert!(err.to_string().contains("dFrame-1"));
    }
}
