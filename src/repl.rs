//! Line-oriented terminal client: keeps the session tree locally and talks to a
//! running proxy through [`HttpTransport`].

use std::io::Write;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

use crate::client::HttpTransport;
use crate::error::{ChatError, Result};
use crate::pipeline::{Pipeline, TurnEvent};
use crate::session::ChatSession;
use crate::settings::AgentConfigPatch;
use crate::tree::SessionTree;

const HELP: &str = "\
commands:
  <text>                 send a message in the active chat
  /split                 branch the active chat and switch to the branch
  /new                   start a new root chat
  /switch <id-prefix>    make another chat active
  /tree                  show all chats
  /history               show messages of the active chat
  /config <field>=<val>  set name, model, temperature or system
  /help                  this text
  /quit                  exit";

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Say(String),
    Split,
    New,
    Switch(String),
    Tree,
    History,
    Config(AgentConfigPatch),
    Help,
    Quit,
    Nothing,
}

pub fn parse_command(line: &str) -> Result<Command> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(Command::Nothing);
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Command::Say(line.to_string()));
    };
    let (name, arg) = match rest.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, arg.trim()),
        None => (rest, ""),
    };
    match name {
        "split" => Ok(Command::Split),
        "new" => Ok(Command::New),
        "tree" => Ok(Command::Tree),
        "history" => Ok(Command::History),
        "help" => Ok(Command::Help),
        "quit" | "exit" => Ok(Command::Quit),
        "switch" if !arg.is_empty() => Ok(Command::Switch(arg.to_string())),
        "switch" => Err(ChatError::Validation("usage: /switch <id-prefix>".into())),
        "config" => parse_config(arg).map(Command::Config),
        other => Err(ChatError::Validation(format!("unknown command /{other}, try /help"))),
    }
}

fn parse_config(arg: &str) -> Result<AgentConfigPatch> {
    let Some((field, value)) = arg.split_once('=') else {
        return Err(ChatError::Validation("usage: /config <field>=<value>".into()));
    };
    let value = value.trim().to_string();
    let mut patch = AgentConfigPatch::default();
    match field.trim() {
        "name" => patch.name = Some(value),
        "model" => patch.model = Some(value),
        "system" => patch.system_instruction = Some(value),
        "temperature" => {
            let t = value
                .parse::<f32>()
                .map_err(|_| ChatError::Validation(format!("not a number: {value}")))?;
            patch.temperature = Some(t);
        }
        other => return Err(ChatError::Validation(format!("unknown config field {other}"))),
    }
    patch.validate()?;
    Ok(patch)
}

fn short(id: uuid::Uuid) -> String {
    id.to_string()[..8].to_string()
}

pub fn render_tree(tree: &SessionTree) -> String {
    let active = tree.active_id();
    let mut out = String::new();
    for (depth, session) in tree.walk() {
        let marker = if session.id == active { '*' } else { ' ' };
        let busy = if session.in_flight() { " [busy]" } else { "" };
        out.push_str(&format!(
            "{}{} {} {} ({} messages){}\n",
            "  ".repeat(depth),
            marker,
            short(session.id),
            session.agent_config.name,
            session.messages.len(),
            busy,
        ));
    }
    out
}

pub fn render_history(session: &ChatSession) -> String {
    let cfg = &session.agent_config;
    let mut out = format!(
        "{} [{}] model={} temperature={}\n",
        cfg.name,
        short(session.id),
        cfg.model,
        cfg.temperature
    );
    for m in &session.messages {
        let content = if m.is_loading { "..." } else { m.content.as_str() };
        out.push_str(&format!("{:>9}: {}\n", m.role.as_str(), content));
    }
    out
}

pub struct Repl {
    pipeline: Pipeline,
    stream: bool,
}

impl Repl {
    pub fn new(transport: HttpTransport, stream: bool) -> Self {
        let pipeline = Pipeline::new(SessionTree::new().shared(), Arc::new(transport));
        Self { pipeline, stream }
    }

    /// Prints fragments of the active chat as they arrive.
    fn spawn_printer(&self) {
        let mut events = self.pipeline.subscribe();
        let tree = self.pipeline.tree().clone();
        tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "printer lagged");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                if tree.read().await.active_id() != event.session_id() {
                    continue;
                }
                match event {
                    TurnEvent::Started { .. } => {}
                    TurnEvent::Fragment { text, .. } => {
                        print!("{text}");
                        let _ = std::io::stdout().flush();
                    }
                    TurnEvent::Completed { .. } => println!(),
                    TurnEvent::Failed { error, .. } => {
                        println!();
                        eprintln!("error: {error}");
                    }
                }
            }
        });
    }

    async fn say(&self, text: String) {
        let session_id = self.pipeline.tree().read().await.active_id();
        let pipeline = self.pipeline.clone();
        let stream = self.stream;
        tokio::spawn(async move {
            let result = if stream {
                pipeline.run_turn(session_id, &text).await
            } else {
                pipeline.run_turn_unary(session_id, &text).await
            };
            if let Err(e) = result {
                eprintln!("error: {e}");
            }
        });
    }

    /// Returns `false` when the loop should stop.
    pub async fn execute(&self, command: Command) -> Result<bool> {
        match command {
            Command::Nothing => {}
            Command::Say(text) => self.say(text).await,
            Command::Split => {
                let mut tree = self.pipeline.tree().write().await;
                let active = tree.active_id();
                let id = tree.split_chat(active)?;
                tree.set_active(id)?;
                println!("branched {} -> {}", short(active), short(id));
            }
            Command::New => {
                let mut tree = self.pipeline.tree().write().await;
                let id = tree.create_session(None)?;
                tree.set_active(id)?;
                println!("new chat {}", short(id));
            }
            Command::Switch(prefix) => {
                let mut tree = self.pipeline.tree().write().await;
                let id = tree.find_by_prefix(&prefix)?;
                tree.set_active(id)?;
                print!("{}", render_history(tree.active()));
            }
            Command::Tree => print!("{}", render_tree(&*self.pipeline.tree().read().await)),
            Command::History => print!("{}", render_history(self.pipeline.tree().read().await.active())),
            Command::Config(patch) => {
                let mut tree = self.pipeline.tree().write().await;
                let active = tree.active_id();
                tree.update_agent_config(active, patch)?;
                if !tree.active().messages.is_empty() {
                    println!("note: the server keeps the settings this chat started with; /split to use the new ones");
                }
            }
            Command::Help => println!("{HELP}"),
            Command::Quit => return Ok(false),
        }
        Ok(true)
    }
}

pub async fn run(transport: HttpTransport, stream: bool) -> anyhow::Result<()> {
    match transport.status().await {
        Ok(status) => tracing::info!(server = %transport.base_url, %status, "connected"),
        Err(e) => tracing::warn!(server = %transport.base_url, error = %e, "server not reachable"),
    }
    let repl = Repl::new(transport, stream);
    repl.spawn_printer();
    println!("{HELP}");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let command = match parse_command(&line) {
            Ok(command) => command,
            Err(e) => {
                eprintln!("{e}");
                continue;
            }
        };
        match repl.execute(command).await {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => eprintln!("{e}"),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::NewMessage;

    #[test]
    fn plain_text_is_a_message() {
        assert_eq!(parse_command("  hello there ").unwrap(), Command::Say("hello there".into()));
        assert_eq!(parse_command("   ").unwrap(), Command::Nothing);
    }

    #[test]
    fn slash_commands() {
        assert_eq!(parse_command("/split").unwrap(), Command::Split);
        assert_eq!(parse_command("/switch ab12").unwrap(), Command::Switch("ab12".into()));
        assert_eq!(parse_command("/exit").unwrap(), Command::Quit);
        assert!(parse_command("/switch").is_err());
        assert!(parse_command("/bogus").is_err());
    }

    #[test]
    fn config_fields() {
        let Command::Config(p) = parse_command("/config temperature=0").unwrap() else { panic!() };
        assert_eq!(p.temperature, Some(0.0));
        let Command::Config(p) = parse_command("/config system=Be terse. Always.").unwrap() else { panic!() };
        assert_eq!(p.system_instruction.as_deref(), Some("Be terse. Always."));
        assert!(parse_command("/config temperature=3").is_err());
        assert!(parse_command("/config temperature=warm").is_err());
        assert!(parse_command("/config model=").is_err());
        assert!(parse_command("/config colour=red").is_err());
        assert!(parse_command("/config").is_err());
    }

    #[test]
    fn tree_rendering_marks_active_and_nests_branches() {
        let mut tree = SessionTree::new();
        let root = tree.active_id();
        tree.add_message(root, NewMessage::user("hi")).unwrap();
        let branch = tree.split_chat(root).unwrap();
        tree.set_active(branch).unwrap();

        let out = render_tree(&tree);
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], format!("  {} {} (1 messages)", short(root), crate::settings::DEFAULT_AGENT_NAME));
        assert!(lines[1].starts_with("  * ") && lines[1].contains(&short(branch)));
        assert!(lines[1].contains("(1 messages)"));
    }

    #[test]
    fn history_shows_placeholder_as_ellipsis() {
        let mut tree = SessionTree::new();
        let root = tree.active_id();
        tree.add_message(root, NewMessage::user("hi")).unwrap();
        tree.add_message(root, NewMessage::assistant_placeholder()).unwrap();
        let out = render_history(tree.get(root).unwrap());
        assert!(out.contains("user: hi"));
        assert!(out.contains("assistant: ..."));
    }

    #[tokio::test]
    async fn split_then_switch_back() {
        let repl = Repl::new(HttpTransport::new("http://127.0.0.1:9"), true);
        let root = repl.pipeline.tree().read().await.active_id();
        assert!(repl.execute(Command::Split).await.unwrap());
        let branch = repl.pipeline.tree().read().await.active_id();
        assert_ne!(root, branch);
        repl.execute(Command::Switch(root.to_string()[..8].to_string())).await.unwrap();
        assert_eq!(repl.pipeline.tree().read().await.active_id(), root);
        assert!(!repl.execute(Command::Quit).await.unwrap());
    }
}
