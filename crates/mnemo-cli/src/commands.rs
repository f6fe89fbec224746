//! Slash-command grammar of the shell.
//!
//! Parsing is pure so every command form is unit tested without a store.
//! Flags (`--name value` or bare `--name`) may appear anywhere after the
//! command word; the remaining words form the free text argument.

use std::collections::HashMap;
use std::str::FromStr;

use mnemo_types::{MemoryType, ProtectionLevel};
use uuid::Uuid;

/// Flags that take no value.
const SWITCHES: [&str; 2] = ["rerank", "fresh"];

#[derive(Debug, Clone, PartialEq)]
pub struct RememberArgs {
    pub memory_type: MemoryType,
    pub content: String,
    pub importance: Option<f64>,
    pub protection_level: Option<ProtectionLevel>,
    pub financial_impact: Option<f64>,
    pub category: Option<String>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonAction {
    Start,
    Stop,
    Once,
    Status,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Help,
    Settings,
    Quit,
    Remember(RememberArgs),
    Recall {
        query: String,
        limit: Option<usize>,
        rerank: bool,
        fresh: bool,
    },
    Stale {
        max: usize,
    },
    Ack {
        ids: Vec<Uuid>,
    },
    Trigger {
        message: String,
    },
    /// A full turn; also what a line without a leading `/` means.
    Context {
        message: String,
    },
    Patterns,
    Rules,
    Daemon(DaemonAction),
    Flush,
}

struct Args<'a> {
    words: Vec<&'a str>,
    flags: HashMap<&'a str, Option<&'a str>>,
}

impl<'a> Args<'a> {
    fn parse(rest: &'a str) -> Result<Self, String> {
        let mut words = Vec::new();
        let mut flags = HashMap::new();
        let mut tokens = rest.split_whitespace();
        while let Some(token) = tokens.next() {
            match token.strip_prefix("--") {
                Some(name) if SWITCHES.contains(&name) => {
                    flags.insert(name, None);
                }
                Some(name) if !name.is_empty() => {
                    let value = tokens.next().ok_or_else(|| format!("--{name} needs a value"))?;
                    flags.insert(name, Some(value));
                }
                _ => words.push(token),
            }
        }
        Ok(Self { words, flags })
    }

    fn text(&self) -> String {
        self.words.join(" ")
    }

    fn switch(&self, name: &str) -> bool {
        self.flags.contains_key(name)
    }

    fn value<T: FromStr>(&self, name: &str) -> Result<Option<T>, String> {
        match self.flags.get(name).copied().flatten() {
            None => Ok(None),
            Some(raw) => raw
                .parse()
                .map(Some)
                .map_err(|_| format!("invalid value '{raw}' for --{name}")),
        }
    }

    fn reject_unknown(&self, allowed: &[&str]) -> Result<(), String> {
        match self.flags.keys().find(|k| !allowed.contains(k)) {
            Some(unknown) => Err(format!("unknown flag --{unknown}")),
            None => Ok(()),
        }
    }
}

/// Parse one input line.  `Ok(None)` means the line was blank.
pub fn parse(line: &str) -> Result<Option<Command>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let Some(body) = line.strip_prefix('/') else {
        return Ok(Some(Command::Context {
            message: line.to_string(),
        }));
    };
    let (word, rest) = body.split_once(char::is_whitespace).unwrap_or((body, ""));
    let args = Args::parse(rest)?;

    let command = match word {
        "help" | "?" => Command::Help,
        "settings" => Command::Settings,
        "quit" | "exit" => Command::Quit,
        "remember" => parse_remember(&args)?,
        "recall" => {
            args.reject_unknown(&["limit", "rerank", "fresh"])?;
            Command::Recall {
                query: non_empty(args.text(), "/recall needs a query")?,
                limit: args.value("limit")?,
                rerank: args.switch("rerank"),
                fresh: args.switch("fresh"),
            }
        }
        "stale" => Command::Stale {
            max: match args.words.first() {
                Some(raw) => raw.parse().map_err(|_| format!("invalid count '{raw}'"))?,
                None => 5,
            },
        },
        "ack" => {
            let ids = args
                .words
                .iter()
                .map(|raw| Uuid::parse_str(raw).map_err(|_| format!("invalid memory id '{raw}'")))
                .collect::<Result<Vec<_>, _>>()?;
            if ids.is_empty() {
                return Err("/ack needs at least one memory id".to_string());
            }
            Command::Ack { ids }
        }
        "trigger" => Command::Trigger {
            message: non_empty(args.text(), "/trigger needs a message")?,
        },
        "context" => Command::Context {
            message: non_empty(args.text(), "/context needs a message")?,
        },
        "patterns" => Command::Patterns,
        "rules" => Command::Rules,
        "daemon" => Command::Daemon(match args.words.first().copied() {
            Some("start") => DaemonAction::Start,
            Some("stop") => DaemonAction::Stop,
            Some("once") => DaemonAction::Once,
            Some("status") | None => DaemonAction::Status,
            Some(other) => return Err(format!("unknown daemon action '{other}' (start|stop|once|status)")),
        }),
        "flush" => Command::Flush,
        other => return Err(format!("unknown command '/{other}'")),
    };
    Ok(Some(command))
}

fn parse_remember(args: &Args<'_>) -> Result<Command, String> {
    args.reject_unknown(&["importance", "level", "impact", "category", "tags"])?;
    let (kind, content) = args
        .words
        .split_first()
        .ok_or("usage: /remember <fact|lesson|pattern|rule> <text> [--importance 0.8] [--level 0-3]")?;
    let memory_type = MemoryType::from_str(kind).map_err(|e| e.to_string())?;

    let protection_level = match args.value::<u8>("level")? {
        Some(raw) => Some(ProtectionLevel::try_from(raw).map_err(|e| e.to_string())?),
        None => None,
    };
    let importance = args.value::<f64>("importance")?;
    if let Some(score) = importance
        && !(0.0..=1.0).contains(&score)
    {
        return Err(format!("--importance {score} is outside [0, 1]"));
    }

    Ok(Command::Remember(RememberArgs {
        memory_type,
        content: non_empty(content.join(" "), "/remember needs the memory text")?,
        importance,
        protection_level,
        financial_impact: args.value("impact")?,
        category: args.value("category")?,
        tags: args
            .value::<String>("tags")?
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default(),
    }))
}

fn non_empty(text: String, message: &str) -> Result<String, String> {
    if text.trim().is_empty() {
        Err(message.to_string())
    } else {
        Ok(text)
    }
}
