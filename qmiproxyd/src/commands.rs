// src/commands.rs

//! Text commands sent by SMS to the reserved number.
//!
//! The interpreter answers with a reply that goes back to the user as an
//! injected SMS, and may ask the proxy loop to act on something right away.

use chrono::{DateTime, FixedOffset, Local, TimeZone};
use std::sync::{Arc, Mutex};

use crate::constants::PROXY_VERSION;
use crate::error::ProxyError;
use crate::scheduler::{self, Command, TaskMode, TaskRequest, TaskTable, TaskType};

/// Seconds the host wake line is held for a scheduled wake.
const WAKE_HOLD_SECS: i32 = 10;

const HELP: &str = "Commands: call me [in|at HH:MM], remind me in|at HH:MM <text>, \
wake host in|at HH:MM, dnd on|off, dnd off in|at HH:MM, tasks, cancel <id>, version";

/// A reply to the user and an optional immediate action.
#[derive(Debug, Eq, PartialEq, Clone)]
pub struct Reply {
    pub text: String,
    pub command: Option<Command>,
}

impl Reply {
    fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            command: None,
        }
    }

    fn with(text: impl Into<String>, command: Command) -> Self {
        Self {
            text: text.into(),
            command: Some(command),
        }
    }
}

pub trait CommandInterpreter: Send {
    fn interpret(&mut self, text: &str) -> Reply;
}

/// The built-in interpreter, backed by the scheduler's task table.
pub struct ChatCommands {
    tasks: Arc<Mutex<TaskTable>>,
    clock: fn() -> DateTime<FixedOffset>,
}

fn local_now() -> DateTime<FixedOffset> {
    Local::now().fixed_offset()
}

/// Parses `HH:MM`; hours are capped at 23 for wall-clock times.
fn parse_time(token: &str, mode: TaskMode) -> Option<(u8, u8)> {
    let (h, m) = token.split_once(':')?;
    let hour: u8 = h.parse().ok()?;
    let minute: u8 = m.parse().ok()?;
    let max_hour = if mode == TaskMode::AtTime { 23 } else { 99 };
    (hour <= max_hour && minute < 60).then_some((hour, minute))
}

fn parse_mode(token: &str) -> Option<TaskMode> {
    match token {
        "in" => Some(TaskMode::Countdown),
        "at" => Some(TaskMode::AtTime),
        _ => None,
    }
}

impl ChatCommands {
    pub fn new(tasks: Arc<Mutex<TaskTable>>) -> Self {
        Self {
            tasks,
            clock: local_now,
        }
    }

    #[cfg(test)]
    fn with_clock(tasks: Arc<Mutex<TaskTable>>, clock: fn() -> DateTime<FixedOffset>) -> Self {
        Self { tasks, clock }
    }

    /// Schedules `kind` from a `in|at HH:MM` pair of words.
    fn schedule(&self, kind: TaskType, words: &[&str], param: i32, arg: &str) -> Reply {
        let (Some(mode_word), Some(time_word)) = (words.first(), words.get(1)) else {
            return Reply::text("Missing time: use 'in HH:MM' or 'at HH:MM'");
        };
        let Some(mode) = parse_mode(mode_word) else {
            return Reply::text(format!("Expected 'in' or 'at', got '{}'", mode_word));
        };
        let Some((hour, minute)) = parse_time(time_word, mode) else {
            return Reply::text(format!("Invalid time '{}'", time_word));
        };
        let request = TaskRequest {
            kind,
            param,
            mode,
            hour,
            minute,
            arg: arg.to_string(),
        };
        let now = (self.clock)();
        let added = scheduler::lock(&self.tasks).add_task(request, &now);
        match added {
            Ok(id) => {
                let exec = scheduler::lock(&self.tasks).get(id).map(|t| t.exec_time).unwrap_or_default();
                Reply::text(format!("Task {} scheduled for {}", id, format_time(&now, exec)))
            }
            Err(ProxyError::TableFull) => Reply::text("Sorry, the task list is full"),
            Err(e) => Reply::text(format!("Could not schedule: {}", e)),
        }
    }

    fn list_tasks(&self) -> Reply {
        let now = (self.clock)();
        let table = scheduler::lock(&self.tasks);
        let lines: Vec<String> = table
            .pending()
            .map(|(id, task)| {
                let mut line = format!("{}: {:?} at {}", id, task.kind, format_time(&now, task.exec_time));
                if !task.arg.is_empty() {
                    line.push_str(&format!(" ({})", task.arg));
                }
                line
            })
            .collect();
        if lines.is_empty() {
            Reply::text("No pending tasks")
        } else {
            Reply::text(lines.join("\n"))
        }
    }

    fn cancel(&self, id: Option<&&str>) -> Reply {
        let Some(id) = id.and_then(|w| w.parse::<usize>().ok()) else {
            return Reply::text("Usage: cancel <id>");
        };
        if scheduler::lock(&self.tasks).remove_task(id) {
            Reply::text(format!("Task {} cancelled", id))
        } else {
            Reply::text(format!("No pending task {}", id))
        }
    }
}

fn format_time(now: &DateTime<FixedOffset>, timestamp: i64) -> String {
    now.timezone()
        .timestamp_opt(timestamp, 0)
        .single()
        .map(|dt| dt.format("%H:%M %d/%m").to_string())
        .unwrap_or_else(|| timestamp.to_string())
}

/// Text following the `skip`-th whitespace-separated word, original case preserved.
fn rest_after(text: &str, skip: usize) -> &str {
    let mut rest = text.trim_start();
    for _ in 0..skip {
        rest = rest
            .split_once(char::is_whitespace)
            .map_or("", |(_, tail)| tail)
            .trim_start();
    }
    rest.trim_end()
}

impl CommandInterpreter for ChatCommands {
    fn interpret(&mut self, text: &str) -> Reply {
        let lowered = text.trim().to_lowercase();
        let words: Vec<&str> = lowered.split_whitespace().collect();
        match words.as_slice() {
            [] | ["help"] => Reply::text(HELP),
            ["version"] => Reply::text(format!("qmiproxyd {}", PROXY_VERSION)),
            ["call", "me"] => Reply::with("Calling you now", Command::StartCall),
            ["call", "me", rest @ ..] => self.schedule(TaskType::Call, rest, 0, ""),
            ["remind", "me", rest @ ..] => {
                let note = rest_after(text, 4);
                if note.is_empty() {
                    return Reply::text("What should I remind you of?");
                }
                self.schedule(TaskType::Sms, rest, 0, note)
            }
            ["wake", "host", rest @ ..] => self.schedule(TaskType::WakeHost, rest, WAKE_HOLD_SECS, ""),
            ["dnd", "on"] => Reply::with("Do not disturb is on", Command::SetDoNotDisturb(true)),
            ["dnd", "off"] => Reply::with("Do not disturb is off", Command::SetDoNotDisturb(false)),
            ["dnd", "off", rest @ ..] => self.schedule(TaskType::ClearDoNotDisturb, rest, 0, ""),
            ["tasks"] => self.list_tasks(),
            ["cancel", rest @ ..] => self.cancel(rest.first()),
            _ => Reply::text("Unknown command, send 'help' for a list"),
        }
    }
}
