//! Terminal side of a peer: turning typed lines into commands, and actions into text.

use chrono::NaiveTime;
use ring_core::{ChatLine, Notice};

/// What the user asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Broadcast(String),
    Direct { target: String, text: String },
    Leave,
}

#[derive(Debug, Default)]
enum State {
    #[default]
    Idle,
    Target,
    Text {
        target: String,
    },
}

/// Line-at-a-time command reader.
///
/// `disconnect` leaves; `direct` asks for a target then the text; anything else is broadcast.
#[derive(Debug, Default)]
pub struct LineParser {
    state: State,
}

impl LineParser {
    pub fn feed(&mut self, line: &str) -> Option<Command> {
        let line = line.trim_end_matches(['\r', '\n']);
        match std::mem::take(&mut self.state) {
            State::Idle => match line.trim() {
                "" => None,
                "disconnect" => Some(Command::Leave),
                "direct" => {
                    self.state = State::Target;
                    None
                }
                _ => Some(Command::Broadcast(line.to_string())),
            },
            State::Target => {
                let target = line.trim();
                if target.is_empty() {
                    self.state = State::Target;
                } else {
                    self.state = State::Text {
                        target: target.to_string(),
                    };
                }
                None
            }
            State::Text { target } => Some(Command::Direct {
                target,
                text: line.to_string(),
            }),
        }
    }

    /// Question to show before the next line, if one is expected.
    pub fn prompt(&self) -> Option<&'static str> {
        match self.state {
            State::Idle => None,
            State::Target => Some("to whom?"),
            State::Text { .. } => Some("message:"),
        }
    }
}

/// `[HH:MM] [origin]: text`, stamped with the UTC time of display.
pub fn render_line(line: &ChatLine, at: NaiveTime) -> String {
    let stamp = at.format("%H:%M");
    if line.direct {
        format!("[{stamp}] [{}](direct): {}", line.origin, line.text)
    } else {
        format!("[{stamp}] [{}]: {}", line.origin, line.text)
    }
}

pub fn render_notice(notice: &Notice) -> String {
    match notice {
        Notice::Joined { prev, next_1 } => format!("* joined the ring (between {prev} and {next_1})"),
        Notice::Alone => "* no other users in the ring".to_string(),
        Notice::TargetMissing(target) => format!("* user {target} does not exist"),
        Notice::DirectDelivered(target) => format!("* delivered to {target}"),
        Notice::DeliveryAbandoned(line) => format!("* gave up delivering: {}", line.text),
        Notice::Left => "* left the ring".to_string(),
        Notice::Rejoining => "* lost track of the ring; rejoining".to_string(),
    }
}
