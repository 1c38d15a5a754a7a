use anyhow::Result;
use flume::{Receiver, RecvTimeoutError};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use companion_core::event::CompanionEvent;
use companion_core::orchestrator::Companion;
use companion_core::vision::load_image_base64;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

const HELP: &str = "\
Commands:
  /poke            poke your companion
  /look PATH       show an image file to your companion
  /history         list the conversation log
  /delete ID       delete one turn
  /memories        list long-term memories
  /forget ID       delete one memory
  /affinity        show the current affinity
  /reset           reset affinity to 0
  /clear           clear the conversation log (memories are kept)
  /help            show this help
  /quit            exit
Anything else is sent as a message.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Say(String),
    Poke,
    Look(PathBuf),
    History,
    Delete(usize),
    Memories,
    Forget(usize),
    Affinity,
    Reset,
    Clear,
    Help,
    Quit,
    Invalid(String),
    Empty,
}

pub fn parse_command(line: &str) -> Command {
    let line = line.trim();
    if line.is_empty() {
        return Command::Empty;
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Command::Say(line.to_string());
    };

    let (name, arg) = match rest.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, arg.trim()),
        None => (rest, ""),
    };
    let id = || arg.parse::<usize>().ok();

    match name {
        "poke" => Command::Poke,
        "look" if !arg.is_empty() => Command::Look(PathBuf::from(arg)),
        "history" => Command::History,
        "delete" => id().map(Command::Delete).unwrap_or_else(|| invalid("/delete needs a turn ID")),
        "memories" => Command::Memories,
        "forget" => id()
            .map(Command::Forget)
            .unwrap_or_else(|| invalid("/forget needs a memory ID")),
        "affinity" => Command::Affinity,
        "reset" => Command::Reset,
        "clear" => Command::Clear,
        "help" => Command::Help,
        "quit" | "exit" => Command::Quit,
        "look" => invalid("/look needs an image path"),
        other => invalid(&format!("Unknown command /{}", other)),
    }
}

fn invalid(message: &str) -> Command {
    Command::Invalid(message.to_string())
}

/// Line-oriented presentation loop. Owns stdout; background work reports via events.
pub struct ConsoleApp {
    companion: Arc<Companion>,
    event_rx: Receiver<CompanionEvent>,
    input_rx: Receiver<String>,
}

impl ConsoleApp {
    pub fn new(companion: Arc<Companion>, event_rx: Receiver<CompanionEvent>) -> Self {
        let (input_tx, input_rx) = flume::unbounded();
        std::thread::spawn(move || {
            for line in io::stdin().lock().lines() {
                match line {
                    Ok(line) => {
                        if input_tx.send(line).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::error!("Failed to read stdin: {}", e);
                        break;
                    }
                }
            }
        });

        Self {
            companion,
            event_rx,
            input_rx,
        }
    }

    pub fn run(&mut self) -> Result<()> {
        println!(
            "{} is here. Type /help for commands.",
            self.companion.user().pet_name()
        );
        self.prompt();

        loop {
            while let Ok(event) = self.event_rx.try_recv() {
                self.handle_event(event);
            }

            match self.input_rx.recv_timeout(POLL_INTERVAL) {
                Ok(line) => {
                    if !self.handle_command(parse_command(&line)) {
                        break;
                    }
                    self.prompt();
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        tracing::info!("Console closed");
        Ok(())
    }

    fn prompt(&self) {
        print!("> ");
        let _ = io::stdout().flush();
    }

    fn handle_event(&self, event: CompanionEvent) {
        let pet = self.companion.user().pet_name();
        match event {
            CompanionEvent::ClearDisplay => {}
            CompanionEvent::ResponseReady(text) => {
                println!("\n{}: {}", pet, text);
                self.companion.display_finished();
            }
            CompanionEvent::TurnCompleted => self.prompt(),
            CompanionEvent::AffinityTierChanged {
                old_label,
                new_label,
                score,
            } => {
                println!("\n[{} now feels: {} -> {} ({})]", pet, old_label, new_label, score);
            }
            CompanionEvent::Announcement(text) => {
                println!("\n{}: {}", pet, text);
                self.companion.display_finished();
                self.prompt();
            }
            CompanionEvent::MemoryConsolidated {
                memory_count,
                processed_count,
            } => {
                tracing::debug!(
                    "Memory now holds {} entries ({} turns processed)",
                    memory_count,
                    processed_count
                );
            }
        }
    }

    /// Returns false when the loop should stop.
    fn handle_command(&self, command: Command) -> bool {
        match command {
            Command::Empty => {}
            Command::Say(text) => {
                if let Err(e) = self.companion.send_message(&text) {
                    println!("({})", e);
                }
            }
            Command::Poke => {
                let turn = self.companion.poke();
                println!("[{}]", turn.content);
            }
            Command::Look(path) => match load_image_base64(&path) {
                Ok(image) => {
                    if let Err(e) = self.companion.observe_image(image) {
                        println!("({})", e);
                    }
                }
                Err(e) => println!("(Could not load image: {:#})", e),
            },
            Command::History => {
                let turns = self.companion.log().all_turns();
                if turns.is_empty() {
                    println!("(no conversation yet)");
                }
                for turn in turns {
                    let delta = turn
                        .affinity_delta
                        .map(|d| format!(" [{:+}]", d))
                        .unwrap_or_default();
                    println!(
                        "{:>4} {} {:?}: {}{}",
                        turn.id,
                        turn.timestamp.format("%Y-%m-%d %H:%M:%S"),
                        turn.role,
                        turn.content,
                        delta
                    );
                }
            }
            Command::Delete(id) => {
                if self.companion.log().delete(id) {
                    println!("(deleted turn {})", id);
                } else {
                    println!("(no turn with ID {})", id);
                }
            }
            Command::Memories => {
                let memories = self.companion.memory().memories();
                if memories.is_empty() {
                    println!("(no long-term memories yet)");
                }
                for memory in memories {
                    println!(
                        "{:>3} {} {}",
                        memory.id,
                        memory.timestamp.format("%Y-%m-%d %H:%M:%S"),
                        memory.content
                    );
                }
            }
            Command::Forget(id) => {
                if self.companion.memory().delete_memory(id) {
                    println!("(forgot memory {})", id);
                } else {
                    println!("(no memory with ID {})", id);
                }
            }
            Command::Affinity => println!("{}", self.companion.affinity().describe()),
            Command::Reset => {
                self.companion.affinity().reset();
                println!("{}", self.companion.affinity().describe());
            }
            Command::Clear => {
                if self.companion.memory().clear_history() {
                    println!("(conversation log cleared, memories kept)");
                } else {
                    println!("(memory consolidation is running, try again shortly)");
                }
            }
            Command::Help => println!("{}", HELP),
            Command::Invalid(message) => println!("({})", message),
            Command::Quit => return false,
        }
        true
    }
}
