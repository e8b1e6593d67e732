//! Speech output seam.
//!
//! The reconciler and announcer only ever call [`Speaker::speak`]; what
//! that does (TTS engine, log line, test recorder) is up to the host.

use std::process::Stdio;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Something that can say a line of text.
pub trait Speaker: Send {
    fn speak(&mut self, text: &str);
}

impl<S: Speaker + ?Sized> Speaker for Box<S> {
    fn speak(&mut self, text: &str) {
        (**self).speak(text)
    }
}

/// Logs instead of speaking.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSpeaker;

impl Speaker for LogSpeaker {
    fn speak(&mut self, text: &str) {
        log::info!("Speaking: {text}");
    }
}

/// Runs an external TTS program with the text as its last argument,
/// e.g. `espeak` or `say`.
///
/// Utterances are queued to one background task that runs the program to
/// completion before starting the next, so a burst never overlaps. Must be
/// used inside a tokio runtime; clones share the queue once it exists.
#[derive(Debug, Clone)]
pub struct CommandSpeaker {
    program: String,
    args: Vec<String>,
    queue: Option<mpsc::UnboundedSender<String>>,
}

impl CommandSpeaker {
    /// Parse a whitespace-separated command line. `None` if it is blank.
    pub fn from_command_line(command: &str) -> Option<Self> {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self {
            program,
            args: parts.collect(),
            queue: None,
        })
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

impl Speaker for CommandSpeaker {
    fn speak(&mut self, text: &str) {
        log::debug!("Speaking via {}: {text}", self.program);
        let queue = self
            .queue
            .get_or_insert_with(|| spawn_voice(self.program.clone(), self.args.clone()));
        if queue.send(text.to_string()).is_err() {
            log::error!("Speech task for {} is gone", self.program);
            self.queue = None;
        }
    }
}

/// Run `program` once per queued line, strictly one after another.
fn spawn_voice(program: String, args: Vec<String>) -> mpsc::UnboundedSender<String> {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            let status = tokio::process::Command::new(&program)
                .args(&args)
                .arg(&text)
                .stdin(Stdio::null())
                .status()
                .await;
            match status {
                Ok(status) if !status.success() => log::warn!("{program} exited with {status}"),
                Ok(_) => {}
                Err(e) => log::error!("Failed to run {program}: {e}"),
            }
        }
    });
    tx
}

/// Records everything spoken; clones share the same log.
#[derive(Debug, Default, Clone)]
pub struct RecordingSpeaker {
    spoken: Arc<Mutex<Vec<String>>>,
}

impl RecordingSpeaker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spoken(&self) -> Vec<String> {
        self.spoken.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn count(&self) -> usize {
        self.spoken.lock().map(|s| s.len()).unwrap_or(0)
    }
}

impl Speaker for RecordingSpeaker {
    fn speak(&mut self, text: &str) {
        if let Ok(mut spoken) = self.spoken.lock() {
            spoken.push(text.to_string());
        }
    }
}
