//! Operator-facing terminal surface: status lines and the one-shot pairing prompt.

use std::io::{self, BufRead, BufReader, Write};

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::{errors::Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusKind {
    Info,
    Success,
    Warning,
    Failure,
}

impl StatusKind {
    fn glyph(self) -> &'static str {
        match self {
            StatusKind::Info => "ℹ️",
            StatusKind::Success => "✅",
            StatusKind::Warning => "⚠️",
            StatusKind::Failure => "❌",
        }
    }
}

/// Where operator status messages go. Never routed back into chat.
pub trait OperatorConsole: Send + Sync {
    fn status(&self, kind: StatusKind, text: &str);
}

#[derive(Clone, Copy, Debug, Default)]
pub struct StdoutConsole;

impl OperatorConsole for StdoutConsole {
    fn status(&self, kind: StatusKind, text: &str) {
        println!("{} {text}", kind.glyph());
    }
}

/// Single-use source of operator input.
///
/// `ask` consumes the prompt, so the underlying input is released on both the
/// success and the failure path and cannot be asked twice.
#[async_trait]
pub trait PromptSource: Send {
    async fn ask(self: Box<Self>, question: &str) -> Result<String>;
}

/// Interactive prompt on stdin/stdout.
///
/// The read happens on a detached OS thread: an abandoned prompt never holds
/// up runtime shutdown.
#[derive(Debug, Default)]
pub struct StdinPrompt;

#[async_trait]
impl PromptSource for StdinPrompt {
    async fn ask(self: Box<Self>, question: &str) -> Result<String> {
        read_line_detached(question, io::stdout(), BufReader::new(io::stdin())).await
    }
}

async fn read_line_detached<W, R>(question: &str, mut out: W, mut input: R) -> Result<String>
where
    W: Write + Send + 'static,
    R: BufRead + Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    let question = question.to_string();
    std::thread::Builder::new()
        .name("wab-prompt".to_string())
        .spawn(move || {
            let _ = tx.send(prompt_blocking(&question, &mut out, &mut input));
        })?;

    match rx.await {
        Ok(Ok(Some(line))) => Ok(line),
        Ok(Ok(None)) => Err(Error::External(
            "stdin closed before an answer was entered".to_string(),
        )),
        Ok(Err(e)) => Err(Error::Io(e)),
        Err(_) => Err(Error::External("prompt thread exited early".to_string())),
    }
}

/// `None` on end of input.
fn prompt_blocking(
    question: &str,
    out: &mut impl Write,
    input: &mut impl BufRead,
) -> io::Result<Option<String>> {
    out.write_all(question.as_bytes())?;
    out.flush()?;

    let mut line = String::new();
    if input.read_line(&mut line)? == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim().to_string()))
}

/// Answer supplied ahead of time (e.g. `PAIRING_NUMBER`).
#[derive(Debug, Clone)]
pub struct PresetPrompt(pub String);

#[async_trait]
impl PromptSource for PresetPrompt {
    async fn ask(self: Box<Self>, _question: &str) -> Result<String> {
        Ok(self.0.trim().to_string())
    }
}
