//! Stdout side-channel protocol.
//!
//! Supervisors scrape these lines, so their text is fixed:
//! `[Step n/total]`, `PREVIEW:<path>` and `GENERATED_PROMPT:<text>`.

use std::io::Write;
use std::path::PathBuf;

pub const PREVIEW_PREFIX: &str = "PREVIEW:";
pub const GENERATED_PROMPT_PREFIX: &str = "GENERATED_PROMPT:";

#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    Step { step: u32, total: u32 },
    Preview(PathBuf),
    GeneratedPrompt(String),
}

impl ProgressEvent {
    /// The protocol line for this event, without a trailing newline.
    pub fn to_line(&self) -> String {
        match self {
            ProgressEvent::Step { step, total } => format!("[Step {step}/{total}]"),
            ProgressEvent::Preview(path) => format!("{PREVIEW_PREFIX}{}", path.display()),
            ProgressEvent::GeneratedPrompt(text) => format!("{GENERATED_PROMPT_PREFIX}{text}"),
        }
    }

    /// Recover an event from one line of worker output. Unrelated lines give `None`.
    pub fn parse_line(line: &str) -> Option<ProgressEvent> {
        let line = line.trim_end_matches(['\r', '\n']);
        if let Some(path) = line.strip_prefix(PREVIEW_PREFIX) {
            return Some(ProgressEvent::Preview(PathBuf::from(path.trim())));
        }
        if let Some(text) = line.strip_prefix(GENERATED_PROMPT_PREFIX) {
            return Some(ProgressEvent::GeneratedPrompt(text.trim().to_string()));
        }
        // "Step n/total" anywhere in the line.
        let rest = &line[line.find("Step ")? + "Step ".len()..];
        let (step, rest) = rest.split_once('/')?;
        let total: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
        Some(ProgressEvent::Step {
            step: step.trim().parse().ok()?,
            total: total.parse().ok()?,
        })
    }

    /// Completion percentage for step events; capped at 99 until the job finishes.
    pub fn percent(&self) -> Option<u32> {
        match self {
            ProgressEvent::Step { step, total } if *total > 0 => {
                Some(((*step as u64 * 100 / *total as u64) as u32).min(99))
            }
            _ => None,
        }
    }
}

impl std::fmt::Display for ProgressEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_line())
    }
}

/// Receives progress events. Must not block: it runs inside the engine's step loop.
pub trait ProgressSink: Send {
    fn emit(&mut self, event: ProgressEvent);
}

/// Writes protocol lines to stdout and flushes each one.
#[derive(Debug, Default)]
pub struct StdoutSink;

impl ProgressSink for StdoutSink {
    fn emit(&mut self, event: ProgressEvent) {
        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        if let Err(e) = writeln!(out, "{}", event.to_line()).and_then(|_| out.flush()) {
            tracing::warn!(error = %e, "failed to write progress line");
        }
    }
}

/// Drops every event.
#[derive(Debug, Default)]
pub struct NullSink;

impl ProgressSink for NullSink {
    fn emit(&mut self, _event: ProgressEvent) {}
}

/// Forwards events to a channel, for callers that print them from another thread.
pub struct ChannelSink(pub std::sync::mpsc::Sender<ProgressEvent>);

impl ProgressSink for ChannelSink {
    fn emit(&mut self, event: ProgressEvent) {
        // Receiver gone means nobody is listening any more.
        let _ = self.0.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_formats() {
        assert_eq!(ProgressEvent::Step { step: 5, total: 50 }.to_line(), "[Step 5/50]");
        assert_eq!(
            ProgressEvent::Preview(PathBuf::from("/tmp/p/step_005.png")).to_line(),
            "PREVIEW:/tmp/p/step_005.png"
        );
        assert_eq!(
            ProgressEvent::GeneratedPrompt("fair skin".into()).to_line(),
            "GENERATED_PROMPT:fair skin"
        );
    }

    #[test]
    fn test_parse_line() {
        assert_eq!(
            ProgressEvent::parse_line("[Step 12/40]\n"),
            Some(ProgressEvent::Step { step: 12, total: 40 })
        );
        assert_eq!(
            ProgressEvent::parse_line("INFO Step 3/20 done"),
            Some(ProgressEvent::Step { step: 3, total: 20 })
        );
        assert_eq!(
            ProgressEvent::parse_line("PREVIEW:/a/b.png"),
            Some(ProgressEvent::Preview(PathBuf::from("/a/b.png")))
        );
        assert_eq!(
            ProgressEvent::parse_line("GENERATED_PROMPT: young adult"),
            Some(ProgressEvent::GeneratedPrompt("young adult".into()))
        );
        assert_eq!(ProgressEvent::parse_line("loading models"), None);
        assert_eq!(ProgressEvent::parse_line("Step x/10"), None);
    }

    #[test]
    fn test_percent_capped() {
        assert_eq!(ProgressEvent::Step { step: 25, total: 50 }.percent(), Some(50));
        assert_eq!(ProgressEvent::Step { step: 50, total: 50 }.percent(), Some(99));
        assert_eq!(ProgressEvent::Step { step: 1, total: 0 }.percent(), None);
        assert_eq!(ProgressEvent::Preview(PathBuf::new()).percent(), None);
    }

    #[test]
    fn test_channel_sink() {
        let (tx, rx) = std::sync::mpsc::channel();
        let mut sink = ChannelSink(tx);
        sink.emit(ProgressEvent::Step { step: 1, total: 2 });
        assert_eq!(rx.recv().unwrap(), ProgressEvent::Step { step: 1, total: 2 });
    }
}
