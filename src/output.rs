//! Structured record emission.
//!
//! Every lifecycle and I/O event renders as one line on stdout:
//!
//! ```text
//! [TS|]KIND│NAME│PAYLOAD
//! ```
//!
//! `KIND` is `$` (spawn), `<` (stdout), `!` (stderr), `=` (exit) or `*`
//! (supervisor message). Fields are separated by `│` (U+2502); the optional
//! timestamp is separated by an ASCII `|`. Writes are serialized so whole
//! records never interleave.

use std::collections::HashMap;
use std::io::{self, IsTerminal, Write};
use std::sync::Mutex;
use std::time::Instant;

use chrono::Local;

use crate::color::ColorSpec;

const SEP: char = '\u{2502}';

/// Indicates the source stream of a child output line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// Timestamp prefix mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeMode {
    /// `HH:MM:SS` local wall-clock time.
    Absolute,
    /// `HH:MM:SS` elapsed since program start.
    Relative,
}

/// Serializes records onto the output sink.
pub struct Emitter {
    time: Option<TimeMode>,
    start: Instant,
    colors: HashMap<String, ColorSpec>,
    color_enabled: bool,
    sink: Mutex<Box<dyn Write + Send>>,
}

impl Emitter {
    /// An emitter writing to stdout. Color is on only when stdout is a TTY
    /// and `NO_COLOR` is unset.
    pub fn new(time: Option<TimeMode>, colors: HashMap<String, ColorSpec>) -> Self {
        let color_enabled =
            io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
        Self {
            time,
            start: Instant::now(),
            colors,
            color_enabled,
            sink: Mutex::new(Box::new(io::stdout())),
        }
    }

    #[cfg(test)]
    pub fn with_sink(
        time: Option<TimeMode>,
        colors: HashMap<String, ColorSpec>,
        color_enabled: bool,
        sink: Box<dyn Write + Send>,
    ) -> Self {
        Self {
            time,
            start: Instant::now(),
            colors,
            color_enabled,
            sink: Mutex::new(sink),
        }
    }

    /// `$` record: the child spawned; payload is the argv joined by spaces.
    pub fn spawn(&self, name: &str, argv: &[String]) {
        self.emit('$', name, &argv.join(" "));
    }

    /// `<` or `!` record: one line of child output.
    pub fn line(&self, name: &str, stream: StreamKind, text: &str) {
        let kind = match stream {
            StreamKind::Stdout => '<',
            StreamKind::Stderr => '!',
        };
        self.emit(kind, name, text);
    }

    /// `=` record: the child exited with the encoded code.
    pub fn exit(&self, name: &str, code: i32) {
        self.emit('=', name, &code.to_string());
    }

    /// `*` record: a supervisor-level message. Use `"*"` as the name for
    /// program-wide conditions.
    pub fn note(&self, name: &str, text: &str) {
        self.emit('*', name, text);
    }

    fn emit(&self, kind: char, name: &str, payload: &str) {
        let line = self.format(kind, name, payload);
        let mut sink = self.sink.lock().unwrap_or_else(|e| e.into_inner());
        let _ = writeln!(sink, "{line}");
        let _ = sink.flush();
    }

    fn format(&self, kind: char, name: &str, payload: &str) -> String {
        let mut line = String::new();
        if let Some(mode) = self.time {
            line.push_str(&self.stamp(mode));
            line.push('|');
        }
        line.push(kind);
        line.push(SEP);
        match self.colors.get(name).filter(|_| self.color_enabled) {
            Some(color) => line.push_str(&color.paint(name)),
            None => line.push_str(name),
        }
        line.push(SEP);
        line.push_str(payload);
        line
    }

    fn stamp(&self, mode: TimeMode) -> String {
        match mode {
            TimeMode::Absolute => Local::now().format("%H:%M:%S").to_string(),
            TimeMode::Relative => {
                let elapsed = self.start.elapsed().as_secs();
                format!(
                    "{:02}:{:02}:{:02}",
                    elapsed / 3600,
                    elapsed / 60 % 60,
                    elapsed % 60
                )
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod capture {
    use std::sync::{Arc, Mutex};

    /// A cloneable in-memory sink for asserting emitted records.
    #[derive(Clone, Default)]
    pub struct Capture(Arc<Mutex<Vec<u8>>>);

    impl Capture {
        pub fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    impl std::io::Write for Capture {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::capture::Capture;
    use super::*;
    use crate::color::parse_color;

    fn emitter(time: Option<TimeMode>, color_enabled: bool) -> (Emitter, Capture) {
        let capture = Capture::default();
        let mut colors = HashMap::new();
        colors.insert("A".to_string(), parse_color("red").unwrap());
        let emitter =
            Emitter::with_sink(time, colors, color_enabled, Box::new(capture.clone()));
        (emitter, capture)
    }

    #[test]
    fn records_have_the_line_shape() {
        let (emitter, capture) = emitter(None, false);
        emitter.spawn("A", &["echo".into(), "hello".into()]);
        emitter.line("A", StreamKind::Stdout, "hello");
        emitter.line("A", StreamKind::Stderr, "oops");
        emitter.exit("A", 0);
        emitter.note("*", "timeout");
        assert_eq!(
            capture.text(),
            "$│A│echo hello\n<│A│hello\n!│A│oops\n=│A│0\n*│*│timeout\n"
        );
    }

    #[test]
    fn relative_stamps_start_at_zero() {
        let (emitter, capture) = emitter(Some(TimeMode::Relative), false);
        emitter.note("*", "tick");
        assert!(capture.text().starts_with("00:00:00|*│*│tick"));
    }

    #[test]
    fn absolute_stamps_are_wall_clock_shaped() {
        let (emitter, capture) = emitter(Some(TimeMode::Absolute), false);
        emitter.exit("A", 1);
        let text = capture.text();
        let re = regex::Regex::new(r"^\d{2}:\d{2}:\d{2}\|=│A│1\n$").unwrap();
        assert!(re.is_match(&text), "unexpected record {text:?}");
    }

    #[test]
    fn color_wraps_only_the_name_field() {
        let (emitter, capture) = emitter(None, true);
        emitter.line("A", StreamKind::Stdout, "hello");
        assert_eq!(capture.text(), "<│\u{1b}[31mA\u{1b}[0m│hello\n");
    }

    #[test]
    fn unknown_names_stay_plain() {
        let (emitter, capture) = emitter(None, true);
        emitter.note("*", "interrupt");
        assert_eq!(capture.text(), "*│*│interrupt\n");
    }
}
