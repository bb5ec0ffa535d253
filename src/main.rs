//! multiplex: run several commands in parallel and merge their output into a
//! single structured stream.
//!
//! This is the entry point. It parses the command expressions, launches one
//! task per channel, and drives the shared lifecycle: run until everything
//! ends, an `end`-flagged channel ends, a signal arrives or the timeout
//! expires, then terminate whatever is left and compute the exit code.

mod color;
mod delay;
mod events;
mod formula;
mod output;
mod process;
mod runner;

use std::collections::HashMap;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::color::ColorSpec;
use crate::events::{Bus, Event};
use crate::formula::{assign_names, validate, Formula};
use crate::output::{Emitter, TimeMode};
use crate::process::{Channel, ChannelState};
use crate::runner::{ChannelRunner, DEFAULT_GRACE};

/// Command-line interface definition.
#[derive(Debug, Parser)]
#[command(
    name = "multiplex",
    version,
    about = "Run several commands in parallel and merge their output into a single structured stream"
)]
struct Cli {
    /// Command expressions: [KEY][#COLOR][+DELAY…][:DEP…][|ACTION…]=CMD
    #[arg(value_name = "COMMAND", required = true)]
    commands: Vec<String>,
    /// Terminate everything after SECONDS (fractions accepted).
    #[arg(short = 't', long, value_name = "SECONDS")]
    timeout: Option<f64>,
    /// Prefix every record with a timestamp.
    #[arg(
        long,
        value_name = "MODE",
        visible_alias = "timestamp",
        num_args = 0..=1,
        default_missing_value = "absolute",
        require_equals = true,
        value_enum
    )]
    time: Option<TimeModeArg>,
    /// Shorthand for --time=relative.
    #[arg(short = 'r', long)]
    relative: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum TimeModeArg {
    Absolute,
    Relative,
}

impl TimeModeArg {
    fn mode(self) -> TimeMode {
        match self {
            TimeModeArg::Absolute => TimeMode::Absolute,
            TimeModeArg::Relative => TimeMode::Relative,
        }
    }
}

fn resolve_time_mode(cli: &Cli) -> Option<TimeMode> {
    if cli.relative {
        Some(TimeMode::Relative)
    } else {
        cli.time.map(TimeModeArg::mode)
    }
}

/// Why shutdown began.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reason {
    Interrupt,
    Term,
    Hangup,
    Timeout,
    /// An `end`-flagged channel ended.
    Terminator,
}

impl Reason {
    fn note(self) -> Option<&'static str> {
        match self {
            Reason::Interrupt => Some("interrupt"),
            Reason::Term => Some("terminate"),
            Reason::Hangup => Some("hangup"),
            Reason::Timeout => Some("timeout"),
            Reason::Terminator => None,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    ExitCode::from(run(cli).await)
}

async fn run(cli: Cli) -> u8 {
    let time = resolve_time_mode(&cli);

    let mut formulas = Vec::new();
    let mut failure = None;
    for arg in &cli.commands {
        match Formula::parse(arg).with_context(|| format!("invalid command {arg:?}")) {
            Ok(formula) => formulas.push(formula),
            Err(err) => {
                failure = Some(err);
                break;
            }
        }
    }
    let failure = failure
        .or_else(|| assign_names(&mut formulas).err())
        .or_else(|| validate(&formulas).err());
    if let Some(err) = failure {
        let emitter = Emitter::new(time, HashMap::new());
        emitter.note("*", &format!("{err:#}"));
        return 2;
    }

    let colors: HashMap<String, ColorSpec> = formulas
        .iter()
        .filter_map(|formula| formula.color.map(|color| (formula.name.clone(), color)))
        .collect();
    let emitter = Arc::new(Emitter::new(time, colors));
    let bus = Bus::new(formulas.iter().map(|formula| formula.name.as_str()));
    let cancel = CancellationToken::new();
    let (event_tx, mut event_rx) = mpsc::channel(256);

    let mut channels: HashMap<String, Channel> = HashMap::new();
    let mut tasks = JoinSet::new();
    for formula in formulas {
        let runner = ChannelRunner {
            formula: formula.clone(),
            bus: bus.clone(),
            emitter: emitter.clone(),
            events: event_tx.clone(),
            cancel: cancel.child_token(),
            grace: DEFAULT_GRACE,
        };
        channels.insert(formula.name.clone(), Channel::new(formula));
        tasks.spawn(runner.run());
    }
    drop(event_tx);

    let (signal_tx, mut signal_rx) = mpsc::channel(4);
    spawn_signal_listener(signal_tx);

    let mut reason: Option<Reason> = None;
    let mut terminator: Option<i32> = None;
    let mut remaining = channels.len();

    let timeout_fut = async {
        match cli.timeout {
            Some(secs) => tokio::time::sleep(Duration::from_secs_f64(secs.max(0.0))).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(timeout_fut);

    while remaining > 0 {
        tokio::select! {
            event = event_rx.recv() => {
                let Some(event) = event else { break };
                let request_end = handle_event(event, &mut channels, &mut terminator, &mut remaining);
                if request_end && reason.is_none() {
                    reason = Some(Reason::Terminator);
                    begin_shutdown(&emitter, &channels, &cancel, Reason::Terminator);
                }
            }
            Some(signal) = signal_rx.recv(), if reason.is_none() => {
                reason = Some(signal);
                begin_shutdown(&emitter, &channels, &cancel, signal);
            }
            _ = &mut timeout_fut, if reason.is_none() => {
                reason = Some(Reason::Timeout);
                begin_shutdown(&emitter, &channels, &cancel, Reason::Timeout);
            }
        }
    }

    while tasks.join_next().await.is_some() {}

    for channel in channels.values() {
        if channel.state == ChannelState::Pending && channel.exit_code.is_none() {
            emitter.note(&channel.formula.name, "not started");
        }
    }
    if reason.is_some() {
        let pgids: Vec<i32> = channels.values().filter_map(|c| c.pgid).collect();
        runner::reap_orphans(&pgids, &emitter);
    }

    exit_code(reason, terminator, &channels)
}

// Returns true when an `end`-flagged channel ended and shutdown should
// begin.
fn handle_event(
    event: Event,
    channels: &mut HashMap<String, Channel>,
    terminator: &mut Option<i32>,
    remaining: &mut usize,
) -> bool {
    match event {
        Event::Started { name, pid } => {
            if let Some(channel) = channels.get_mut(&name) {
                channel.mark_started(pid);
            }
            false
        }
        Event::Ended { name, code } => {
            let Some(channel) = channels.get_mut(&name) else {
                return false;
            };
            channel.mark_ended(code);
            *remaining = remaining.saturating_sub(1);
            if channel.formula.actions.end {
                if terminator.is_none() {
                    *terminator = Some(code);
                }
                return true;
            }
            false
        }
        Event::SpawnFailed { name } => {
            if let Some(channel) = channels.get_mut(&name) {
                channel.mark_spawn_failed();
            }
            *remaining = remaining.saturating_sub(1);
            false
        }
        Event::Skipped { name } => {
            if let Some(channel) = channels.get_mut(&name) {
                channel.mark_skipped();
            }
            *remaining = remaining.saturating_sub(1);
            false
        }
    }
}

fn begin_shutdown(
    emitter: &Emitter,
    channels: &HashMap<String, Channel>,
    cancel: &CancellationToken,
    reason: Reason,
) {
    if let Some(note) = reason.note() {
        emitter.note("*", note);
    }
    for channel in channels.values() {
        if channel.state == ChannelState::Started && !channel.done {
            emitter.note(&channel.formula.name, "terminating");
        }
    }
    cancel.cancel();
}

fn exit_code(
    reason: Option<Reason>,
    terminator: Option<i32>,
    channels: &HashMap<String, Channel>,
) -> u8 {
    let code = match reason {
        Some(Reason::Interrupt) => 130,
        Some(Reason::Term) => 143,
        Some(Reason::Hangup) => 129,
        Some(Reason::Timeout) => 124,
        Some(Reason::Terminator) => terminator.unwrap_or(1),
        None => {
            if channels.values().all(|c| c.exit_code == Some(0)) {
                0
            } else {
                1
            }
        }
    };
    u8::try_from(code).unwrap_or(1)
}

fn spawn_signal_listener(tx: mpsc::Sender<Reason>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let Ok(mut sigterm) = signal(SignalKind::terminate()) else {
                return;
            };
            let Ok(mut sighup) = signal(SignalKind::hangup()) else {
                return;
            };
            loop {
                let reason = tokio::select! {
                    _ = tokio::signal::ctrl_c() => Reason::Interrupt,
                    _ = sigterm.recv() => Reason::Term,
                    _ = sighup.recv() => Reason::Hangup,
                };
                if tx.send(reason).await.is_err() {
                    return;
                }
            }
        }
        #[cfg(not(unix))]
        {
            if tokio::signal::ctrl_c().await.is_ok() {
                let _ = tx.send(Reason::Interrupt).await;
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channels_with_codes(codes: &[(&str, Option<i32>)]) -> HashMap<String, Channel> {
        codes
            .iter()
            .map(|(name, code)| {
                let mut channel =
                    Channel::new(Formula::parse(&format!("{name}=echo hi")).unwrap());
                if let Some(code) = code {
                    channel.mark_started(1);
                    channel.mark_ended(*code);
                }
                (name.to_string(), channel)
            })
            .collect()
    }

    #[test]
    fn exit_code_prefers_the_shutdown_reason() {
        let channels = channels_with_codes(&[("A", Some(0))]);
        assert_eq!(exit_code(Some(Reason::Interrupt), None, &channels), 130);
        assert_eq!(exit_code(Some(Reason::Timeout), None, &channels), 124);
        assert_eq!(exit_code(Some(Reason::Term), None, &channels), 143);
        assert_eq!(exit_code(Some(Reason::Hangup), None, &channels), 129);
    }

    #[test]
    fn exit_code_follows_the_terminator_channel() {
        let channels = channels_with_codes(&[("A", Some(0)), ("B", Some(7))]);
        assert_eq!(exit_code(Some(Reason::Terminator), Some(7), &channels), 7);
        assert_eq!(exit_code(Some(Reason::Terminator), Some(0), &channels), 0);
    }

    #[test]
    fn exit_code_defaults_to_all_zero_policy() {
        let ok = channels_with_codes(&[("A", Some(0)), ("B", Some(0))]);
        assert_eq!(exit_code(None, None, &ok), 0);
        let failed = channels_with_codes(&[("A", Some(0)), ("B", Some(3))]);
        assert_eq!(exit_code(None, None, &failed), 1);
    }

    #[test]
    fn ended_event_with_end_action_requests_shutdown() {
        let mut channels = HashMap::new();
        let formula = Formula::parse("A|end=echo hi").unwrap();
        channels.insert("A".to_string(), Channel::new(formula));
        let mut terminator = None;
        let mut remaining = 1;
        let request = handle_event(
            Event::Ended {
                name: "A".to_string(),
                code: 7,
            },
            &mut channels,
            &mut terminator,
            &mut remaining,
        );
        assert!(request);
        assert_eq!(terminator, Some(7));
        assert_eq!(remaining, 0);
    }

    #[test]
    fn cli_time_flag_variants() {
        let cli = Cli::try_parse_from(["multiplex", "A=echo hi"]).unwrap();
        assert_eq!(resolve_time_mode(&cli), None);

        let cli = Cli::try_parse_from(["multiplex", "--time", "A=echo hi"]).unwrap();
        assert_eq!(resolve_time_mode(&cli), Some(TimeMode::Absolute));

        let cli = Cli::try_parse_from(["multiplex", "--time=relative", "A=echo hi"]).unwrap();
        assert_eq!(resolve_time_mode(&cli), Some(TimeMode::Relative));

        let cli = Cli::try_parse_from(["multiplex", "--timestamp", "A=echo hi"]).unwrap();
        assert_eq!(resolve_time_mode(&cli), Some(TimeMode::Absolute));

        let cli = Cli::try_parse_from(["multiplex", "-r", "A=echo hi"]).unwrap();
        assert_eq!(resolve_time_mode(&cli), Some(TimeMode::Relative));
    }

    #[test]
    fn cli_requires_a_command_and_accepts_float_timeouts() {
        assert!(Cli::try_parse_from(["multiplex"]).is_err());
        let cli = Cli::try_parse_from(["multiplex", "-t", "1.5", "A=echo hi"]).unwrap();
        assert_eq!(cli.timeout, Some(1.5));
    }
}
