//! Command expression parsing.
//!
//! Every positional argument is one expression of the form
//! `[KEY][#COLOR][+DELAY…][:DEP…][|ACTION…]=CMD`. This module turns the
//! expression into an immutable [`Formula`], assigns names to anonymous
//! formulas, and validates the dependency graph before anything is spawned.

use std::collections::HashSet;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;

use crate::color::{parse_color, ColorSpec};
use crate::delay::{format_delay, parse_delay};

/// Behavior modifiers on a channel. A closed set of flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Actions {
    /// Ending this channel ends the whole run.
    pub end: bool,
    /// Suppress both output streams.
    pub silent: bool,
    /// Suppress stdout records.
    pub noout: bool,
    /// Suppress stderr records.
    pub noerr: bool,
}

impl Actions {
    fn set(&mut self, name: &str) -> Result<()> {
        match name.to_ascii_lowercase().as_str() {
            "end" => self.end = true,
            "silent" => self.silent = true,
            "noout" => self.noout = true,
            "noerr" => self.noerr = true,
            other => bail!("unknown action {:?}", other),
        }
        Ok(())
    }

    pub fn suppress_stdout(&self) -> bool {
        self.silent || self.noout
    }

    pub fn suppress_stderr(&self) -> bool {
        self.silent || self.noerr
    }

    fn render(&self) -> String {
        let mut out = String::new();
        for (flag, name) in [
            (self.end, "end"),
            (self.silent, "silent"),
            (self.noout, "noout"),
            (self.noerr, "noerr"),
        ] {
            if flag {
                out.push('|');
                out.push_str(name);
            }
        }
        out
    }
}

/// Which lifecycle point of the target a dependency waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepOn {
    Start,
    End,
}

/// One dependency clause: wait for `target` to reach `on`, then wait the
/// summed `after` delays. An empty target is a pure wall-clock wait.
#[derive(Debug, Clone, PartialEq)]
pub struct Dep {
    pub target: String,
    pub on: DepOn,
    pub after: Vec<Duration>,
}

impl Dep {
    pub fn after_total(&self) -> Duration {
        self.after.iter().sum()
    }
}

/// The parsed, immutable description of one command argument.
#[derive(Debug, Clone, PartialEq)]
pub struct Formula {
    /// Channel label. Empty until [`assign_names`] runs for anonymous
    /// formulas.
    pub name: String,
    pub color: Option<ColorSpec>,
    pub start_delays: Vec<Duration>,
    pub deps: Vec<Dep>,
    pub actions: Actions,
    pub argv: Vec<String>,
}

impl Formula {
    /// Parses one command expression.
    pub fn parse(arg: &str) -> Result<Formula> {
        let (prefix, command) = split_expression(arg);
        let mut formula = parse_prefix(prefix)?;
        let argv = shell_words::split(command)
            .map_err(|err| anyhow!("bad quoting: {err}"))?;
        if argv.is_empty() {
            bail!("empty command");
        }
        formula.argv = argv;
        Ok(formula)
    }

    /// Total top-level delay, counted from program start.
    pub fn start_delay_total(&self) -> Duration {
        self.start_delays.iter().sum()
    }

    /// Renders the canonical form; `parse(render(f))` yields `f` again.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(&self.name);
        if let Some(color) = &self.color {
            out.push('#');
            out.push_str(&color.to_arg());
        }
        for delay in &self.start_delays {
            out.push('+');
            out.push_str(&format_delay(*delay));
        }
        for dep in &self.deps {
            out.push(':');
            out.push_str(&dep.target);
            if dep.on == DepOn::Start {
                out.push('&');
            }
            for delay in &dep.after {
                out.push('+');
                out.push_str(&format_delay(*delay));
            }
        }
        out.push_str(&self.actions.render());
        out.push('=');
        out.push_str(&shell_words::join(&self.argv));
        out
    }
}

// Splits at the first '=' not preceded by a backslash. No '=' at all means
// the whole argument is the command.
fn split_expression(arg: &str) -> (&str, &str) {
    let bytes = arg.as_bytes();
    for (i, byte) in bytes.iter().enumerate() {
        if *byte == b'=' && (i == 0 || bytes[i - 1] != b'\\') {
            return (&arg[..i], &arg[i + 1..]);
        }
    }
    ("", arg)
}

fn is_word(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

// Scans the prefix section by section, dispatching on the lead character.
// Sections are accepted in any order but KEY and COLOR at most once.
fn parse_prefix(prefix: &str) -> Result<Formula> {
    let mut formula = Formula {
        name: String::new(),
        color: None,
        start_delays: Vec::new(),
        deps: Vec::new(),
        actions: Actions::default(),
        argv: Vec::new(),
    };
    let mut seen_key = false;
    let mut rest = prefix;
    while let Some(first) = rest.chars().next() {
        match first {
            c if is_word(c) => {
                if seen_key {
                    bail!("more than one name in prefix {:?}", prefix);
                }
                let end = rest.find(|c| !is_word(c)).unwrap_or(rest.len());
                formula.name = rest[..end].to_string();
                seen_key = true;
                rest = &rest[end..];
            }
            '#' => {
                if formula.color.is_some() {
                    bail!("more than one color in prefix {:?}", prefix);
                }
                let body = &rest[1..];
                let end = body
                    .find(|c| matches!(c, '+' | ':' | '|'))
                    .unwrap_or(body.len());
                formula.color = Some(parse_color(&body[..end])?);
                rest = &body[end..];
            }
            '+' => {
                let body = &rest[1..];
                let end = body
                    .find(|c: char| !c.is_ascii_alphanumeric() && c != '.')
                    .unwrap_or(body.len());
                formula.start_delays.push(parse_delay(&body[..end])?);
                rest = &body[end..];
            }
            ':' => {
                let body = &rest[1..];
                let end = body
                    .find(|c| matches!(c, ':' | '|'))
                    .unwrap_or(body.len());
                formula.deps.push(parse_dep(&body[..end])?);
                rest = &body[end..];
            }
            '|' => {
                let body = &rest[1..];
                let end = body.find(|c| !is_word(c)).unwrap_or(body.len());
                if end == 0 {
                    bail!("empty action in prefix {:?}", prefix);
                }
                formula.actions.set(&body[..end])?;
                rest = &body[end..];
            }
            other => bail!("unexpected {:?} in prefix {:?}", other, prefix),
        }
    }
    Ok(formula)
}

// DEP = KEY? "&"? ("+"DELAY)*
fn parse_dep(text: &str) -> Result<Dep> {
    let word_end = text.find(|c| !is_word(c)).unwrap_or(text.len());
    let target = text[..word_end].to_string();
    let mut rest = &text[word_end..];
    let on = if let Some(after_amp) = rest.strip_prefix('&') {
        rest = after_amp;
        DepOn::Start
    } else {
        DepOn::End
    };
    let mut after = Vec::new();
    while let Some(body) = rest.strip_prefix('+') {
        let end = body
            .find(|c: char| !c.is_ascii_alphanumeric() && c != '.')
            .unwrap_or(body.len());
        after.push(parse_delay(&body[..end])?);
        rest = &body[end..];
    }
    if !rest.is_empty() {
        bail!("malformed dependency {:?}", text);
    }
    Ok(Dep { target, on, after })
}

/// Checks user-assigned names for duplicates and fills anonymous formulas
/// with `A`, `B`, …, `AA`, … in argument order, skipping taken names.
pub fn assign_names(formulas: &mut [Formula]) -> Result<()> {
    let mut taken = HashSet::new();
    for formula in formulas.iter() {
        if !formula.name.is_empty() && !taken.insert(formula.name.clone()) {
            bail!("duplicate name {:?}", formula.name);
        }
    }
    let mut next = 0usize;
    for formula in formulas.iter_mut() {
        if !formula.name.is_empty() {
            continue;
        }
        loop {
            let candidate = auto_name(next);
            next += 1;
            if taken.insert(candidate.clone()) {
                formula.name = candidate;
                break;
            }
        }
    }
    Ok(())
}

// Bijective base 26: A..Z, AA, AB, ...
fn auto_name(mut n: usize) -> String {
    let mut name = String::new();
    loop {
        name.insert(0, (b'A' + (n % 26) as u8) as char);
        n /= 26;
        if n == 0 {
            break;
        }
        n -= 1;
    }
    name
}

/// Validates dependency targets and rejects pure END-cycles. Start edges
/// cannot be part of a rejected cycle; they relate start times only.
pub fn validate(formulas: &[Formula]) -> Result<()> {
    let names: HashSet<&str> = formulas.iter().map(|f| f.name.as_str()).collect();
    for formula in formulas {
        for dep in &formula.deps {
            if !dep.target.is_empty() && !names.contains(dep.target.as_str()) {
                bail!(
                    "{}: unknown dependency target {:?}",
                    formula.name,
                    dep.target
                );
            }
        }
    }

    // Edge direction: target -> dependent, END edges only. A toposort
    // failure is a cycle that could never make progress.
    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();
    for formula in formulas {
        graph.add_node(formula.name.as_str());
    }
    for formula in formulas {
        for dep in &formula.deps {
            if dep.on == DepOn::End && !dep.target.is_empty() {
                graph.add_edge(dep.target.as_str(), formula.name.as_str(), ());
            }
        }
    }
    toposort(&graph, None)
        .map(|_| ())
        .map_err(|cycle| {
            anyhow!(
                "dependency cycle involving {:?}",
                cycle.node_id()
            )
        })
        .context("commands can never start")
}
