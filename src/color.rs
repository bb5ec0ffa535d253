//! ANSI colors for channel labels.
//!
//! A color is either one of the sixteen named foreground colors (4-bit SGR)
//! or a 6-digit hex value rendered as a 24-bit SGR sequence. Colors apply
//! only to the NAME field of emitted records, never to child output.

use anyhow::{bail, Result};

const NAMED: &[(&str, u8)] = &[
    ("black", 30),
    ("red", 31),
    ("green", 32),
    ("yellow", 33),
    ("blue", 34),
    ("magenta", 35),
    ("cyan", 36),
    ("white", 37),
    ("bright_black", 90),
    ("bright_red", 91),
    ("bright_green", 92),
    ("bright_yellow", 93),
    ("bright_blue", 94),
    ("bright_magenta", 95),
    ("bright_cyan", 96),
    ("bright_white", 97),
];

/// A parsed color specification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorSpec {
    /// 4-bit foreground SGR code (30–37, 90–97).
    Named(u8),
    /// 24-bit foreground color.
    Rgb(u8, u8, u8),
}

/// Parses the text after `#`: a named color or exactly six hex digits.
pub fn parse_color(text: &str) -> Result<ColorSpec> {
    let lowered = text.to_ascii_lowercase();
    if let Some((_, code)) = NAMED.iter().find(|(name, _)| *name == lowered) {
        return Ok(ColorSpec::Named(*code));
    }
    if text.len() == 6 && text.chars().all(|c| c.is_ascii_hexdigit()) {
        let r = u8::from_str_radix(&text[0..2], 16)?;
        let g = u8::from_str_radix(&text[2..4], 16)?;
        let b = u8::from_str_radix(&text[4..6], 16)?;
        return Ok(ColorSpec::Rgb(r, g, b));
    }
    bail!("unknown color {:?}", text);
}

impl ColorSpec {
    fn sgr(&self) -> String {
        match self {
            ColorSpec::Named(code) => code.to_string(),
            ColorSpec::Rgb(r, g, b) => format!("38;2;{};{};{}", r, g, b),
        }
    }

    /// Wraps `text` in this color's escape sequence.
    pub fn paint(&self, text: &str) -> String {
        format!("\u{1b}[{}m{}\u{1b}[0m", self.sgr(), text)
    }

    /// The canonical spelling used when rendering a formula back to text.
    pub fn to_arg(&self) -> String {
        match self {
            ColorSpec::Named(code) => NAMED
                .iter()
                .find(|(_, c)| c == code)
                .map(|(name, _)| (*name).to_string())
                .unwrap_or_default(),
            ColorSpec::Rgb(r, g, b) => format!("{:02x}{:02x}{:02x}", r, g, b),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn named_colors_map_to_sgr_codes() {
        assert_eq!(parse_color("red").unwrap(), ColorSpec::Named(31));
        assert_eq!(parse_color("bright_cyan").unwrap(), ColorSpec::Named(96));
        assert_eq!(parse_color("BLUE").unwrap(), ColorSpec::Named(34));
    }

    #[test]
    fn hex_colors_parse_case_insensitively() {
        assert_eq!(parse_color("00FF00").unwrap(), ColorSpec::Rgb(0, 255, 0));
        assert_eq!(
            parse_color("AbCdEf").unwrap(),
            ColorSpec::Rgb(0xab, 0xcd, 0xef)
        );
    }

    #[test]
    fn rejects_unknown_colors() {
        assert!(parse_color("chartreuse").is_err());
        assert!(parse_color("fff").is_err());
        assert!(parse_color("12345g").is_err());
        assert!(parse_color("").is_err());
    }

    #[test]
    fn paint_wraps_only_the_given_text() {
        assert_eq!(
            ColorSpec::Named(31).paint("API"),
            "\u{1b}[31mAPI\u{1b}[0m"
        );
        assert_eq!(
            ColorSpec::Rgb(0, 255, 0).paint("DB"),
            "\u{1b}[38;2;0;255;0mDB\u{1b}[0m"
        );
    }

    #[test]
    fn canonical_spelling_round_trips() {
        for text in ["red", "bright_white", "00ff00"] {
            let spec = parse_color(text).unwrap();
            assert_eq!(parse_color(&spec.to_arg()).unwrap(), spec);
        }
    }
}
