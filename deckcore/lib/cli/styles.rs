use std::{fmt::Write, io::IsTerminal};

use clap::builder::styling::{AnsiColor, Effects, Style, Styles};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// What a piece of `deck` output is, which decides how it is coloured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tone {
    /// Labels and section headings.
    Header,

    /// Ids and other values the user may type back.
    Literal,

    /// Failures.
    Error,

    /// Successful outcomes.
    Valid,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Tone {
    fn style(self) -> Style {
        let styles = styles();
        *match self {
            Tone::Header => styles.get_header(),
            Tone::Literal => styles.get_literal(),
            Tone::Error => styles.get_error(),
            Tone::Valid => styles.get_valid(),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// The help and output colours of `deck`.
pub fn styles() -> Styles {
    let bold = |color: AnsiColor| color.on_default() | Effects::BOLD;
    Styles::styled()
        .header(bold(AnsiColor::Yellow))
        .usage(bold(AnsiColor::Yellow))
        .literal(bold(AnsiColor::Cyan))
        .error(bold(AnsiColor::Red))
        .valid(bold(AnsiColor::Green))
}

/// Whether stdout is an interactive terminal that understands ANSI escapes.
pub fn is_ansi_terminal() -> bool {
    std::io::stdout().is_terminal() && std::env::var("TERM").map_or(true, |t| t != "dumb")
}

/// Wraps `text` in the escapes for `tone`, or returns it unchanged when `ansi` is off.
pub fn paint(text: &str, tone: Tone, ansi: bool) -> String {
    if !ansi {
        return text.to_string();
    }

    let style = tone.style();
    let mut painted = String::with_capacity(text.len() + 16);
    let _ = write!(painted, "{style}{text}{}", style.render_reset());
    painted
}

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// Colours text printed by `deck` when stdout is a terminal.
pub trait AnsiStyles: AsRef<str> {
    /// Colours the text as a label.
    fn header(&self) -> String {
        paint(self.as_ref(), Tone::Header, is_ansi_terminal())
    }

    /// Colours the text as a value.
    fn literal(&self) -> String {
        paint(self.as_ref(), Tone::Literal, is_ansi_terminal())
    }

    /// Colours the text as a failure.
    fn error(&self) -> String {
        paint(self.as_ref(), Tone::Error, is_ansi_terminal())
    }

    /// Colours the text as a success.
    fn valid(&self) -> String {
        paint(self.as_ref(), Tone::Valid, is_ansi_terminal())
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl<T: AsRef<str> + ?Sized> AnsiStyles for T {}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
