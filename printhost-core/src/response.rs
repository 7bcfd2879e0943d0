use winnow::{ascii::dec_int, error::ContextError, prelude::*};

/// Reply category, decided by line prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Kind {
    /// Firmware boot banner; doubles as permission to send.
    Start,
    /// Acknowledgement of the last line, possibly carrying a report.
    Ok,
    /// Firmware-reported fault; forwarded, never acted on locally.
    Error,
    Other,
}

pub(crate) fn kind(line: &str) -> Kind {
    if line.starts_with("start") {
        Kind::Start
    } else if line.starts_with("ok") {
        Kind::Ok
    } else if line.starts_with("Error") {
        Kind::Error
    } else {
        Kind::Other
    }
}

/// Temperature reports ride on acknowledgement lines as `T:<deg> ...`.
pub(crate) fn carries_temperature(line: &str) -> bool {
    line.contains("T:")
}

/// Outcome of scanning a line for a resend directive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Resend {
    None,
    From(i32),
    /// Marker present but no trailing line number to act on.
    Malformed,
}

/// Firmwares request retransmission with `Resend: <n>` or the short `rs`
/// form. The line number is the last whitespace-separated token once `:`
/// counts as a separator. The short marker matches inside ordinary words,
/// so the parseable number is the real gate; a marker without one is
/// malformed rather than guessed at.
pub(crate) fn resend(line: &str) -> Resend {
    if !line.contains("Resend") && !line.contains("rs") {
        return Resend::None;
    }
    let separated = line.replace(':', " ");
    match separated
        .split_whitespace()
        .last()
        .and_then(parse_line_number)
    {
        Some(number) => Resend::From(number),
        None => Resend::Malformed,
    }
}

fn parse_line_number(token: &str) -> Option<i32> {
    dec_int::<&str, i32, ContextError>.parse(token).ok()
}
