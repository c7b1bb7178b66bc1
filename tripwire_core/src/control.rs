use crate::tracker::CoverageTracker;

/// A decoded control-surface command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    /// Discard every record in every collection.
    Clear,
    /// Instrument one address: `module` is `None` for the base program,
    /// `offset` is relative to the target's load base.
    Add { module: Option<String>, offset: u64 },
}

/// Reads a hex offset, tolerating an optional `0x`/`0X` prefix and either
/// letter case. Empty input or trailing garbage is malformed.
fn parse_hex(text: &str) -> Option<u64> {
    let digits = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .unwrap_or(text);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    u64::from_str_radix(digits, 16).ok()
}

/// Parses one non-empty line: `clear` is handled by the caller, so this
/// sees `<module>:<hex-offset>` or a bare `<hex-offset>`.
fn parse_add_line(line: &[u8]) -> Option<ControlCommand> {
    let text = std::str::from_utf8(line).ok()?;
    let (module, addr_text) = match text.split_once(':') {
        Some((module, addr)) => (Some(module), addr),
        None => (None, text),
    };
    let offset = parse_hex(addr_text)?;
    Some(ControlCommand::Add {
        module: module.map(str::to_owned),
        offset,
    })
}

/// Decodes a control write into commands, returning them together with the
/// number of input bytes consumed.
///
/// Lines end at `\r` or `\n`. Processing stops at a `clear` line (after
/// consuming it), at an empty line, and before a trailing line that has no
/// terminator — the unconsumed tail is the caller's to resubmit, which is
/// how a short write on the control surface behaves. Malformed lines are
/// consumed but silently skipped.
pub fn parse_control(input: &[u8]) -> (Vec<ControlCommand>, usize) {
    let mut commands = Vec::new();
    let mut consumed = 0usize;
    let mut rest = input;

    loop {
        let Some(sep) = rest.iter().position(|&b| b == b'\r' || b == b'\n') else {
            break;
        };
        let line = &rest[..sep];
        rest = &rest[sep + 1..];
        if line.is_empty() {
            break;
        }
        consumed += sep + 1;

        if line == b"clear" {
            commands.push(ControlCommand::Clear);
            break;
        }
        if let Some(command) = parse_add_line(line) {
            commands.push(command);
        }
    }
    (commands, consumed)
}

/// Parses a control write and applies it to the tracker. Returns the number
/// of bytes consumed, so a caller can loop over partially consumed input.
pub fn apply_control(tracker: &CoverageTracker, input: &[u8]) -> usize {
    let (commands, consumed) = parse_control(input);
    for command in commands {
        match command {
            ControlCommand::Clear => tracker.clear(),
            ControlCommand::Add { module, offset } => {
                tracker.add_probe(module.as_deref(), offset);
            }
        }
    }
    consumed
}
