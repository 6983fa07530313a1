//! Output helpers for CLI commands with BrokenPipe handling.
//!
//! Output piped into something like `head` may be closed early. Instead of
//! erroring, the command returns `Ok(())`.

/// Print with newline, returning `Ok(())` early on BrokenPipe.
macro_rules! print_line {
    ($($arg:tt)*) => {{
        use std::io::Write;
        match writeln!(std::io::stdout(), $($arg)*) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }
    }};
}

/// Write raw bytes to stdout, treating BrokenPipe as success
pub fn write_raw(bytes: &[u8]) -> std::io::Result<()> {
    use std::io::Write;

    let mut stdout = std::io::stdout().lock();
    match stdout.write_all(bytes).and_then(|()| stdout.flush()) {
        Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => Ok(()),
        other => other,
    }
}

pub(crate) use print_line;
