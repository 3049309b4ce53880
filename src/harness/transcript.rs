//! Transcript tee for the harness.
//!
//! Everything the harness prints goes to stdout and, once a transcript file
//! is opened, to that file as well.

use std::fmt;
use std::io::Write as _;
use std::path::Path;
use std::sync::OnceLock;

use parking_lot::Mutex;

static TRANSCRIPT_FILE: OnceLock<Mutex<Option<std::fs::File>>> = OnceLock::new();

fn transcript_slot() -> &'static Mutex<Option<std::fs::File>> {
    TRANSCRIPT_FILE.get_or_init(|| Mutex::new(None))
}

/// Create the transcript file (and its parent directories).
pub fn init_transcript(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    let file = std::fs::File::create(path)?;
    *transcript_slot().lock() = Some(file);
    Ok(())
}

/// Print a line to stdout and the transcript.
pub fn println_tee(args: fmt::Arguments<'_>) {
    let line = args.to_string();
    {
        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        let _ = writeln!(out, "{line}");
    }
    if let Some(file) = transcript_slot().lock().as_mut() {
        let _ = writeln!(file, "{line}");
        let _ = file.flush();
    }
}

/// Print a fragment without a newline (streamed deltas).
pub fn print_tee(args: fmt::Arguments<'_>) {
    let text = args.to_string();
    {
        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        let _ = write!(out, "{text}");
        let _ = out.flush();
    }
    if let Some(file) = transcript_slot().lock().as_mut() {
        let _ = write!(file, "{text}");
    }
}
