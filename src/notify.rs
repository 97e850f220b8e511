use std::io::Write;
#[cfg(target_os = "macos")]
use std::process::Command;

/// Play an audible completion cue for the current platform.
///
/// On macOS the system "Glass" sound is played; elsewhere the terminal bell is
/// rung on stderr. Failures are ignored.
pub fn play_completion_cue() {
    #[cfg(target_os = "macos")]
    {
        let played = Command::new("afplay")
            .arg("/System/Library/Sounds/Glass.aiff")
            .status()
            .map(|status| status.success())
            .unwrap_or(false);
        if played {
            return;
        }
    }

    let mut stderr = std::io::stderr();
    let _ = stderr.write_all(b"\x07");
    let _ = stderr.flush();
}

/// Format the user-visible failure line: a title plus the error's own message.
pub fn failure_message(title: &str, error: &dyn std::fmt::Display) -> String {
    format!("{title}\n{error}")
}
