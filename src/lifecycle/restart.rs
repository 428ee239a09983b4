//! Re-exec restart.
//!
//! The master replaces itself with a fresh copy of its own executable.
//! Debug flags are dropped so a restarted daemon does not keep verbose
//! logging a developer turned on once.
//!
//! Descriptors do not need closing by hand: everything the gateway opens
//! (listeners, worker sockets, files) is created close-on-exec by std
//! and tokio, so none of it survives into the new image.

use std::ffi::OsString;
use std::os::unix::process::CommandExt;
use std::process::Command;

/// Flags removed from the argument list on restart.
const DROPPED_FLAGS: &[&str] = &["-d", "--debug"];

/// Arguments (excluding argv\[0\]) for the restarted process.
pub fn restart_args<I>(args: I) -> Vec<OsString>
where
    I: IntoIterator<Item = OsString>,
{
    args.into_iter()
        .filter(|arg| !DROPPED_FLAGS.iter().any(|flag| arg == flag))
        .collect()
}

/// Replace the current process image. Only returns on failure.
pub fn exec_self() -> std::io::Error {
    let exe = match std::env::current_exe() {
        Ok(exe) => exe,
        Err(e) => return e,
    };
    let args = restart_args(std::env::args_os().skip(1));
    tracing::warn!(exe = %exe.display(), ?args, "Will restart the process now");
    Command::new(exe).args(args).exec()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn os(args: &[&str]) -> Vec<OsString> {
        args.iter().map(OsString::from).collect()
    }

    #[test]
    fn drops_debug_flags_only() {
        assert_eq!(
            restart_args(os(&["-c", "/etc/gw.toml", "-d", "--autologin", "--debug"])),
            os(&["-c", "/etc/gw.toml", "--autologin"])
        );
        assert_eq!(restart_args(os(&["--dev"])), os(&["--dev"]));
    }
}
