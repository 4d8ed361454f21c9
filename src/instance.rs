//! Single-instance handshake via a PID file.
//!
//! The daemon writes its pid to a well-known file in the temp directory;
//! `--stop` reads it back and terminates that process. The engine itself is
//! untouched by any of this.

use std::fs;
use std::io;
use std::path::PathBuf;

use tracing::info;

fn pid_file_path() -> PathBuf {
    std::env::temp_dir().join("bettermute.pid")
}

/// Record this process's pid. A stale file from a killed instance is simply
/// overwritten.
pub fn write_pid_file() -> io::Result<PathBuf> {
    let path = pid_file_path();
    fs::write(&path, std::process::id().to_string())?;
    info!(path = %path.display(), "pid file written");
    Ok(path)
}

pub fn remove_pid_file() {
    let _ = fs::remove_file(pid_file_path());
}

/// Pid recorded by a previously started instance, if any.
pub fn read_pid() -> Option<u32> {
    fs::read_to_string(pid_file_path())
        .ok()?
        .trim()
        .parse()
        .ok()
}

/// Terminate the instance recorded in the PID file. Returns `false` when no
/// instance is recorded.
pub fn stop_running_instance() -> anyhow::Result<bool> {
    let Some(pid) = read_pid() else {
        info!("no pid file; nothing to stop");
        return Ok(false);
    };
    if pid == std::process::id() {
        return Ok(false);
    }
    terminate(pid)?;
    remove_pid_file();
    info!(pid, "stopped running instance");
    Ok(true)
}

#[cfg(windows)]
fn terminate(pid: u32) -> anyhow::Result<()> {
    use windows::Win32::Foundation::CloseHandle;
    use windows::Win32::System::Threading::{OpenProcess, TerminateProcess, PROCESS_TERMINATE};

    unsafe {
        let handle = OpenProcess(PROCESS_TERMINATE, false, pid)?;
        let result = TerminateProcess(handle, 0);
        let _ = CloseHandle(handle);
        result?;
    }
    Ok(())
}

#[cfg(not(windows))]
fn terminate(_pid: u32) -> anyhow::Result<()> {
    anyhow::bail!("stopping another instance is only supported on Windows")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_file_round_trips() {
        write_pid_file().unwrap();
        assert_eq!(read_pid(), Some(std::process::id()));
        remove_pid_file();
        assert_eq!(read_pid(), None);
    }
}
