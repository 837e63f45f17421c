//! Small process-related helpers shared across the workspace.

use std::ffi::OsStr;
use std::io;
use std::process::Stdio;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Apply the Windows `CREATE_NO_WINDOW` flag to child processes.
///
/// On non-Windows targets this is a no-op.
pub trait NoWindowExt {
    fn no_window(&mut self);
}

impl NoWindowExt for tokio::process::Command {
    fn no_window(&mut self) {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.as_std_mut().creation_flags(CREATE_NO_WINDOW);
        }
    }
}

/// Create a `tokio::process::Command` with `CREATE_NO_WINDOW` applied on Windows.
pub fn tokio_command(program: impl AsRef<OsStr>) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new(program);
    cmd.no_window();
    cmd
}

/// A child process talking over its stdin and stdout.
///
/// stderr is inherited so the child's logs end up next to the parent's.
pub struct PipedChild {
    pub child: tokio::process::Child,
    pub stdin: tokio::process::ChildStdin,
    pub stdout: tokio::process::ChildStdout,
}

impl PipedChild {
    /// OS process id, if the child has not been reaped yet.
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }
}

/// Spawn `program` with piped stdin/stdout.
///
/// The child is killed when its [`tokio::process::Child`] handle is dropped.
pub fn spawn_piped<I, S>(program: impl AsRef<OsStr>, args: I) -> io::Result<PipedChild>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut child = tokio_command(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| io::Error::other("child stdin was not captured"))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| io::Error::other("child stdout was not captured"))?;

    Ok(PipedChild {
        child,
        stdin,
        stdout,
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    #[tokio::test]
    async fn test_spawn_piped_round_trip() {
        let mut piped = spawn_piped("cat", std::iter::empty::<&str>()).unwrap();
        assert!(piped.id().is_some());

        piped.stdin.write_all(b"hello\n").await.unwrap();
        piped.stdin.flush().await.unwrap();

        let mut lines = BufReader::new(piped.stdout).lines();
        assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("hello"));

        drop(piped.stdin);
        assert_eq!(lines.next_line().await.unwrap(), None);
        assert!(piped.child.wait().await.unwrap().success());
    }
}
