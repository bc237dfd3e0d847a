#[cfg(unix)]
use libc::ECHOCTL;
#[cfg(unix)]
use std::io::{IsTerminal, stdout};
#[cfg(unix)]
use std::os::unix::io::AsRawFd;
#[cfg(unix)]
use termios::{TCSANOW, Termios, tcsetattr};

/// Keeps the terminal from echoing `^C` while a job is running.
///
/// Ctrl+C only requests cancellation; the job then reports its own outcome,
/// and a stray `^C` would corrupt the progress bar line. The previous
/// terminal attributes are put back on drop.
pub struct EchoGuard {
    #[cfg(unix)]
    saved: Option<Termios>,
}

impl EchoGuard {
    #[cfg(unix)]
    pub fn new() -> Self {
        let out = stdout();
        if !out.is_terminal() {
            return Self { saved: None };
        }
        let fd = out.as_raw_fd();
        let saved = Termios::from_fd(fd).ok().filter(|original| {
            let mut quiet = *original;
            quiet.c_lflag &= !ECHOCTL;
            tcsetattr(fd, TCSANOW, &quiet).is_ok()
        });
        Self { saved }
    }

    #[cfg(not(unix))]
    pub fn new() -> Self {
        Self {}
    }
}

impl Drop for EchoGuard {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Some(saved) = &self.saved {
            tcsetattr(stdout().as_raw_fd(), TCSANOW, saved).ok();
        }
    }
}
