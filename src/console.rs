//! Operator console.
//!
//! Human-readable status lines (ping responses, stream results) share one
//! output with the terminal. Several tasks print, so the output sits behind a
//! single mutex and a multi-part message is written under one
//! [`ConsoleGuard`]. The guard releases the console on every path, including
//! early returns and errors.
//!
//! Diagnostics go through `tracing`, not through the console.
//!
//! # Example
//!
//! ```
//! use std::io::Write;
//! use blueteeth::console::Console;
//!
//! let console = Console::new(Vec::new());
//! {
//!     let mut out = console.lock();
//!     write!(out, "Stream results from ADDR{}: ", 2).unwrap();
//!     out.write_line("Checksum = 42, Time = 17").unwrap();
//! }
//! console.line("Ping packet type received.");
//! ```

use std::io::{self, Write};
use std::sync::{Mutex, MutexGuard, PoisonError};

type BoxedOutput = Box<dyn Write + Send>;

/// Mutex-guarded line output.
pub struct Console {
    out: Mutex<BoxedOutput>,
}

impl Console {
    /// Console writing to `out`.
    pub fn new<W: Write + Send + 'static>(out: W) -> Self {
        Self {
            out: Mutex::new(Box::new(out)),
        }
    }

    /// Console on the process's stdout.
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }

    /// Console that discards everything.
    pub fn discard() -> Self {
        Self::new(io::sink())
    }

    /// Take exclusive use of the console until the guard is dropped.
    pub fn lock(&self) -> ConsoleGuard<'_> {
        ConsoleGuard {
            out: self.out.lock().unwrap_or_else(PoisonError::into_inner),
        }
    }

    /// Write one line.
    ///
    /// Write errors are logged, never returned: losing a status line must
    /// not stop the caller.
    pub fn line(&self, line: &str) {
        if let Err(e) = self.lock().write_line(line) {
            tracing::warn!("Console write failed: {}", e);
        }
    }
}

impl Default for Console {
    fn default() -> Self {
        Self::stdout()
    }
}

impl std::fmt::Debug for Console {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Console").finish_non_exhaustive()
    }
}

/// Exclusive access to the console.
pub struct ConsoleGuard<'a> {
    out: MutexGuard<'a, BoxedOutput>,
}

impl ConsoleGuard<'_> {
    /// Write `line` followed by a newline and flush.
    pub fn write_line(&mut self, line: &str) -> io::Result<()> {
        self.out.write_all(line.as_bytes())?;
        self.out.write_all(b"\n")?;
        self.out.flush()
    }
}

impl Write for ConsoleGuard<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.out.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    /// Output shared with the test so it can read what was written.
    #[derive(Clone, Default)]
    struct Shared(Arc<Mutex<Vec<u8>>>);

    impl Write for Shared {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Shared {
        fn text(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    #[test]
    fn test_line() {
        let shared = Shared::default();
        let console = Console::new(shared.clone());

        console.line("hello");
        console.line("world");

        assert_eq!(shared.text(), "hello\nworld\n");
    }

    #[test]
    fn test_multi_part_write_is_not_interleaved() {
        let shared = Shared::default();
        let console = Arc::new(Console::new(shared.clone()));

        let threads: Vec<_> = (0..4)
            .map(|t| {
                let console = console.clone();
                std::thread::spawn(move || {
                    for i in 0..50 {
                        let mut out = console.lock();
                        write!(out, "[{}:", t).unwrap();
                        write!(out, "{}]", i).unwrap();
                        out.write_line("").unwrap();
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        let text = shared.text();
        assert_eq!(text.lines().count(), 200);
        for line in text.lines() {
            assert!(line.starts_with('[') && line.ends_with(']'), "torn line {:?}", line);
            assert_eq!(line.matches('[').count(), 1);
        }
    }

    #[test]
    fn test_guard_released_after_error_path() {
        struct Failing;
        impl Write for Failing {
            fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
                Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed"))
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let console = Console::new(Failing);
        assert!(console.lock().write_line("x").is_err());
        // A second lock would deadlock if the first guard had leaked.
        console.line("y");
    }
}
