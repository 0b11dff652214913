//! Post-hoc fault detection over captured node output.
//!
//! Faults in the worker service usually manifest as multi-line stack
//! traces, and many have no HTTP-visible symptom at all. After teardown
//! (and optionally mid-run) every captured stdout/stderr file is scanned
//! line by line; the scanner's verdict is OR'd into the run's pass/fail.
//!
//! The per-file state machine groups a fault line with its following lines
//! instead of flagging each frame independently: once a fault opens a
//! block, lines keep echoing until the block runs past four lines and hits
//! a line that is neither a "Caused by" marker nor a stack frame.

use covey_proto::Result;
use regex::Regex;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Per-file echo state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Printing {
    Idle,
    Emitting,
    Suppressed,
}

/// Outcome of scanning a sandbox.
#[derive(Debug, Default)]
pub struct ScanReport {
    /// True if any fault was found in any file.
    pub faulted: bool,
    /// Lines echoed across all files, each prefixed with its file name.
    pub echoed: Vec<String>,
    /// Files that contributed at least one fault.
    pub faulted_files: Vec<PathBuf>,
}

/// Stateful line classifier over a directory of captured node output.
pub struct LogFaultScanner {
    bad_line: Regex,
    benign: Regex,
    continuation: Regex,
    stack_frame: Regex,
    single_line_event: Regex,
}

impl Default for LogFaultScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl LogFaultScanner {
    /// Lines a fault block keeps emitting before a plain line may close it.
    const SUPPRESS_AFTER: u32 = 4;

    pub fn new() -> Self {
        Self {
            bad_line: Regex::new(
                r"(?i)exception|error|assert|warn|info|killing|killed|required ports",
            )
            .unwrap(),
            benign: Regex::new(r"(?i)error rate").unwrap(),
            continuation: Regex::new(r"Caused by").unwrap(),
            stack_frame: Regex::new(r"^\s*at ").unwrap(),
            single_line_event: Regex::new(r"(?i)warn|info").unwrap(),
        }
    }

    /// Scans every regular file in `dir`. Returns the combined report;
    /// `faulted` is the run verdict.
    pub fn scan_dir(&self, dir: &Path) -> Result<ScanReport> {
        let mut report = ScanReport::default();

        let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file())
            .collect();
        paths.sort();

        for path in paths {
            // Crash dumps mix binary output into the text stream; a lossy
            // decode keeps scanning past it instead of dropping the rest
            // of the file.
            let bytes = std::fs::read(&path)?;
            let text = String::from_utf8_lossy(&bytes);
            let file_faulted =
                self.scan_lines(text.lines().map(str::to_string), &path, &mut report);
            if file_faulted {
                report.faulted = true;
                report.faulted_files.push(path);
            }
        }

        if report.faulted {
            warn!(
                files = report.faulted_files.len(),
                "Log scan found faults in captured node output"
            );
        } else {
            info!("Log scan clean");
        }
        Ok(report)
    }

    /// Runs the state machine over one file's lines. Returns whether the
    /// file contained a fault.
    fn scan_lines<I>(&self, lines: I, path: &Path, report: &mut ScanReport) -> bool
    where
        I: Iterator<Item = String>,
    {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        let mut printing = Printing::Idle;
        let mut lines_emitted = 0u32;
        let mut faulted = false;

        for line in lines {
            let is_bad = self.bad_line.is_match(&line) && !self.benign.is_match(&line);
            let is_continuation = self.continuation.is_match(&line);
            let is_stack_frame = self.stack_frame.is_match(&line);
            let is_single_line_event = self.single_line_event.is_match(&line);

            let mut echo = is_single_line_event;
            match printing {
                Printing::Idle if is_bad => {
                    printing = Printing::Emitting;
                    lines_emitted = 1;
                    faulted = true;
                    echo = true;
                }
                Printing::Emitting => {
                    lines_emitted += 1;
                    echo = true;
                    // The closing line is still part of the block; further
                    // lines of this fault are suppressed, the verdict stands.
                    if lines_emitted > Self::SUPPRESS_AFTER
                        && !is_continuation
                        && !is_stack_frame
                    {
                        printing = Printing::Suppressed;
                    }
                }
                Printing::Idle | Printing::Suppressed => {}
            }

            if echo {
                report.echoed.push(format!("{name}: {line}"));
            }
        }

        faulted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use tempfile::TempDir;

    fn scan(lines: &[&str]) -> (bool, Vec<String>) {
        let scanner = LogFaultScanner::new();
        let mut report = ScanReport::default();
        let faulted = scanner.scan_lines(
            lines.iter().map(|l| (*l).to_string()),
            Path::new("node-0.out"),
            &mut report,
        );
        (faulted, report.echoed)
    }

    #[test]
    fn test_clean_log_has_no_fault() {
        let (faulted, echoed) = scan(&["starting up", "listening on 54321", "all good"]);
        assert!(!faulted);
        assert!(echoed.is_empty());
    }

    #[test]
    fn test_fault_plus_six_plain_lines_emits_exactly_five() {
        let (faulted, echoed) = scan(&[
            "java.lang.NullPointerException: boom",
            "plain 1",
            "plain 2",
            "plain 3",
            "plain 4",
            "plain 5",
            "plain 6",
        ]);
        assert!(faulted);
        // The fault line plus the next four, then suppression.
        assert_eq!(echoed.len(), 5);
        assert!(echoed[0].contains("NullPointerException"));
        assert!(echoed[4].contains("plain 4"));
    }

    #[test]
    fn test_stack_frames_extend_the_block() {
        let (faulted, echoed) = scan(&[
            "java.lang.AssertionError: invariant broken",
            "    at com.example.Worker.main(Worker.java:42)",
            "    at com.example.Launcher.run(Launcher.java:7)",
            "plain line",
        ]);
        assert!(faulted);
        assert_eq!(echoed.len(), 4);
        assert!(echoed[3].contains("plain line"));
    }

    #[test]
    fn test_long_trace_keeps_emitting_through_frames() {
        let (faulted, echoed) = scan(&[
            "Exception in thread main",
            "    at a.A(A.java:1)",
            "    at b.B(B.java:2)",
            "    at c.C(C.java:3)",
            "    at d.D(D.java:4)",
            "    at e.E(E.java:5)",
            "Caused by: java.io.IOException",
            "    at f.F(F.java:6)",
            "plain after trace",
            "plain again",
        ]);
        assert!(faulted);
        // Frames and the Caused-by line never close the block; the first
        // plain line past the minimum does, and is itself echoed.
        assert_eq!(echoed.len(), 9);
        assert!(echoed[8].contains("plain after trace"));
    }

    #[test]
    fn test_error_rate_is_benign() {
        let (faulted, echoed) = scan(&["training error rate: 0.03", "done"]);
        assert!(!faulted);
        assert!(echoed.is_empty());
    }

    #[test]
    fn test_single_line_warn_echoed_without_opening_a_block() {
        // warn/info match the fault keywords, so they open a block and set
        // the verdict; a warn inside a suppressed block is still echoed.
        let (faulted, echoed) = scan(&[
            "ERROR first fault",
            "plain 1",
            "plain 2",
            "plain 3",
            "plain 4",
            "plain 5",
            "INFO heartbeat ok",
        ]);
        assert!(faulted);
        assert_eq!(echoed.len(), 6);
        assert!(echoed[5].contains("INFO heartbeat ok"));
    }

    #[test]
    fn test_scan_dir_aggregates_files() {
        let dir = TempDir::new().unwrap();
        let mut clean = File::create(dir.path().join("node-0.out")).unwrap();
        writeln!(clean, "all fine").unwrap();
        let mut bad = File::create(dir.path().join("node-1.out")).unwrap();
        writeln!(bad, "java.lang.OutOfMemoryError: heap").unwrap();

        let report = LogFaultScanner::new().scan_dir(dir.path()).unwrap();
        assert!(report.faulted);
        assert_eq!(report.faulted_files.len(), 1);
        assert!(report.faulted_files[0].ends_with("node-1.out"));
    }

    #[test]
    fn test_fault_below_binary_output_is_still_found() {
        let dir = TempDir::new().unwrap();
        let mut f = File::create(dir.path().join("node-0.out")).unwrap();
        f.write_all(b"\xff\xfe\x00binary crash dump\n").unwrap();
        f.write_all(b"java.lang.OutOfMemoryError: heap\n").unwrap();

        let report = LogFaultScanner::new().scan_dir(dir.path()).unwrap();
        assert!(report.faulted);
        assert!(
            report
                .echoed
                .iter()
                .any(|line| line.contains("OutOfMemoryError"))
        );
    }

    #[test]
    fn test_scan_dir_clean() {
        let dir = TempDir::new().unwrap();
        let mut f = File::create(dir.path().join("node-0.out")).unwrap();
        writeln!(f, "booted").unwrap();
        writeln!(f, "serving").unwrap();

        let report = LogFaultScanner::new().scan_dir(dir.path()).unwrap();
        assert!(!report.faulted);
        assert!(report.echoed.is_empty());
    }
}
