//! Post-exit reports built from valgrind and strace logs.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;
use tracing::warn;

use crate::state::Mode;

/// Byte and block totals from one valgrind summary line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Lost {
    pub bytes: u64,
    pub blocks: u64,
}

impl Lost {
    fn parse(text: &str) -> Option<Self> {
        // "40 bytes in 1 blocks"
        let mut words = text.split_whitespace();
        let bytes = parse_count(words.next()?)?;
        let blocks = parse_count(words.nth(2)?)?;
        Some(Self { bytes, blocks })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeakSummary {
    pub in_use_at_exit: Option<String>,
    pub heap_usage: Option<String>,
    pub definitely_lost: Lost,
    pub indirectly_lost: Lost,
    pub possibly_lost: Lost,
    pub still_reachable: Lost,
    pub error_count: u64,
    pub all_freed: bool,
    /// Distinct error headlines in first-seen order.
    pub issues: Vec<String>,
}

const ISSUE_PREFIXES: &[&str] = &[
    "Invalid read",
    "Invalid write",
    "Invalid free",
    "Mismatched free",
    "Conditional jump",
    "Use of uninitialised",
    "Syscall param",
    "Source and destination overlap",
    "Process terminating",
];

impl LeakSummary {
    pub fn parse(log: &str) -> Self {
        let mut summary = LeakSummary::default();
        for line in log.lines().map(strip_pid_prefix) {
            let line = line.trim();
            if let Some(rest) = line.strip_prefix("in use at exit:") {
                summary.in_use_at_exit = Some(rest.trim().to_string());
            } else if let Some(rest) = line.strip_prefix("total heap usage:") {
                summary.heap_usage = Some(rest.trim().to_string());
            } else if let Some(rest) = line.strip_prefix("definitely lost:") {
                summary.definitely_lost = Lost::parse(rest).unwrap_or_default();
            } else if let Some(rest) = line.strip_prefix("indirectly lost:") {
                summary.indirectly_lost = Lost::parse(rest).unwrap_or_default();
            } else if let Some(rest) = line.strip_prefix("possibly lost:") {
                summary.possibly_lost = Lost::parse(rest).unwrap_or_default();
            } else if let Some(rest) = line.strip_prefix("still reachable:") {
                summary.still_reachable = Lost::parse(rest).unwrap_or_default();
            } else if let Some(rest) = line.strip_prefix("ERROR SUMMARY:") {
                summary.error_count = rest
                    .split_whitespace()
                    .next()
                    .and_then(parse_count)
                    .unwrap_or(0);
            } else if line.starts_with("All heap blocks were freed") {
                summary.all_freed = true;
            } else if ISSUE_PREFIXES.iter().any(|p| line.starts_with(p))
                && !summary.issues.iter().any(|seen| seen == line)
            {
                summary.issues.push(line.to_string());
            }
        }
        summary
    }

    pub fn has_leaks(&self) -> bool {
        self.definitely_lost.bytes > 0
            || self.indirectly_lost.bytes > 0
            || self.possibly_lost.bytes > 0
    }

    pub fn render(&self) -> String {
        let mut out = String::from("=== Memory Leak Check ===\n");
        if let Some(in_use) = &self.in_use_at_exit {
            let _ = writeln!(out, "In use at exit:   {in_use}");
        }
        if let Some(usage) = &self.heap_usage {
            let _ = writeln!(out, "Heap usage:       {usage}");
        }
        if self.all_freed {
            out.push_str("All heap blocks were freed, no leaks are possible.\n");
        } else {
            for (label, lost) in [
                ("Definitely lost:", self.definitely_lost),
                ("Indirectly lost:", self.indirectly_lost),
                ("Possibly lost:  ", self.possibly_lost),
                ("Still reachable:", self.still_reachable),
            ] {
                let _ = writeln!(
                    out,
                    "{label}  {} bytes in {} blocks",
                    lost.bytes, lost.blocks
                );
            }
        }
        let _ = writeln!(out, "Errors:           {}", self.error_count);
        if !self.issues.is_empty() {
            out.push_str("\nIssues:\n");
            for issue in &self.issues {
                let _ = writeln!(out, "  - {issue}");
            }
        }
        out.push('\n');
        out.push_str(if self.has_leaks() {
            "Result: memory leaks detected.\n"
        } else if self.error_count > 0 {
            "Result: no leaks, but memory errors were reported.\n"
        } else {
            "Result: clean.\n"
        });
        out
    }
}

/// Per-syscall counts from an `strace -f` log.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TraceSummary {
    pub calls: BTreeMap<String, u64>,
    pub failures: BTreeMap<String, u64>,
    pub total: u64,
    pub exit_line: Option<String>,
}

impl TraceSummary {
    pub fn parse(log: &str) -> Self {
        let mut summary = TraceSummary::default();
        for line in log.lines() {
            let line = strip_trace_pid(line.trim());
            if line.starts_with("+++") {
                summary.exit_line = Some(line.trim_matches(|c| c == '+' || c == ' ').to_string());
                continue;
            }
            if line.starts_with("---") {
                continue;
            }
            let Some(name) = syscall_name(line) else {
                continue;
            };
            *summary.calls.entry(name.to_string()).or_default() += 1;
            summary.total += 1;
            if is_failure(line) {
                *summary.failures.entry(name.to_string()).or_default() += 1;
            }
        }
        summary
    }

    /// Syscalls by descending count, ties broken by name.
    pub fn ranked(&self) -> Vec<(&str, u64)> {
        let mut ranked: Vec<_> = self.calls.iter().map(|(k, v)| (k.as_str(), *v)).collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));
        ranked
    }

    pub fn render(&self) -> String {
        let mut out = String::from("=== System Call Trace ===\n");
        let _ = writeln!(
            out,
            "Total calls: {} ({} distinct)",
            self.total,
            self.calls.len()
        );
        if !self.calls.is_empty() {
            let _ = writeln!(out, "\n{:<24} {:>8} {:>8}", "syscall", "calls", "errors");
            for (name, count) in self.ranked() {
                let errors = self.failures.get(name).copied().unwrap_or(0);
                let _ = writeln!(out, "{name:<24} {count:>8} {errors:>8}");
            }
        }
        if let Some(exit) = &self.exit_line {
            let _ = writeln!(out, "\n{exit}");
        }
        out
    }
}

/// Build the report for `mode` from its log file.
pub async fn generate(mode: Mode, log_path: &Path) -> Option<String> {
    if !mode.has_report() {
        return None;
    }
    let log = match tokio::fs::read_to_string(log_path).await {
        Ok(log) => log,
        Err(e) => {
            warn!(path = %log_path.display(), error = %e, "Report log unreadable");
            return Some(format!("Report unavailable: could not read tool output ({e}).\n"));
        }
    };
    let report = match mode {
        Mode::LeakCheck => LeakSummary::parse(&log).render(),
        Mode::SyscallTrace => TraceSummary::parse(&log).render(),
        Mode::Compile | Mode::Debug => return None,
    };
    Some(report)
}

fn parse_count(text: &str) -> Option<u64> {
    text.replace(',', "").parse().ok()
}

/// Drop valgrind's `==1234==` line prefix.
fn strip_pid_prefix(line: &str) -> &str {
    if let Some(rest) = line.strip_prefix("==") {
        if let Some(end) = rest.find("==") {
            return &rest[end + 2..];
        }
    }
    line
}

/// Drop the `[pid 123] ` or `123 ` prefix strace adds with `-f`.
fn strip_trace_pid(line: &str) -> &str {
    if let Some(rest) = line.strip_prefix("[pid") {
        if let Some(end) = rest.find(']') {
            return rest[end + 1..].trim_start();
        }
    }
    let digits = line.bytes().take_while(u8::is_ascii_digit).count();
    if digits > 0 && line[digits..].starts_with(' ') {
        return line[digits..].trim_start();
    }
    line
}

fn syscall_name(line: &str) -> Option<&str> {
    let open = line.find('(')?;
    let name = &line[..open];
    let valid = !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_');
    valid.then_some(name)
}

fn is_failure(line: &str) -> bool {
    line.rsplit_once(" = ")
        .map_or(false, |(_, result)| result.starts_with("-1 "))
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALGRIND_LEAKY: &str = "\
==4242== Memcheck, a memory error detector
==4242== Invalid write of size 4
==4242==    at 0x109182: main (main.c:6)
==4242== Invalid write of size 4
==4242==    at 0x109190: main (main.c:7)
==4242== HEAP SUMMARY:
==4242==     in use at exit: 1,064 bytes in 2 blocks
==4242==   total heap usage: 3 allocs, 1 frees, 2,088 bytes allocated
==4242== LEAK SUMMARY:
==4242==    definitely lost: 40 bytes in 1 blocks
==4242==    indirectly lost: 0 bytes in 0 blocks
==4242==      possibly lost: 0 bytes in 0 blocks
==4242==    still reachable: 1,024 bytes in 1 blocks
==4242==         suppressed: 0 bytes in 0 blocks
==4242== ERROR SUMMARY: 3 errors from 2 contexts (suppressed: 0 from 0)
";

    const VALGRIND_CLEAN: &str = "\
==7== HEAP SUMMARY:
==7==     in use at exit: 0 bytes in 0 blocks
==7==   total heap usage: 1 allocs, 1 frees, 1,024 bytes allocated
==7== All heap blocks were freed -- no leaks are possible
==7== ERROR SUMMARY: 0 errors from 0 contexts (suppressed: 0 from 0)
";

    #[test]
    fn test_leak_summary_parse() {
        let summary = LeakSummary::parse(VALGRIND_LEAKY);
        assert_eq!(summary.definitely_lost, Lost { bytes: 40, blocks: 1 });
        assert_eq!(summary.still_reachable, Lost { bytes: 1024, blocks: 1 });
        assert_eq!(summary.error_count, 3);
        assert_eq!(summary.issues, vec!["Invalid write of size 4".to_string()]);
        assert!(summary.has_leaks());
        assert!(summary.render().contains("memory leaks detected"));
    }

    #[test]
    fn test_leak_summary_clean() {
        let summary = LeakSummary::parse(VALGRIND_CLEAN);
        assert!(summary.all_freed);
        assert!(!summary.has_leaks());
        let report = summary.render();
        assert!(report.contains("no leaks are possible"));
        assert!(report.contains("Result: clean."));
    }

    #[test]
    fn test_trace_summary_counts_and_failures() {
        let log = "\
123 execve(\"/s/main\", [\"/s/main\"], 0x7ffc /* 3 vars */) = 0
123 brk(NULL)                         = 0x55d0c000
123 openat(AT_FDCWD, \"/etc/ld.so.preload\", O_RDONLY|O_CLOEXEC) = -1 ENOENT (No such file or directory)
[pid   124] write(1, \"hi\\n\", 3)        = 3
123 write(1, \"x\", 1)                 = 1
123 --- SIGSEGV {si_signo=SIGSEGV} ---
123 +++ killed by SIGSEGV +++
";
        let summary = TraceSummary::parse(log);
        assert_eq!(summary.total, 5);
        assert_eq!(summary.calls["write"], 2);
        assert_eq!(summary.failures["openat"], 1);
        assert_eq!(summary.ranked()[0], ("write", 2));
        assert_eq!(summary.exit_line.as_deref(), Some("killed by SIGSEGV"));
        let report = summary.render();
        assert!(report.contains("Total calls: 5 (4 distinct)"));
    }

    #[test]
    fn test_trace_summary_without_pid_prefix() {
        let summary = TraceSummary::parse("close(3) = 0\nclose(4) = -1 EBADF (Bad file descriptor)\n");
        assert_eq!(summary.calls["close"], 2);
        assert_eq!(summary.failures["close"], 1);
    }

    #[tokio::test]
    async fn test_generate_missing_log() {
        let dir = tempfile::tempdir().unwrap();
        let report = generate(Mode::SyscallTrace, &dir.path().join("absent.log"))
            .await
            .unwrap();
        assert!(report.starts_with("Report unavailable"));
        assert!(generate(Mode::Compile, dir.path()).await.is_none());
    }
}
