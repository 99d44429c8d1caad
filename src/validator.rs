//! Static screening of submitted source text.
//!
//! The denylist is a cheap pre-filter run before anything is spawned. It is
//! intentionally permissive: any `<name>(` occurrence that does not continue
//! a longer identifier is rejected, including matches inside comments and
//! string literals. Containment comes from the resource limits applied in
//! [`crate::sandbox`], not from this list.

use thiserror::Error;

/// Symbols rejected when followed by `(`.
pub const DENYLIST: &[&str] = &[
    // process control
    "fork",
    "vfork",
    "clone",
    "execl",
    "execlp",
    "execle",
    "execv",
    "execvp",
    "execvpe",
    "execve",
    "fexecve",
    "system",
    "popen",
    "posix_spawn",
    "posix_spawnp",
    // networking
    "socket",
    "socketpair",
    "bind",
    "connect",
    "accept",
    "accept4",
    "listen",
    "sendto",
    "recvfrom",
    "getaddrinfo",
    "gethostbyname",
    // filesystem mutation
    "unlink",
    "unlinkat",
    "remove",
    "rename",
    "rmdir",
    "chmod",
    "fchmod",
    "chown",
    "fchown",
    "mount",
    "umount",
    "umount2",
    "symlink",
    "truncate",
    // signals and privilege
    "ptrace",
    "kill",
    "killpg",
    "setuid",
    "setgid",
    "seteuid",
    "setegid",
    "setreuid",
    "setresuid",
    "chroot",
    "setrlimit",
    "prlimit",
    "setsid",
    "setpgid",
    // dynamic loading
    "dlopen",
    "dlsym",
    // raw memory and inline assembly
    "mmap",
    "mprotect",
    "syscall",
    "asm",
    "__asm__",
    // unsafe libc
    "gets",
    "mktemp",
    "tmpnam",
    "setjmp",
    "longjmp",
    "sigsetjmp",
];

/// Limits applied after the denylist scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidationLimits {
    pub max_chars: usize,
    pub max_lines: usize,
}

impl Default for ValidationLimits {
    fn default() -> Self {
        Self {
            max_chars: 50_000,
            max_lines: 2_000,
        }
    }
}

/// Why a submission was refused. `Display` is the message shown to the client.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    #[error("no code provided")]
    Empty,

    #[error("restricted function call: {symbol}")]
    Restricted { symbol: &'static str },

    #[error("code exceeds maximum length of {max} characters")]
    TooLong { max: usize },

    #[error("code exceeds maximum of {max} lines")]
    TooManyLines { max: usize },
}

/// Screen `source`, stopping at the first failed check.
pub fn validate(source: &str, limits: &ValidationLimits) -> Result<(), Rejection> {
    if source.trim().is_empty() {
        return Err(Rejection::Empty);
    }

    if let Some(symbol) = find_restricted(source) {
        return Err(Rejection::Restricted { symbol });
    }

    if source.chars().count() > limits.max_chars {
        return Err(Rejection::TooLong {
            max: limits.max_chars,
        });
    }

    if source.lines().count() > limits.max_lines {
        return Err(Rejection::TooManyLines {
            max: limits.max_lines,
        });
    }

    Ok(())
}

fn find_restricted(source: &str) -> Option<&'static str> {
    DENYLIST.iter().copied().find(|name| {
        source.match_indices(name).any(|(at, _)| {
            let starts_identifier = source[..at]
                .chars()
                .next_back()
                .map_or(true, |c| !is_identifier_char(c));
            starts_identifier && source[at + name.len()..].starts_with('(')
        })
    })
}

fn is_identifier_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}
