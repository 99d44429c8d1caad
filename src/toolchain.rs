//! Compiler, debugger and tracer selection.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::SessionError;
use crate::sandbox::{CommandSpec, ResourceLimits};
use crate::state::Mode;

pub const BINARY_NAME: &str = "main";
pub const VALGRIND_LOG: &str = "valgrind.log";
pub const STRACE_LOG: &str = "strace.log";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    C,
    Cpp,
}

impl Language {
    pub fn source_file(self) -> &'static str {
        match self {
            Language::C => "main.c",
            Language::Cpp => "main.cpp",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Language::C => "c",
            Language::Cpp => "cpp",
        }
    }

    pub fn all() -> [Language; 2] {
        [Language::C, Language::Cpp]
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for Language {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "c" => Ok(Language::C),
            "cpp" | "c++" | "cxx" => Ok(Language::Cpp),
            other => Err(SessionError::Toolchain(format!("unknown language '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compiler {
    Gcc,
    Gxx,
    Clang,
    Clangxx,
}

impl Compiler {
    /// Resolve a client-supplied compiler name for `language`.
    pub fn select(language: Language, name: &str) -> Result<Self, SessionError> {
        let compiler = match (language, name) {
            (Language::C, "gcc") => Compiler::Gcc,
            (Language::C, "clang") => Compiler::Clang,
            (Language::Cpp, "g++" | "gcc") => Compiler::Gxx,
            (Language::Cpp, "clang++" | "clang") => Compiler::Clangxx,
            _ => {
                return Err(SessionError::Toolchain(format!(
                    "compiler '{name}' is not available for {language}"
                )))
            }
        };
        Ok(compiler)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OptLevel {
    #[default]
    O0,
    O1,
    O2,
    O3,
    Os,
}

impl OptLevel {
    pub fn flag(self) -> &'static str {
        match self {
            OptLevel::O0 => "-O0",
            OptLevel::O1 => "-O1",
            OptLevel::O2 => "-O2",
            OptLevel::O3 => "-O3",
            OptLevel::Os => "-Os",
        }
    }
}

impl FromStr for OptLevel {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim_start_matches('-') {
            "O0" | "0" | "" => Ok(OptLevel::O0),
            "O1" | "1" => Ok(OptLevel::O1),
            "O2" | "2" => Ok(OptLevel::O2),
            "O3" | "3" => Ok(OptLevel::O3),
            "Os" | "s" => Ok(OptLevel::Os),
            other => Err(SessionError::Toolchain(format!(
                "unknown optimization level '{other}'"
            ))),
        }
    }
}

/// Executable paths for every external tool the sessions invoke.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolchainConfig {
    pub gcc: PathBuf,
    pub gxx: PathBuf,
    pub clang: PathBuf,
    pub clangxx: PathBuf,
    pub gdb: PathBuf,
    pub valgrind: PathBuf,
    pub strace: PathBuf,
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        Self {
            gcc: "gcc".into(),
            gxx: "g++".into(),
            clang: "clang".into(),
            clangxx: "clang++".into(),
            gdb: "gdb".into(),
            valgrind: "valgrind".into(),
            strace: "strace".into(),
        }
    }
}

impl ToolchainConfig {
    fn compiler_path(&self, compiler: Compiler) -> &Path {
        match compiler {
            Compiler::Gcc => &self.gcc,
            Compiler::Gxx => &self.gxx,
            Compiler::Clang => &self.clang,
            Compiler::Clangxx => &self.clangxx,
        }
    }
}

/// A validated build: what to compile and how to run the result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildPlan {
    pub mode: Mode,
    pub language: Language,
    pub compiler: Compiler,
    pub opt_level: OptLevel,
}

impl BuildPlan {
    pub fn new(
        mode: Mode,
        language: &str,
        compiler: &str,
        opt_level: Option<&str>,
    ) -> Result<Self, SessionError> {
        let language = language.parse::<Language>()?;
        let compiler = Compiler::select(language, compiler)?;
        let opt_level = match mode {
            Mode::Debug => OptLevel::O0,
            _ => opt_level.map(str::parse::<OptLevel>).transpose()?.unwrap_or_default(),
        };
        Ok(Self {
            mode,
            language,
            compiler,
            opt_level,
        })
    }

    pub fn compile_command(
        &self,
        tools: &ToolchainConfig,
        scratch: &Path,
        limits: ResourceLimits,
    ) -> CommandSpec {
        let mut spec = CommandSpec::new(path_arg(tools.compiler_path(self.compiler)), limits)
            .arg(self.opt_level.flag());
        if matches!(self.mode, Mode::Debug | Mode::LeakCheck) {
            spec = spec.arg("-g");
        }
        if self.language == Language::Cpp {
            spec = spec.arg("-std=c++20");
        }
        // The compiler sees a terminal; keep ANSI colour out of diagnostics.
        spec.args(["-fdiagnostics-color=never", "-Wall", "-pthread", "-o"])
            .arg(path_arg(&scratch.join(BINARY_NAME)))
            .arg(path_arg(&scratch.join(self.language.source_file())))
            .arg("-lm")
    }

    pub fn run_command(
        &self,
        tools: &ToolchainConfig,
        scratch: &Path,
        limits: ResourceLimits,
    ) -> CommandSpec {
        let binary = path_arg(&scratch.join(BINARY_NAME));
        match self.mode {
            Mode::Compile => CommandSpec::new(binary, limits),
            Mode::Debug => CommandSpec::new(path_arg(&tools.gdb), limits)
                .arg("-q")
                .arg(binary),
            Mode::LeakCheck => CommandSpec::new(path_arg(&tools.valgrind), limits)
                .args([
                    "--leak-check=full",
                    "--show-leak-kinds=all",
                    "--track-origins=yes",
                ])
                .arg(format!(
                    "--log-file={}",
                    path_arg(&scratch.join(VALGRIND_LOG))
                ))
                .arg(binary),
            Mode::SyscallTrace => CommandSpec::new(path_arg(&tools.strace), limits)
                .args(["-f", "-qq", "-o"])
                .arg(path_arg(&scratch.join(STRACE_LOG)))
                .arg(binary),
        }
    }

    /// Log file the report step reads, for modes that produce one.
    pub fn report_log(&self, scratch: &Path) -> Option<PathBuf> {
        match self.mode {
            Mode::LeakCheck => Some(scratch.join(VALGRIND_LOG)),
            Mode::SyscallTrace => Some(scratch.join(STRACE_LOG)),
            Mode::Compile | Mode::Debug => None,
        }
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
