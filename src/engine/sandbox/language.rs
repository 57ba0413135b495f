use std::path::{Path, PathBuf};

use crate::engine::{error::EngineError, models::LanguageInfo};

/// A program invocation inside the sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandLine {
    fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// `program` followed by `args`.
    pub fn argv(&self) -> Vec<String> {
        let mut argv = Vec::with_capacity(self.args.len() + 1);
        argv.push(self.program.clone());
        argv.extend(self.args.iter().cloned());
        argv
    }
}

pub type CommandBuilder = fn(&Path) -> CommandLine;

/// What compiling leaves next to the source file.
#[derive(Debug, Clone, Copy)]
enum Artifact {
    None,
    /// Source path without extension.
    Executable,
    /// Source path with the extension swapped.
    Sibling(&'static str),
}

#[derive(Debug, Clone)]
pub struct LanguageSpec {
    pub id: &'static str,
    pub display_name: &'static str,
    pub file_extension: &'static str,
    pub source_name: &'static str,
    pub image: &'static str,
    compile: Option<CommandBuilder>,
    run: CommandBuilder,
    artifact: Artifact,
}

impl LanguageSpec {
    pub fn needs_compilation(&self) -> bool {
        self.compile.is_some()
    }

    pub fn compile_command(&self, source: &Path) -> Option<CommandLine> {
        self.compile.map(|build| build(source))
    }

    pub fn run_command(&self, source: &Path) -> CommandLine {
        (self.run)(source)
    }

    pub fn source_path(&self, work_dir: &Path) -> PathBuf {
        work_dir.join(self.source_name)
    }

    /// Compiled output, derived from the source file name.
    pub fn artifact_path(&self, source: &Path) -> Option<PathBuf> {
        match self.artifact {
            Artifact::None => None,
            Artifact::Executable => Some(source.with_extension("")),
            Artifact::Sibling(ext) => Some(source.with_extension(ext)),
        }
    }

    /// Host programs a non-containerized runner needs on `PATH`.
    pub fn toolchain(&self) -> Vec<String> {
        let sample_source = Path::new("/sandbox").join(self.source_name);
        self.compile_command(&sample_source)
            .into_iter()
            .chain(std::iter::once(self.run_command(&sample_source)))
            .map(|cmd| cmd.program)
            .filter(|program| !program.starts_with('/'))
            .collect()
    }

    pub fn info(&self) -> LanguageInfo {
        LanguageInfo {
            id: self.id.to_string(),
            display_name: self.display_name.to_string(),
            file_extension: self.file_extension.to_string(),
        }
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn artifact_arg(source: &Path) -> String {
    path_arg(&source.with_extension(""))
}

fn parent_arg(source: &Path) -> String {
    path_arg(source.parent().unwrap_or(Path::new(".")))
}

// Runtimes that reserve their heap up front need an explicit ceiling that
// fits inside the sandbox memory limit.
const NODE_HEAP: &str = "--max-old-space-size=128";

const JVM_FLAGS: &[&str] = &[
    "-Xss16m",
    "-Xms16m",
    "-Xmx128m",
    "-XX:+UseSerialGC",
    "-XX:TieredStopAtLevel=1",
];

/// JVM tuning flags, prefixed for tools that forward them (`javac -J...`).
fn jvm_args(prefix: &str) -> Vec<String> {
    JVM_FLAGS.iter().map(|flag| format!("{prefix}{flag}")).collect()
}

static LANGUAGES: &[LanguageSpec] = &[
    LanguageSpec {
        id: "python",
        display_name: "Python",
        file_extension: "py",
        source_name: "main.py",
        image: "python:3.12-alpine",
        compile: None,
        run: |src| CommandLine::new("python3", [path_arg(src)]),
        artifact: Artifact::None,
    },
    LanguageSpec {
        id: "javascript",
        display_name: "JavaScript",
        file_extension: "js",
        source_name: "main.js",
        image: "node:22-alpine",
        compile: None,
        run: |src| CommandLine::new("node", [NODE_HEAP.to_string(), path_arg(src)]),
        artifact: Artifact::None,
    },
    LanguageSpec {
        id: "ruby",
        display_name: "Ruby",
        file_extension: "rb",
        source_name: "main.rb",
        image: "ruby:3.3-alpine",
        compile: None,
        run: |src| CommandLine::new("ruby", [path_arg(src)]),
        artifact: Artifact::None,
    },
    LanguageSpec {
        id: "shell",
        display_name: "Shell",
        file_extension: "sh",
        source_name: "main.sh",
        image: "alpine:3.20",
        compile: None,
        run: |src| CommandLine::new("sh", [path_arg(src)]),
        artifact: Artifact::None,
    },
    LanguageSpec {
        id: "c",
        display_name: "C",
        file_extension: "c",
        source_name: "main.c",
        image: "gcc:14",
        compile: Some(|src| {
            CommandLine::new(
                "gcc",
                [
                    "-O2".to_string(),
                    "-o".to_string(),
                    artifact_arg(src),
                    path_arg(src),
                    "-lm".to_string(),
                ],
            )
        }),
        run: |src| CommandLine::new(artifact_arg(src), Vec::<String>::new()),
        artifact: Artifact::Executable,
    },
    LanguageSpec {
        id: "cpp",
        display_name: "C++",
        file_extension: "cpp",
        source_name: "main.cpp",
        image: "gcc:14",
        compile: Some(|src| {
            CommandLine::new(
                "g++",
                [
                    "-O2".to_string(),
                    "-std=c++17".to_string(),
                    "-o".to_string(),
                    artifact_arg(src),
                    path_arg(src),
                ],
            )
        }),
        run: |src| CommandLine::new(artifact_arg(src), Vec::<String>::new()),
        artifact: Artifact::Executable,
    },
    LanguageSpec {
        id: "go",
        display_name: "Go",
        file_extension: "go",
        source_name: "main.go",
        image: "golang:1.22-alpine",
        compile: Some(|src| {
            CommandLine::new(
                "go",
                [
                    "build".to_string(),
                    "-o".to_string(),
                    artifact_arg(src),
                    path_arg(src),
                ],
            )
        }),
        run: |src| CommandLine::new(artifact_arg(src), Vec::<String>::new()),
        artifact: Artifact::Executable,
    },
    LanguageSpec {
        id: "rust",
        display_name: "Rust",
        file_extension: "rs",
        source_name: "main.rs",
        image: "rust:1.79-alpine",
        compile: Some(|src| {
            CommandLine::new(
                "rustc",
                [
                    "-O".to_string(),
                    "-o".to_string(),
                    artifact_arg(src),
                    path_arg(src),
                ],
            )
        }),
        run: |src| CommandLine::new(artifact_arg(src), Vec::<String>::new()),
        artifact: Artifact::Executable,
    },
    LanguageSpec {
        id: "java",
        display_name: "Java",
        file_extension: "java",
        source_name: "Main.java",
        image: "eclipse-temurin:21-jdk-alpine",
        compile: Some(|src| {
            let mut args = jvm_args("-J");
            args.extend(["-d".to_string(), parent_arg(src), path_arg(src)]);
            CommandLine::new("javac", args)
        }),
        run: |src| {
            let mut args = jvm_args("");
            args.extend(["-cp".to_string(), parent_arg(src), "Main".to_string()]);
            CommandLine::new("java", args)
        },
        artifact: Artifact::Sibling("class"),
    },
];

/// Looks up a language by identifier. Matching ignores ASCII case.
pub fn resolve(language_id: &str) -> Result<&'static LanguageSpec, EngineError> {
    let wanted = language_id.trim();
    LANGUAGES
        .iter()
        .find(|spec| spec.id.eq_ignore_ascii_case(wanted))
        .ok_or_else(|| EngineError::UnsupportedLanguage(language_id.to_string()))
}

/// The language set surface: exactly the domain of [`resolve`].
pub fn catalog() -> Vec<LanguageInfo> {
    LANGUAGES.iter().map(LanguageSpec::info).collect()
}

pub fn all() -> &'static [LanguageSpec] {
    LANGUAGES
}
