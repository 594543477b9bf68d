// Stack definition store and the re-convergence collaborator.
//
// A stack whose declarative definition is registered here can be updated by
// re-applying the whole definition; the engine's own convergence logic then
// decides which services to recreate based on changed image references.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;

const COMPOSE_FILE_NAMES: [&str; 4] = [
    "compose.yaml",
    "compose.yml",
    "docker-compose.yaml",
    "docker-compose.yml",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackDefinition {
    pub name: String,
    pub file: PathBuf,
}

#[async_trait]
pub trait StackStore: Send + Sync {
    /// `None` means the stack exists on the engine but its definition was
    /// never registered with this system.
    async fn get_definition(&self, stack_name: &str) -> Option<StackDefinition>;
}

/// Directory-backed store: one subdirectory per stack, holding its compose
/// file under any of the conventional names.
pub struct FsStackStore {
    root: PathBuf,
}

impl FsStackStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl StackStore for FsStackStore {
    async fn get_definition(&self, stack_name: &str) -> Option<StackDefinition> {
        // Stack names come from engine labels; refuse anything that could
        // escape the store root.
        if stack_name.is_empty()
            || stack_name.contains(['/', '\\'])
            || stack_name.starts_with('.')
        {
            return None;
        }
        let dir = self.root.join(stack_name);
        for file_name in COMPOSE_FILE_NAMES {
            let candidate = dir.join(file_name);
            if tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
                return Some(StackDefinition {
                    name: stack_name.to_string(),
                    file: candidate,
                });
            }
        }
        None
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConvergeReport {
    /// Container names the convergence recreated or started.
    pub services_recreated: Vec<String>,
}

#[async_trait]
pub trait StackConverger: Send + Sync {
    async fn converge(&self, definition: &StackDefinition) -> anyhow::Result<ConvergeReport>;
}

/// Shells out to `docker compose up -d`, which preserves every stack-level
/// setting with no reconstruction needed.
pub struct ComposeCli {
    binary: String,
}

impl ComposeCli {
    pub fn new() -> Self {
        Self {
            binary: "docker".to_string(),
        }
    }
}

impl Default for ComposeCli {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StackConverger for ComposeCli {
    async fn converge(&self, definition: &StackDefinition) -> anyhow::Result<ConvergeReport> {
        let output = Command::new(&self.binary)
            .arg("compose")
            .arg("-p")
            .arg(&definition.name)
            .arg("-f")
            .arg(&definition.file)
            .arg("up")
            .arg("-d")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::ensure!(
            output.status.success(),
            "compose up for stack {} exited with {}: {}",
            definition.name,
            output.status,
            stderr.trim()
        );

        Ok(ConvergeReport {
            services_recreated: parse_recreated(&stderr),
        })
    }
}

/// Compose reports progress on stderr as `Container <name>  Recreated` /
/// `Started`; collect the names it touched.
fn parse_recreated(stderr: &str) -> Vec<String> {
    let mut recreated = Vec::new();
    for line in stderr.lines() {
        let line = line.trim();
        let Some(rest) = line.strip_prefix("Container ") else {
            continue;
        };
        if !(line.ends_with("Recreated") || line.ends_with("Started") || line.ends_with("Created"))
        {
            continue;
        }
        if let Some(name) = rest.split_whitespace().next()
            && !recreated.contains(&name.to_string())
        {
            recreated.push(name.to_string());
        }
    }
    recreated
}
