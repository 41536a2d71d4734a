use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

/// Number of hex characters kept from the SHA-256 of a prompt.
pub const PROMPT_HASH_LEN: usize = 12;

#[derive(Debug, thiserror::Error)]
pub enum PromptError {
    #[error("Prompt version '{version}' not found at {path:?}\nAvailable versions: {}\nCreate a prompt file at: {path:?}", available_list(.available))]
    NotFound {
        version: String,
        path: PathBuf,
        available: Vec<String>,
    },
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
}

fn available_list(available: &[String]) -> String {
    if available.is_empty() {
        "none".to_string()
    } else {
        available.join(", ")
    }
}

/// A resolved system prompt together with its content hash.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedPrompt {
    pub version: String,
    pub content: String,
    pub hash: String,
}

/// Versioned prompt files (`v001.md`, `v002.md`, ...) in one directory.
#[derive(Debug, Clone)]
pub struct PromptStore {
    prompts_dir: PathBuf,
}

impl PromptStore {
    pub fn new<P: AsRef<Path>>(prompts_dir: P) -> Self {
        Self {
            prompts_dir: prompts_dir.as_ref().to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.prompts_dir
    }

    pub fn prompt_path(&self, version: &str) -> PathBuf {
        self.prompts_dir.join(format!("{}.md", version))
    }

    /// Sorted version identifiers of every `v*.md` file.
    pub fn list_versions(&self) -> Result<Vec<String>, PromptError> {
        if !self.prompts_dir.exists() {
            return Ok(Vec::new());
        }

        let mut versions = Vec::new();
        for entry in fs::read_dir(&self.prompts_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("md") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
                if stem.starts_with('v') {
                    versions.push(stem.to_string());
                }
            }
        }
        versions.sort();
        Ok(versions)
    }

    pub fn load(&self, version: &str) -> Result<LoadedPrompt, PromptError> {
        let path = self.prompt_path(version);
        if !path.exists() {
            return Err(PromptError::NotFound {
                version: version.to_string(),
                path,
                available: self.list_versions()?,
            });
        }

        let content = fs::read_to_string(&path)?;
        let hash = content_hash(&content);
        log::info!("Loaded prompt {} from {:?} (hash: {})", version, path, hash);
        Ok(LoadedPrompt {
            version: version.to_string(),
            content,
            hash,
        })
    }
}

/// Short SHA-256 of the prompt text, used for provenance.
pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    let hash = format!("{:x}", hasher.finalize());
    hash[..PROMPT_HASH_LEN].to_string()
}

/// Appends one report to the system prompt in the fixed user-message format.
pub fn format_prompt(system_prompt: &str, subject: &str, description: &str) -> String {
    format!(
        "{}\n\n**Betreff:** {}\n\n**Beschreibung:** {}",
        system_prompt, subject, description
    )
}
