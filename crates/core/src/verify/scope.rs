//! Causal-chain extraction: which modules, functions and tests a diff
//! touches.
//!
//! This is a shallow approximation (depth 1). Module names come from
//! changed source paths, functions from added definition lines, and test
//! files from naming conventions.

use std::path::Path;
use std::sync::OnceLock;

use regex_lite::Regex;
use tracing::{debug, warn};

use super::workspace::list_files;
use crate::config::VerifyConfig;
use crate::models::{CausalChain, Diff};

/// The subset of verification settings that decides scope.
#[derive(Debug, Clone)]
pub struct ScopeRules {
    pub source_extension: String,
    pub source_roots: Vec<String>,
    pub test_patterns: Vec<String>,
    pub exclude: Vec<String>,
}

impl From<&VerifyConfig> for ScopeRules {
    fn from(config: &VerifyConfig) -> Self {
        Self {
            source_extension: config.source_extension.clone(),
            source_roots: config.source_roots.clone(),
            test_patterns: config.test_patterns.clone(),
            exclude: config.exclude.clone(),
        }
    }
}

impl Default for ScopeRules {
    fn default() -> Self {
        Self::from(&VerifyConfig::default())
    }
}

impl ScopeRules {
    fn suffix(&self) -> String {
        format!(".{}", self.source_extension)
    }

    pub fn is_source(&self, path: &str) -> bool {
        path.ends_with(&self.suffix())
    }

    /// `src/pkg/mod_a.py` -> `pkg.mod_a`.
    pub fn module_name(&self, path: &str) -> Option<String> {
        let stem = path.strip_suffix(&self.suffix())?;
        let dotted = stem.replace(['/', '\\'], ".");
        let dotted = self
            .source_roots
            .iter()
            .find_map(|root| dotted.strip_prefix(&format!("{}.", root)))
            .map(str::to_string)
            .unwrap_or(dotted);
        (!dotted.is_empty()).then_some(dotted)
    }

    /// Modules for every source file among `paths`, deduplicated in order.
    pub fn modules_for_paths<'a>(&self, paths: impl IntoIterator<Item = &'a str>) -> Vec<String> {
        let mut modules: Vec<String> = Vec::new();
        for path in paths {
            if let Some(module) = self.module_name(path) {
                if !modules.contains(&module) {
                    modules.push(module);
                }
            }
        }
        modules
    }

    /// Source file of `module` under `root`, trying the bare path first and
    /// then each source root.
    pub fn module_file(&self, root: &Path, module: &str) -> Option<String> {
        let rel = format!("{}{}", module.replace('.', "/"), self.suffix());
        if root.join(&rel).is_file() {
            return Some(rel);
        }
        self.source_roots
            .iter()
            .map(|src| format!("{}/{}", src, rel))
            .find(|candidate| root.join(candidate).is_file())
    }

    /// Test files under `root` matching any pattern for any part of any
    /// module name.
    pub fn find_test_files(&self, root: &Path, modules: &[String]) -> Vec<String> {
        if modules.is_empty() {
            return Vec::new();
        }
        let files = match list_files(root, &self.exclude) {
            Ok(files) => files,
            Err(e) => {
                warn!(root = %root.display(), error = %e, "cannot list files for test discovery");
                return Vec::new();
            }
        };

        let mut globs: Vec<String> = Vec::new();
        for module in modules {
            for part in module.split('.').filter(|p| !p.is_empty()) {
                for pattern in &self.test_patterns {
                    let glob = pattern
                        .replace("{name}", part)
                        .replace("{ext}", &self.source_extension);
                    if !globs.contains(&glob) {
                        globs.push(glob);
                    }
                }
            }
        }

        let mut tests: Vec<String> = Vec::new();
        for file in &files {
            let name = file.rsplit('/').next().unwrap_or(file);
            let hit = globs.iter().any(|glob| {
                if glob.contains('/') {
                    glob_match::glob_match(glob, file)
                } else {
                    glob_match::glob_match(glob, name)
                }
            });
            if hit && !tests.contains(file) {
                tests.push(file.clone());
            }
        }
        tests
    }
}

fn definition_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(concat!(
            r"^\+\s*(?:pub(?:\([^)]*\))?\s+)?(?:async\s+)?",
            r"(?:def|class|fn|struct|enum|trait|impl)\s+([A-Za-z_][A-Za-z0-9_]*)",
        ))
        .expect("static definition regex")
    })
}

/// Names defined on added lines of a patch.
pub fn added_definitions(patch: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for line in patch.lines() {
        if line.starts_with("+++") {
            continue;
        }
        if let Some(name) = definition_re()
            .captures(line)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
        {
            if !names.contains(&name) {
                names.push(name);
            }
        }
    }
    names
}

/// Derive a depth-1 causal chain for `diff`, discovering tests under `root`.
pub fn extract_causal_chain(diff: &Diff, root: &Path, rules: &ScopeRules) -> CausalChain {
    let files = diff.all_affected_files();
    let modules = rules.modules_for_paths(files.iter().copied());
    let test_files = rules.find_test_files(root, &modules);

    let mut chain = CausalChain::new(&diff.id);
    chain.affected_files = files.iter().map(|f| f.to_string()).collect();
    chain.affected_functions = added_definitions(&diff.content);
    chain.affected_modules = modules;
    chain.call_depth = 1;
    chain.test_files = test_files;

    debug!(
        diff_id = %diff.id,
        modules = chain.affected_modules.len(),
        tests = chain.test_files.len(),
        "causal chain extracted"
    );
    chain
}
