//! Resolver registry
//!
//! Classifies import/load sources (file, URL, module, special resolver) and
//! resolves module references against registered prefix roots. Builtin
//! resolvers (`@INPUT`, `@TIME`) produce values directly instead of fetching
//! content.

use std::path::{Path, PathBuf};

use indexmap::IndexMap;

use crate::error::{ImportErrorCode, MlldError};
use crate::platform::{Clock, FileSystem};
use crate::value::Value;

/// What an import source turned out to be
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportKind {
    File(String),
    Url(String),
    Module { prefix: String, name: String },
    /// Bare `@NAME` matching a special resolver
    Resolver(String),
}

/// Classify a raw import source. URLs are detected by scheme; `@prefix/name`
/// is a module reference; bare `@NAME` may match a special resolver;
/// everything else is a path.
pub fn classify(source: &str) -> ImportKind {
    if source.starts_with("http://") || source.starts_with("https://") {
        return ImportKind::Url(source.to_string());
    }
    if let Some(rest) = source.strip_prefix('@') {
        if let Some((prefix, name)) = rest.split_once('/') {
            return ImportKind::Module {
                prefix: prefix.to_string(),
                name: strip_module_metadata(name),
            };
        }
        return ImportKind::Resolver(rest.to_string());
    }
    ImportKind::File(source.to_string())
}

/// Module refs may carry `#hash` pins and explicit extensions; both are
/// stripped before lookup
fn strip_module_metadata(name: &str) -> String {
    let name = name.split('#').next().unwrap_or(name);
    let name = name.strip_suffix(".mld.md").unwrap_or(name);
    let name = name.strip_suffix(".mld").unwrap_or(name);
    name.to_string()
}

pub struct ResolverRegistry {
    /// Module prefix (`local`, `user`, ...) to directory root
    module_roots: IndexMap<String, PathBuf>,
    /// Payload served by `@INPUT`, when the host provided one
    input: Option<String>,
}

impl ResolverRegistry {
    pub fn new() -> Self {
        Self {
            module_roots: IndexMap::new(),
            input: None,
        }
    }

    pub fn register_module_root(&mut self, prefix: impl Into<String>, root: impl Into<PathBuf>) {
        self.module_roots.insert(prefix.into(), root.into());
    }

    pub fn set_input(&mut self, payload: impl Into<String>) {
        self.input = Some(payload.into());
    }

    /// Locate a module file under its prefix root; `.mld` wins over `.mld.md`
    pub fn resolve_module(
        &self,
        prefix: &str,
        name: &str,
        fs: &dyn FileSystem,
    ) -> Result<PathBuf, MlldError> {
        let root = self.module_roots.get(prefix).ok_or_else(|| {
            MlldError::import(
                ImportErrorCode::ModuleNotFound,
                format!("unknown module prefix @{prefix}/"),
                format!("@{prefix}/{name}"),
            )
        })?;
        for candidate in [
            root.join(format!("{name}.mld")),
            root.join(format!("{name}.mld.md")),
        ] {
            if fs.is_file(&candidate) {
                return Ok(candidate);
            }
        }
        Err(MlldError::import(
            ImportErrorCode::ModuleNotFound,
            format!("module @{prefix}/{name} not found"),
            format!("@{prefix}/{name}"),
        ))
    }

    /// Values served by builtin resolvers; `None` means the name is not a
    /// builtin
    pub fn builtin(&self, name: &str, clock: &dyn Clock) -> Option<Value> {
        match name {
            "INPUT" => Some(match &self.input {
                Some(payload) => match serde_json::from_str::<serde_json::Value>(payload) {
                    Ok(json) => Value::from_json(&json),
                    Err(_) => Value::Text(payload.clone()),
                },
                None => Value::Null,
            }),
            "TIME" => Some(Value::Text(clock.timestamp())),
            _ => None,
        }
    }

    pub fn is_builtin(&self, name: &str) -> bool {
        matches!(name, "INPUT" | "TIME")
    }
}

impl Default for ResolverRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Host part of a URL, for allow/deny checks and `.ctx.domain`
pub fn domain_of(url: &str) -> Option<String> {
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))?;
    let host = rest.split(['/', '?', '#']).next()?;
    let host = host.split('@').next_back()?;
    let host = host.split(':').next()?;
    if host.is_empty() {
        None
    } else {
        Some(host.to_string())
    }
}

/// Deny list wins over allow list; an empty allow list allows everything
pub fn url_allowed(url: &str, allowed: &[String], blocked: &[String]) -> Result<(), MlldError> {
    let Some(domain) = domain_of(url) else {
        return Err(MlldError::security(format!("malformed URL: {url}")));
    };
    let matches = |entry: &String| domain == *entry || domain.ends_with(&format!(".{entry}"));
    if blocked.iter().any(matches) {
        return Err(MlldError::security(format!("domain {domain} is blocked")));
    }
    if !allowed.is_empty() && !allowed.iter().any(matches) {
        return Err(MlldError::security(format!(
            "domain {domain} is not in the allowed list"
        )));
    }
    Ok(())
}

/// `.mld.md` modules carry YAML frontmatter metadata and mark executable
/// regions with ```` ```mlld-run ```` fences; everything else is prose.
/// Returns the executable source for such files, or the input unchanged for
/// plain `.mld`.
pub fn executable_source(path: &Path, source: &str) -> String {
    let is_markdown_module = path
        .to_str()
        .is_some_and(|p| p.ends_with(".mld.md") || p.ends_with(".md"));
    if !is_markdown_module {
        return source.to_string();
    }
    let mut out = String::new();
    let mut in_run_fence = false;
    for line in source.lines() {
        if in_run_fence {
            if line.trim_end() == "```" {
                in_run_fence = false;
            } else {
                out.push_str(line);
                out.push('\n');
            }
        } else if line.trim_end() == "```mlld-run" {
            in_run_fence = true;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{FixedClock, MemoryFileSystem};

    #[test]
    fn classification() {
        assert_eq!(
            classify("https://example.com/x.mld"),
            ImportKind::Url("https://example.com/x.mld".into())
        );
        assert_eq!(
            classify("@user/tools"),
            ImportKind::Module {
                prefix: "user".into(),
                name: "tools".into()
            }
        );
        assert_eq!(classify("@INPUT"), ImportKind::Resolver("INPUT".into()));
        assert_eq!(classify("./a.mld"), ImportKind::File("./a.mld".into()));
    }

    #[test]
    fn module_metadata_is_stripped() {
        assert_eq!(
            classify("@local/tools.mld#abc123"),
            ImportKind::Module {
                prefix: "local".into(),
                name: "tools".into()
            }
        );
    }

    #[test]
    fn module_lookup_prefers_mld() {
        let fs = MemoryFileSystem::new()
            .with_file("/mods/a.mld", "")
            .with_file("/mods/a.mld.md", "");
        let mut registry = ResolverRegistry::new();
        registry.register_module_root("local", "/mods");
        let path = registry.resolve_module("local", "a", &fs).unwrap();
        assert_eq!(path, PathBuf::from("/mods/a.mld"));
    }

    #[test]
    fn time_resolver_uses_clock() {
        let registry = ResolverRegistry::new();
        let clock = FixedClock {
            millis: 0,
            stamp: "2026-01-01T00:00:00Z".into(),
        };
        let value = registry.builtin("TIME", &clock).unwrap();
        assert_eq!(value.as_str(), Some("2026-01-01T00:00:00Z"));
    }

    #[test]
    fn url_lists() {
        assert!(url_allowed("https://docs.example.com/a", &[], &[]).is_ok());
        assert!(url_allowed(
            "https://docs.example.com/a",
            &["example.com".into()],
            &[]
        )
        .is_ok());
        assert!(url_allowed("https://evil.io/a", &["example.com".into()], &[]).is_err());
        assert!(url_allowed("https://a.io/x", &[], &["a.io".into()]).is_err());
    }

    #[test]
    fn mlld_md_extracts_run_fences() {
        let source = "---\nname: demo\n---\nProse here.\n```mlld-run\n/var @x = 1\n```\nMore prose.\n";
        let out = executable_source(Path::new("mod.mld.md"), source);
        assert_eq!(out, "/var @x = 1\n");
    }
}
