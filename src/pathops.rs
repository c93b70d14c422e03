//! Path semantics for `/path`, `/output`, imports, and the content loader
//!
//! Supported anchors: absolute paths, `$HOMEPATH`/`$~`, `$PROJECTPATH`/`$.`,
//! and paths relative to the current file's directory. Dot segments are
//! rejected unless the path is anchored in a path variable; null bytes are
//! always rejected.

use std::path::{Component, Path, PathBuf};

use crate::error::MlldError;

/// Ambient anchors for path resolution
#[derive(Debug, Clone)]
pub struct PathContext {
    pub home: PathBuf,
    pub project_root: PathBuf,
    /// Directory of the file currently being evaluated
    pub current_dir: PathBuf,
    /// True when the path was built from a path-variable base, which makes
    /// `..` segments legal
    pub allow_dot_segments: bool,
}

impl PathContext {
    pub fn new(home: impl Into<PathBuf>, project_root: impl Into<PathBuf>) -> Self {
        let project_root = project_root.into();
        Self {
            home: home.into(),
            current_dir: project_root.clone(),
            project_root,
            allow_dot_segments: false,
        }
    }

    pub fn in_dir(&self, dir: impl Into<PathBuf>) -> Self {
        let mut ctx = self.clone();
        ctx.current_dir = dir.into();
        ctx
    }

    pub fn with_dot_segments(&self) -> Self {
        let mut ctx = self.clone();
        ctx.allow_dot_segments = true;
        ctx
    }
}

/// Resolve a written path to a normalized absolute path
pub fn resolve_path(raw: &str, ctx: &PathContext) -> Result<PathBuf, MlldError> {
    if raw.is_empty() {
        return Err(MlldError::path_validation("empty path", raw));
    }
    if raw.contains('\0') {
        return Err(MlldError::path_validation("path contains a null byte", raw));
    }

    let (anchored, remainder) = if let Some(rest) = strip_anchor(raw, &["$HOMEPATH", "$~"]) {
        (ctx.home.clone(), rest)
    } else if let Some(rest) = strip_anchor(raw, &["$PROJECTPATH", "$."]) {
        (ctx.project_root.clone(), rest)
    } else if Path::new(raw).is_absolute() {
        (PathBuf::new(), raw.to_string())
    } else {
        if !ctx.allow_dot_segments && has_dot_segments(raw) {
            return Err(MlldError::path_validation(
                "dot segments are only allowed under a path-variable base",
                raw,
            ));
        }
        (ctx.current_dir.clone(), raw.to_string())
    };

    let joined = if anchored.as_os_str().is_empty() {
        PathBuf::from(&remainder)
    } else {
        anchored.join(remainder.trim_start_matches('/'))
    };
    Ok(normalize(&joined))
}

fn strip_anchor(raw: &str, anchors: &[&str]) -> Option<String> {
    for anchor in anchors {
        if raw == *anchor {
            return Some(String::new());
        }
        if let Some(rest) = raw.strip_prefix(&format!("{anchor}/")) {
            return Some(rest.to_string());
        }
    }
    None
}

fn has_dot_segments(raw: &str) -> bool {
    Path::new(raw)
        .components()
        .any(|c| matches!(c, Component::CurDir | Component::ParentDir))
}

/// Collapse `.` and `..` without touching the filesystem
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

/// Relative form against `base`, falling back to the path itself
pub fn relative_to(path: &Path, base: &Path) -> String {
    path.strip_prefix(base)
        .unwrap_or(path)
        .display()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> PathContext {
        PathContext::new("/home/user", "/project")
    }

    #[test]
    fn home_and_project_anchors() {
        assert_eq!(
            resolve_path("$HOMEPATH/notes.md", &ctx()).unwrap(),
            PathBuf::from("/home/user/notes.md")
        );
        assert_eq!(
            resolve_path("$./src/a.mld", &ctx()).unwrap(),
            PathBuf::from("/project/src/a.mld")
        );
        assert_eq!(
            resolve_path("$~/x", &ctx()).unwrap(),
            PathBuf::from("/home/user/x")
        );
    }

    #[test]
    fn relative_resolves_against_current_dir() {
        let ctx = ctx().in_dir("/project/docs");
        assert_eq!(
            resolve_path("guide.md", &ctx).unwrap(),
            PathBuf::from("/project/docs/guide.md")
        );
    }

    #[test]
    fn dot_segments_rejected_without_base() {
        let err = resolve_path("../secrets.txt", &ctx()).unwrap_err();
        assert_eq!(err.code(), "PATH_VALIDATION");
        assert!(resolve_path("../ok.txt", &ctx().with_dot_segments()).is_ok());
    }

    #[test]
    fn null_byte_rejected() {
        let err = resolve_path("a\0b", &ctx()).unwrap_err();
        assert!(err.to_string().contains("null byte"));
    }

    #[test]
    fn normalization_collapses_segments() {
        assert_eq!(
            normalize(Path::new("/a/b/../c/./d")),
            PathBuf::from("/a/c/d")
        );
    }
}
