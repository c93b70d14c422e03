//! Import evaluation
//!
//! resolve → cycle check → fetch → parse → evaluate in a fresh module
//! environment → extract exports → bind into the importing frame. Imported
//! variables are re-created with `import_path` set so diagnostics point at
//! the import site, and the importing environment is left untouched when
//! anything fails.

use std::path::{Path, PathBuf};

use indexmap::IndexMap;

use crate::ast::{ImportDirective, ImportSelection};
use crate::env::{EnvRef, Environment};
use crate::error::{ImportErrorCode, MlldError, SourceLocation};
use crate::parser;
use crate::pathops;
use crate::resolver::{self, classify, ImportKind};
use crate::value::Value;
use crate::variable::{Variable, VariableKind};

use super::Interpreter;

impl Interpreter {
    pub(crate) fn eval_import_directive(
        &mut self,
        import: &ImportDirective,
        env: &EnvRef,
        location: &SourceLocation,
    ) -> Result<(), MlldError> {
        match classify(&import.source) {
            ImportKind::Resolver(name) => self.bind_resolver_import(import, &name, env, location),
            ImportKind::File(raw) => {
                let ctx = self.path_context(true);
                let path = pathops::resolve_path(&raw, &ctx)?;
                let exports = self.load_module_exports(&path, &import.source, location)?;
                self.bind_exports(import, exports, env, location)
            }
            ImportKind::Module { prefix, name } => {
                let path = self
                    .resolvers
                    .resolve_module(&prefix, &name, self.fs.as_ref())?;
                let exports = self.load_module_exports(&path, &import.source, location)?;
                self.bind_exports(import, exports, env, location)
            }
            ImportKind::Url(url) => {
                if !self.options.allow_urls {
                    return Err(MlldError::security(format!(
                        "URL imports are disabled; cannot import {url}"
                    )));
                }
                resolver::url_allowed(
                    &url,
                    &self.options.url_allowed_domains,
                    &self.options.url_blocked_domains,
                )?;
                let response = self.http.fetch(
                    &url,
                    self.options.url_timeout_ms,
                    self.options.url_max_size,
                )?;
                let path = PathBuf::from(&url);
                let exports =
                    self.evaluate_module(&path, &response.body, &import.source, location)?;
                self.bind_exports(import, exports, env, location)
            }
        }
    }

    /// `@INPUT` / `@TIME`: values, not files. Selected imports read fields
    /// of the value; a bare import binds the lowercased resolver name.
    fn bind_resolver_import(
        &mut self,
        import: &ImportDirective,
        name: &str,
        env: &EnvRef,
        location: &SourceLocation,
    ) -> Result<(), MlldError> {
        let Some(value) = self.resolvers.builtin(name, self.clock.as_ref()) else {
            return Err(MlldError::import(
                ImportErrorCode::ModuleNotFound,
                format!("unknown resolver @{name}"),
                format!("@{name}"),
            ));
        };
        match &import.selection {
            ImportSelection::Selected(bindings) => {
                for binding in bindings {
                    let field = match &value {
                        Value::Object(map) => map.get(&binding.name).cloned(),
                        _ => None,
                    };
                    let Some(field) = field else {
                        return Err(MlldError::import(
                            ImportErrorCode::ExportMissing,
                            format!("@{name} provides no value named {}", binding.name),
                            format!("@{name}"),
                        )
                        .at(location.clone()));
                    };
                    let bound = binding.alias.as_ref().unwrap_or(&binding.name);
                    let variable = Variable::inferred(bound, field)
                        .rehomed(bound, format!("@{name}"));
                    env.borrow_mut().define(variable)?;
                }
                Ok(())
            }
            ImportSelection::Namespace(ns) => {
                let variable = Variable::inferred(ns, value).rehomed(ns, format!("@{name}"));
                env.borrow_mut().define(variable)?;
                Ok(())
            }
            ImportSelection::All => {
                let bound = name.to_lowercase();
                let variable = Variable::inferred(&bound, value)
                    .rehomed(&bound, format!("@{name}"));
                env.borrow_mut().define(variable)?;
                Ok(())
            }
        }
    }

    fn load_module_exports(
        &mut self,
        path: &Path,
        written_source: &str,
        location: &SourceLocation,
    ) -> Result<Vec<Variable>, MlldError> {
        let source = match self.source_cache.get(path) {
            Some(cached) => cached.clone(),
            None => {
                let text = self.fs.read_to_string(path).map_err(|_| {
                    MlldError::import(
                        ImportErrorCode::ModuleNotFound,
                        format!("cannot read {}", path.display()),
                        written_source,
                    )
                    .at(location.clone())
                })?;
                self.source_cache.insert(path.to_path_buf(), text.clone());
                text
            }
        };
        self.evaluate_module(path, &source, written_source, location)
    }

    /// Parse and evaluate a module in its own root environment, returning
    /// its exports
    fn evaluate_module(
        &mut self,
        path: &Path,
        source: &str,
        written_source: &str,
        location: &SourceLocation,
    ) -> Result<Vec<Variable>, MlldError> {
        if self.import_stack.iter().any(|p| p == path) {
            return Err(MlldError::Import {
                code: ImportErrorCode::CircularImport,
                message: format!(
                    "circular import: {}",
                    self.import_stack
                        .iter()
                        .chain(std::iter::once(&path.to_path_buf()))
                        .map(|p| p.display().to_string())
                        .collect::<Vec<_>>()
                        .join(" -> ")
                ),
                path: path.display().to_string(),
                location: Some(location.clone()),
            });
        }

        let executable = resolver::executable_source(path, source);
        let document = parser::parse_document_in(&executable, path.to_str())?;

        let module_env = Environment::new_root();
        self.import_stack.push(path.to_path_buf());
        let saved_file = self.current_file.replace(path.to_path_buf());
        let saved_dir = std::mem::replace(
            &mut self.current_dir,
            path.parent()
                .filter(|d| !d.as_os_str().is_empty())
                .map(Path::to_path_buf)
                .unwrap_or_else(|| self.options.base_path.clone()),
        );
        let saved_manifest = self.export_manifest.take();
        let saved_output = self.take_output();
        // Node ids are per-document; the module gets its own memo space
        let saved_memo = self.take_memo();

        let result = self.eval_document(&document, &module_env);

        // Module /show output never reaches the importing document
        self.restore_output(saved_output);
        self.restore_memo(saved_memo);
        let manifest = std::mem::replace(&mut self.export_manifest, saved_manifest);
        self.current_file = saved_file;
        self.current_dir = saved_dir;
        self.import_stack.pop();
        // Failures re-home to the module whose import failed, so the path in
        // a cycle error names the import the user wrote
        result.map_err(|err| match err {
            MlldError::Import { code, message, .. } => MlldError::Import {
                code,
                message,
                path: path.display().to_string(),
                location: Some(location.clone()),
            },
            other => MlldError::Import {
                code: ImportErrorCode::ModuleNotFound,
                message: format!("error evaluating {}: {other}", path.display()),
                path: path.display().to_string(),
                location: Some(location.clone()),
            },
        })?;

        let all = module_env.borrow().local_variables();
        match manifest {
            Some(manifest) => {
                let mut selected = Vec::new();
                for (name, manifest_location) in manifest {
                    match all.iter().find(|v| v.name == name) {
                        Some(variable) => selected.push(variable.clone()),
                        None => {
                            return Err(MlldError::Import {
                                code: ImportErrorCode::ExportMissing,
                                message: format!(
                                    "export manifest names @{name}, which is not defined"
                                ),
                                path: path.display().to_string(),
                                location: Some(manifest_location),
                            })
                        }
                    }
                }
                Ok(selected)
            }
            None => Ok(all),
        }
    }

    fn bind_exports(
        &mut self,
        import: &ImportDirective,
        exports: Vec<Variable>,
        env: &EnvRef,
        location: &SourceLocation,
    ) -> Result<(), MlldError> {
        match &import.selection {
            ImportSelection::Selected(bindings) => {
                for binding in bindings {
                    let Some(variable) = exports.iter().find(|v| v.name == binding.name) else {
                        return Err(MlldError::Import {
                            code: ImportErrorCode::ExportMissing,
                            message: format!("module does not export @{}", binding.name),
                            path: import.source.clone(),
                            location: Some(location.clone()),
                        });
                    };
                    let bound = binding.alias.as_ref().unwrap_or(&binding.name);
                    env.borrow_mut()
                        .define(variable.rehomed(bound, &import.source))?;
                }
                Ok(())
            }
            ImportSelection::All => {
                for variable in exports {
                    let name = variable.name.clone();
                    env.borrow_mut()
                        .define(variable.rehomed(&name, &import.source))?;
                }
                Ok(())
            }
            ImportSelection::Namespace(ns) => {
                let mut map = IndexMap::new();
                for variable in exports {
                    map.insert(variable.name.clone(), variable.value);
                }
                let mut namespace = Variable::new(
                    VariableKind::Imported,
                    ns,
                    Value::object(map),
                );
                namespace.metadata.is_imported = true;
                namespace.metadata.import_path = Some(import.source.clone());
                namespace.metadata.defined_at = Some(location.clone());
                env.borrow_mut().define(namespace)
            }
        }
    }
}
