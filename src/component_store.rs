//! On-disk storage of components.
//!
//! A component named `web` in workdir `W` is stored as `W/web.tf` plus an
//! optional `W/web.auto.tfvars`. The shared `provider.tf` and `backend.tf`
//! live next to them and are never touched here.

use crate::error::{PreconditionError, StoreError};
use regex::Regex;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

pub const PRIMARY_EXTENSION: &str = "tf";
pub const VARIABLES_SUFFIX: &str = ".auto.tfvars";
pub const PLAN_SUFFIX: &str = ".tfplan";
/// Directory terraform creates on `init`; its presence marks an initialized project.
pub const TERRAFORM_METADATA_DIR: &str = ".terraform";
/// Fixed infrastructure files that are not components.
pub const RESERVED_FILES: [&str; 2] = ["provider.tf", "backend.tf"];

static COMPONENT_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("static regex"));

pub fn validate_component_name(name: &str) -> Result<(), PreconditionError> {
    let reserved = RESERVED_FILES
        .iter()
        .any(|file| file.strip_suffix(".tf") == Some(name));
    if COMPONENT_NAME.is_match(name) && !reserved {
        Ok(())
    } else {
        Err(PreconditionError::InvalidName(name.to_string()))
    }
}

/// A named unit of generated infrastructure code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Component {
    pub name: String,
    pub code: String,
    pub variables: String,
}

impl Component {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            code: String::new(),
            variables: String::new(),
        }
    }

    pub fn with_code(mut self, code: impl Into<String>, variables: impl Into<String>) -> Self {
        self.code = code.into();
        self.variables = variables.into();
        self
    }

    pub fn primary_file_name(&self) -> String {
        format!("{}.{}", self.name, PRIMARY_EXTENSION)
    }

    pub fn variables_file_name(&self) -> String {
        format!("{}{}", self.name, VARIABLES_SUFFIX)
    }

    pub fn plan_file_name(&self) -> String {
        format!("{}{}", self.name, PLAN_SUFFIX)
    }
}

/// Sole writer and deleter of component files in one workdir.
#[derive(Debug, Clone)]
pub struct ComponentStore {
    workdir: PathBuf,
}

impl ComponentStore {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    pub fn primary_path(&self, component: &Component) -> PathBuf {
        self.workdir.join(component.primary_file_name())
    }

    pub fn variables_path(&self, component: &Component) -> PathBuf {
        self.workdir.join(component.variables_file_name())
    }

    pub fn plan_path(&self, component: &Component) -> PathBuf {
        self.workdir.join(component.plan_file_name())
    }

    pub fn exists(&self, component: &Component) -> bool {
        self.primary_path(component).is_file()
    }

    pub fn ensure_project_initialized(&self) -> bool {
        self.workdir.join(TERRAFORM_METADATA_DIR).is_dir()
    }

    /// Writes the component's files.
    ///
    /// Each file is written to a temporary sibling and renamed into place, so
    /// readers see either the old or the new content. An empty variables text
    /// removes any variables file left over from an earlier version.
    pub fn save(&self, component: &Component, overwrite: bool) -> Result<(), StoreError> {
        let primary = self.primary_path(component);
        if !overwrite && primary.exists() {
            return Err(StoreError::AlreadyExists(primary));
        }

        self.write_atomic(&primary, &component.code)?;

        let variables = self.variables_path(component);
        if component.variables.trim().is_empty() {
            if variables.exists() {
                fs::remove_file(&variables).map_err(|source| StoreError::Io {
                    path: variables.clone(),
                    source,
                })?;
            }
        } else {
            self.write_atomic(&variables, &component.variables)?;
        }

        info!("Saved component '{}' to {}", component.name, primary.display());
        Ok(())
    }

    fn write_atomic(&self, path: &Path, content: &str) -> Result<(), StoreError> {
        let io_err = |source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        };

        let mut temp = NamedTempFile::new_in(&self.workdir).map_err(io_err)?;
        temp.write_all(content.as_bytes()).map_err(io_err)?;
        temp.as_file().sync_all().map_err(io_err)?;
        temp.persist(path).map_err(|e| io_err(e.error))?;
        Ok(())
    }

    /// Best-effort removal of every file belonging to the component.
    ///
    /// Runs on failure paths, so problems are logged and swallowed.
    pub fn cleanup(&self, component: &Component) {
        for path in self.owned_paths(component) {
            match fs::remove_file(&path) {
                Ok(()) => debug!("Removed {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove {} during cleanup: {}", path.display(), e),
            }
        }
        info!("Cleaned up component '{}'", component.name);
    }

    /// Removes the component's files, reporting the first failure.
    pub fn delete(&self, component: &Component) -> std::io::Result<()> {
        for path in self.owned_paths(component) {
            match fs::remove_file(&path) {
                Ok(()) => info!("Deleted {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn owned_paths(&self, component: &Component) -> [PathBuf; 3] {
        [
            self.primary_path(component),
            self.variables_path(component),
            self.plan_path(component),
        ]
    }

    /// Reads a stored component back.
    pub fn load(&self, name: &str) -> std::io::Result<Component> {
        let component = Component::new(name);
        let code = fs::read_to_string(self.primary_path(&component))?;
        let variables = fs::read_to_string(self.variables_path(&component)).unwrap_or_default();
        Ok(component.with_code(code, variables))
    }

    /// Names of all components in the workdir, sorted.
    pub fn list_components(&self) -> std::io::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.workdir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            if RESERVED_FILES.contains(&file_name) {
                continue;
            }
            if let Some(name) = file_name.strip_suffix(".tf") {
                if validate_component_name(name).is_ok() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}
