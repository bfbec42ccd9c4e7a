//! Loading variable bindings from an XML configuration file.
//!
//! The file holds any number of named sections, each a list of parameters:
//!
//! ```xml
//! <netvar>
//!     <section name="frontend">
//!         <param name="temp" type="float64" access="R" netvar="\\${HOST}\lib\temp"/>
//!         <param name="ts" type="timestamp" access="R" netvar="\\${HOST}\lib\rec" field="0"/>
//!         <param name="volts" type="float64" access="R" netvar="\\${HOST}\lib\rec"
//!                field="1" ts_param="ts"/>
//!     </section>
//! </netvar>
//! ```
//!
//! Both the file path and every `netvar` path are macro-expanded against a snapshot of
//! the environment (see [`MacroEnvironment`]).

mod macros;
mod xml;

pub use macros::MacroEnvironment;

use crate::binding::{AccessMode, DeclaredType, Registry, VariableBinding};
use std::{
    collections::HashSet,
    fs, io,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use xml::Element;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cannot read config file '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Cannot parse config file '{path}' at line {line} column {column}: {reason}")]
    Parse {
        path: PathBuf,
        line: usize,
        column: usize,
        reason: String,
    },
    #[error("Config file '{path}' root element is <{found}>, expected <netvar>")]
    Root { path: PathBuf, found: String },
}

/// A `<param>` entry as written in the file, with `netvar` expanded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamEntry {
    pub name: String,
    pub declared_type: String,
    pub access: String,
    pub netvar: String,
    pub field: Option<String>,
    pub ts_param: Option<String>,
}

/// A parsed configuration file
#[derive(Debug, Clone)]
pub struct NetVarConfig {
    path: PathBuf,
    root: Element,
    env: MacroEnvironment,
}

impl NetVarConfig {
    /// Load `config_file`, expanding macros against the current environment
    pub fn load(config_file: &str) -> Result<Self, ConfigError> {
        Self::load_with_env(config_file, MacroEnvironment::snapshot())
    }

    pub fn load_with_env(config_file: &str, env: MacroEnvironment) -> Result<Self, ConfigError> {
        let path = PathBuf::from(env.expand(config_file));
        if path.as_os_str() != config_file {
            info!("Expanded config file '{config_file}' to '{}'", path.display());
        }
        let document = fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        Self::from_document(&document, path, env)
    }

    /// Parse an in-memory document, using `path` only for reporting
    pub fn from_document(
        document: &str,
        path: impl Into<PathBuf>,
        env: MacroEnvironment,
    ) -> Result<Self, ConfigError> {
        let path = path.into();
        let root = xml::parse_document(document).map_err(|e| ConfigError::Parse {
            path: path.clone(),
            line: e.line,
            column: e.column,
            reason: e.reason,
        })?;
        if root.name != "netvar" {
            return Err(ConfigError::Root {
                path,
                found: root.name,
            });
        }
        debug!("Loaded config file '{}'", path.display());
        Ok(NetVarConfig { path, root, env })
    }

    /// The config file path after macro expansion
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn param_elements<'a>(&'a self, section: &'a str) -> impl Iterator<Item = &'a Element> {
        self.root
            .children_named("section")
            .filter(move |s| s.attribute("name") == Some(section))
            .flat_map(|s| s.children_named("param"))
    }

    /// Number of parameters declared in `section`
    pub fn count_params(&self, section: &str) -> usize {
        let n = self.param_elements(section).count();
        if n == 0 {
            error!(
                "No parameters found in section '{section}' of '{}'",
                self.path.display()
            );
        }
        n
    }

    /// Every `<param>` in `section`, in document order
    pub fn params(&self, section: &str) -> Vec<ParamEntry> {
        self.param_elements(section)
            .map(|p| {
                let attr = |key| p.attribute(key).unwrap_or("").to_string();
                let optional = |key| {
                    p.attribute(key)
                        .filter(|v| !v.is_empty())
                        .map(str::to_string)
                };
                ParamEntry {
                    name: attr("name"),
                    declared_type: attr("type"),
                    access: attr("access"),
                    netvar: self.env.expand(&attr("netvar")),
                    field: optional("field"),
                    ts_param: optional("ts_param"),
                }
            })
            .collect()
    }

    /// Build the variable bindings declared in `section`
    pub fn bindings(&self, section: &str) -> Registry {
        let entries = self.params(section);
        let names: HashSet<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        let mut registry = Registry::new();
        for entry in &entries {
            if entry.name.is_empty() {
                warn!("Ignoring param with no name in section '{section}'");
                continue;
            }
            let field = match entry.field.as_deref().map(str::parse::<usize>) {
                None => None,
                Some(Ok(i)) => Some(i),
                Some(Err(e)) => {
                    warn!(
                        "Param '{}' has invalid field '{}' ({e}), treating as whole variable",
                        entry.name,
                        entry.field.as_deref().unwrap_or_default()
                    );
                    None
                }
            };
            let ts_param = match &entry.ts_param {
                Some(ts) if names.contains(ts.as_str()) && ts != &entry.name => Some(ts.clone()),
                Some(ts) => {
                    warn!(
                        "Param '{}' refers to unknown timestamp param '{ts}', ignoring",
                        entry.name
                    );
                    None
                }
                None => None,
            };
            let binding = VariableBinding::new(
                &entry.name,
                &entry.netvar,
                entry.declared_type.parse::<DeclaredType>().unwrap_or_else(|e| match e {}),
                AccessMode::parse(&entry.access, &entry.name),
                field,
                ts_param,
            );
            info!(
                "Param '{}' type={} access={} netvar='{}' field={:?} ts_param={:?}",
                binding.name(),
                binding.declared_type(),
                binding.access(),
                binding.path(),
                binding.field(),
                binding.ts_param()
            );
            if registry.insert(binding).is_some() {
                warn!("Param '{}' declared twice, using the last", entry.name);
            }
        }
        registry
    }
}
