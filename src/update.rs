//! Pending image configuration edits.
//!
//! Each field of [`ConfigUpdate`] is `None` unless the caller explicitly
//! supplied it; only supplied fields touch the record.

use std::collections::BTreeMap;

use tracing::warn;

use crate::builder::Builder;
use crate::error::BuilderError;

/// A set of edits to a build container's pending image configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigUpdate {
    /// Replaces the maintainer.
    pub author: Option<String>,
    pub created_by: Option<String>,
    pub arch: Option<String>,
    pub os: Option<String>,
    pub user: Option<String>,
    pub workingdir: Option<String>,
    /// Each entry is added to the exposed port set.
    pub ports: Option<Vec<String>>,
    /// Appended to the environment as given.
    pub env: Option<Vec<String>>,
    /// Tokenized with shell quoting rules; replaces the entrypoint.
    pub entrypoint: Option<String>,
    /// Tokenized with shell quoting rules; replaces the command.
    pub cmd: Option<String>,
    /// Appended to the volume list.
    pub volumes: Option<Vec<String>>,
    /// `KEY=VALUE` sets a label, a bare `KEY` removes it.
    pub labels: Option<Vec<String>>,
    /// `KEY=VALUE` sets an annotation, a bare `KEY` removes it.
    pub annotations: Option<Vec<String>>,
}

impl ConfigUpdate {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Apply the edits to `builder` in memory.
    ///
    /// Tokenizing failures for `entrypoint` or `cmd` are logged and returned;
    /// the affected field keeps its previous value and every other edit still
    /// applies. Nothing is saved.
    pub fn apply(&self, builder: &mut Builder) -> Vec<BuilderError> {
        let mut warnings = Vec::new();

        if let Some(author) = &self.author {
            builder.maintainer = author.clone();
        }
        if let Some(created_by) = &self.created_by {
            builder.created_by = created_by.clone();
        }
        if let Some(arch) = &self.arch {
            builder.architecture = arch.clone();
        }
        if let Some(os) = &self.os {
            builder.os = os.clone();
        }
        if let Some(user) = &self.user {
            builder.user = user.clone();
        }
        if let Some(ports) = &self.ports {
            builder.expose.extend(ports.iter().cloned());
        }
        if let Some(env) = &self.env {
            builder.env.extend(env.iter().cloned());
        }
        if let Some(entrypoint) = &self.entrypoint {
            match tokenize("entrypoint", entrypoint) {
                Ok(words) => builder.entrypoint = words,
                Err(e) => warnings.push(e),
            }
        }
        if let Some(cmd) = &self.cmd {
            match tokenize("cmd", cmd) {
                Ok(words) => builder.cmd = words,
                Err(e) => warnings.push(e),
            }
        }
        if let Some(volumes) = &self.volumes {
            builder.volumes.extend(volumes.iter().cloned());
        }
        if let Some(labels) = &self.labels {
            apply_key_values(&mut builder.labels, labels);
        }
        if let Some(workingdir) = &self.workingdir {
            builder.workdir = workingdir.clone();
        }
        if let Some(annotations) = &self.annotations {
            apply_key_values(&mut builder.annotations, annotations);
        }

        for w in &warnings {
            warn!("{w}");
        }
        warnings
    }
}

/// Split each spec on its first `=`; with no `=` the key is removed.
fn apply_key_values(map: &mut BTreeMap<String, String>, specs: &[String]) {
    for spec in specs {
        match spec.split_once('=') {
            Some((key, value)) => {
                map.insert(key.to_string(), value.to_string());
            }
            None => {
                map.remove(spec);
            }
        }
    }
}

fn tokenize(field: &'static str, value: &str) -> Result<Vec<String>, BuilderError> {
    shell_words::split(value).map_err(|e| BuilderError::Tokenize {
        field,
        value: value.to_string(),
        message: e.to_string(),
    })
}
