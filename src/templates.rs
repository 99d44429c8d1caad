//! Starter programs offered to the editor.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;
use tracing::{debug, info};

use crate::toolchain::Language;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Template {
    pub language: Language,
    pub name: String,
    pub code: String,
}

#[derive(Debug, Clone, Default)]
pub struct TemplateCatalog {
    templates: Vec<Template>,
}

impl TemplateCatalog {
    /// Load `<dir>/<language>/<name>.<ext>` for every supported language.
    /// A missing language directory contributes nothing.
    pub fn load(dir: &Path) -> io::Result<Self> {
        let mut templates = Vec::new();
        for language in Language::all() {
            let language_dir = dir.join(language.extension());
            let entries = match fs::read_dir(&language_dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    debug!(path = %language_dir.display(), "No templates for language");
                    continue;
                }
                Err(e) => return Err(e),
            };
            for entry in entries {
                let path = entry?.path();
                if path.extension().and_then(|e| e.to_str()) != Some(language.extension()) {
                    continue;
                }
                let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                    continue;
                };
                templates.push(Template {
                    language,
                    name: name.to_string(),
                    code: fs::read_to_string(&path)?,
                });
            }
        }
        templates.sort_by(|a, b| {
            (a.language.extension(), &a.name).cmp(&(b.language.extension(), &b.name))
        });
        info!(count = templates.len(), dir = %dir.display(), "Loaded templates");
        Ok(Self { templates })
    }

    /// Template names grouped by language.
    pub fn names(&self) -> BTreeMap<String, Vec<String>> {
        let mut names: BTreeMap<String, Vec<String>> = Language::all()
            .into_iter()
            .map(|l| (l.to_string(), Vec::new()))
            .collect();
        for template in &self.templates {
            names
                .entry(template.language.to_string())
                .or_default()
                .push(template.name.clone());
        }
        names
    }

    pub fn get(&self, language: Language, name: &str) -> Option<&Template> {
        self.templates
            .iter()
            .find(|t| t.language == language && t.name == name)
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}
