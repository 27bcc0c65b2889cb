use serde::{Deserialize, Serialize};

/// A folder on one server. The empty path is the synthetic root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderNode {
    pub path: String,
    /// Last component of `path`.
    pub name: String,
    pub separator: char,
    /// LIST reported `\Noselect`: the folder only holds other folders.
    pub no_select: bool,
}

impl FolderNode {
    pub fn root(separator: char) -> Self {
        Self {
            path: String::new(),
            name: String::new(),
            separator,
            no_select: true,
        }
    }

    pub fn new(path: &str, separator: char, no_select: bool) -> Self {
        let name = path.rsplit(separator).next().unwrap_or(path).to_string();
        Self {
            path: path.to_string(),
            name,
            separator,
            no_select,
        }
    }

    pub fn is_root(&self) -> bool {
        self.path.trim().is_empty()
    }

    pub fn child_path(&self, name: &str) -> String {
        if self.is_root() {
            name.to_string()
        } else {
            format!("{}{}{}", self.path, self.separator, name)
        }
    }
}

/// Renames a folder with the given leaf name, or drops it (`target: null`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderRule {
    pub name: String,
    pub target: Option<String>,
}

const DEFAULT_RULES: &[(&str, Option<&str>)] = &[
    ("Sent", Some("Sent Items")),
    ("Trash", Some("Deleted Items")),
    ("Shared Folders", None),
];

/// Source-to-destination folder name policy. Names match case-insensitively.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderMap {
    rules: Vec<FolderRule>,
}

impl Default for FolderMap {
    fn default() -> Self {
        Self {
            rules: DEFAULT_RULES
                .iter()
                .map(|(name, target)| FolderRule {
                    name: name.to_string(),
                    target: target.map(str::to_string),
                })
                .collect(),
        }
    }
}

impl FolderMap {
    pub fn new(rules: Vec<FolderRule>) -> Self {
        Self { rules }
    }

    /// `None` means: do not mirror this folder, but still recurse into its
    /// children. Targets use `/` for hierarchy, rewritten to `separator`.
    pub fn map_name(&self, name: &str, separator: char) -> Option<String> {
        match self.rules.iter().find(|r| r.name.eq_ignore_ascii_case(name)) {
            Some(rule) => rule
                .target
                .as_ref()
                .map(|target| target.replace('/', &separator.to_string())),
            None => Some(name.to_string()),
        }
    }
}

pub fn map_folder_name(name: &str, separator: char) -> Option<String> {
    FolderMap::default().map_name(name, separator)
}
