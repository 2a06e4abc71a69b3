use std::path::{Path, PathBuf};

use tokio::fs;

use crate::{runtime::RegistryValue, DeckcoreResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The key holding the Windows version, relative to `HKEY_LOCAL_MACHINE`.
pub const WINDOWS_VERSION_KEY: &str = r"Software\Microsoft\Windows NT\CurrentVersion";

/// The machine hive file, relative to the container root.
pub const MACHINE_HIVE: &str = "system.reg";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A registry hive file loaded as text for direct editing.
///
/// Only values of existing keys can be set. Keys are never created because the compatibility
/// layer stores metadata next to each key header that is not reproduced here.
#[derive(Debug, Clone)]
pub struct RegistryHive {
    path: PathBuf,
    lines: Vec<String>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl RegistryHive {
    /// Reads a hive file.
    pub async fn load(path: impl Into<PathBuf>) -> DeckcoreResult<Self> {
        let path = path.into();
        let contents = fs::read_to_string(&path).await?;
        Ok(Self::parse(path, &contents))
    }

    /// Wraps already loaded hive text.
    pub fn parse(path: impl Into<PathBuf>, contents: &str) -> Self {
        Self {
            path: path.into(),
            lines: contents.lines().map(str::to_string).collect(),
        }
    }

    /// The file this hive was loaded from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the hive contains `key`.
    pub fn has_key(&self, key: &str) -> bool {
        self.find_key(key).is_some()
    }

    /// Sets `values` under `key`, replacing existing values with the same names.
    ///
    /// Returns `false` without changing anything if the key is not in the hive.
    pub fn set_values(&mut self, key: &str, values: &[(&str, RegistryValue)]) -> bool {
        let Some(header) = self.find_key(key) else {
            return false;
        };

        for (name, value) in values {
            let line = format_value(name, value);
            let end = self.key_end(header);
            match self.find_value(header, end, name) {
                Some((start, stop)) => {
                    self.lines.drain(start + 1..stop);
                    self.lines[start] = line;
                }
                None => self.lines.insert(end, line),
            }
        }

        true
    }

    /// The hive as text.
    pub fn to_text(&self) -> String {
        let mut text = self.lines.join("\n");
        text.push('\n');
        text
    }

    /// Writes the hive back to the file it was loaded from.
    pub async fn save(&self) -> DeckcoreResult<()> {
        fs::write(&self.path, self.to_text()).await?;
        Ok(())
    }

    fn find_key(&self, key: &str) -> Option<usize> {
        let header = format!("[{}]", escape(key)).to_ascii_lowercase();
        self.lines
            .iter()
            .position(|line| line.to_ascii_lowercase().starts_with(&header))
    }

    /// The index one past the last value line of the key whose header is at `header`.
    fn key_end(&self, header: usize) -> usize {
        let mut end = header + 1;
        while end < self.lines.len() {
            let line = self.lines[end].trim();
            if line.is_empty() || line.starts_with('[') {
                break;
            }
            end += 1;
        }
        end
    }

    /// The line range of a value, including continuation lines of multi-line values.
    fn find_value(&self, header: usize, end: usize, name: &str) -> Option<(usize, usize)> {
        let prefix = format!("\"{}\"=", escape(name)).to_ascii_lowercase();
        let start = (header + 1..end)
            .find(|&i| self.lines[i].to_ascii_lowercase().starts_with(&prefix))?;

        let mut stop = start + 1;
        while stop < end && self.lines[stop - 1].ends_with('\\') {
            stop += 1;
        }

        Some((start, stop))
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// The values that make guest programs see Windows 10.
pub fn windows10_values() -> Vec<(&'static str, RegistryValue)> {
    vec![
        ("CurrentVersion", RegistryValue::String("6.3".to_string())),
        ("CurrentBuild", RegistryValue::String("19045".to_string())),
        ("CurrentBuildNumber", RegistryValue::String("19045".to_string())),
        ("CSDVersion", RegistryValue::String(String::new())),
        ("ProductName", RegistryValue::String("Windows 10 Pro".to_string())),
        ("CurrentMajorVersionNumber", RegistryValue::Dword(10)),
        ("CurrentMinorVersionNumber", RegistryValue::Dword(0)),
    ]
}

fn escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

fn format_value(name: &str, value: &RegistryValue) -> String {
    match value {
        RegistryValue::String(s) => format!("\"{}\"=\"{}\"", escape(name), escape(s)),
        RegistryValue::Dword(d) => format!("\"{}\"=dword:{d:08x}", escape(name)),
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
