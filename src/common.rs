use handlebars::{handlebars_helper, Handlebars};
use serde_json::Value;
use tracing::{debug, info};

use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result};

/// Databases the engine refuses to modify or drop.
pub const PROTECTED_DATABASES: [&str; 3] = ["postgres", "template0", "template1"];

pub fn create_path_if_not_exists(path: &str) -> anyhow::Result<()> {
    //
    // remove the file name from the path

    let path = Path::new(path)
        .parent()
        .ok_or_else(|| anyhow::anyhow!("Invalid path: no parent directory for '{}'", path))?;
    if !path.exists() {
        info!("Creating path: {:?}", path);
        std::fs::create_dir_all(path)?;
    }
    Ok(())
}

pub fn write_string_to_file(filename: &str, content: &str) -> anyhow::Result<()> {
    create_path_if_not_exists(filename)?;
    let path = Path::new(filename);
    let mut file = File::create(path)?;
    file.write_all(content.as_bytes())?;
    Ok(())
}

/// Cooperative cancellation flag checked between discrete steps. Never
/// interrupts a statement that is already running.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Copies every file and subdirectory under `src` into `dest`, returning the
/// number of files copied. Existing files in `dest` are overwritten. The
/// token is checked per directory entry.
pub fn copy_dir_recursive(src: &Path, dest: &Path, cancel: &CancelToken) -> Result<usize> {
    if !dest.exists() {
        std::fs::create_dir_all(dest)?;
    }

    let mut copied = 0;
    for entry in std::fs::read_dir(src)? {
        cancel.check()?;
        let entry = entry?;
        let target = dest.join(entry.file_name());

        if entry.file_type()?.is_dir() {
            copied += copy_dir_recursive(&entry.path(), &target, cancel)?;
        } else {
            debug!("Copying file: {:?}", entry.path());
            std::fs::copy(entry.path(), &target)?;
            copied += 1;
        }
    }
    Ok(copied)
}

/// Validates a database or template name against the engine's identifier
/// rules: letters, digits and underscores, not starting with a digit, at
/// most 63 bytes.
pub fn validate_database_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidName("name is empty".to_string()));
    }
    if name.len() > 63 {
        return Err(Error::InvalidName(format!(
            "'{}' is longer than 63 bytes",
            name
        )));
    }

    let mut chars = name.chars();
    let first = chars.next().unwrap_or('_');
    if !(first.is_ascii_alphabetic() || first == '_') {
        return Err(Error::InvalidName(format!(
            "'{}' must start with a letter or underscore",
            name
        )));
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(Error::InvalidName(format!(
            "'{}' may only contain letters, digits and underscores",
            name
        )));
    }
    Ok(())
}

pub fn is_protected_database(name: &str) -> bool {
    PROTECTED_DATABASES.contains(&name)
}

/// Container layer names: spaces and slashes become underscores.
pub fn sanitize_layer_name(name: &str) -> String {
    name.replace(' ', "_").replace('/', "_")
}

pub fn format_size(bytes: i64) -> String {
    const UNITS: [&str; 5] = ["B", "kB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value.abs() >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[unit])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

pub fn get_handlebars() -> Handlebars<'static> {
    let mut handlebars = Handlebars::new();

    handlebars_helper!(exists: |v: Value| {
        !v.is_null() &&
        match v {
            serde_json::Value::String(s) => {
                !s.is_empty() && s != "null"
            }
            _ => true,
        }
    });
    handlebars.register_helper("exists", Box::new(exists));

    handlebars_helper!(is_empty: |v: Value| {
        match v {
            serde_json::Value::Array(arr) => arr.is_empty(),
            _ => false, // Return false if not an array
        }
    });
    handlebars.register_helper("is_empty", Box::new(is_empty));

    handlebars
}
