//! Scaffolding for a fresh `.shipyard/` store.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::info;

use crate::io::atomic::write_atomic;
use crate::io::config::{Config, write_config};
use crate::io::paths::{PROMPT_NAMES, StorePaths};
use crate::io::prompt::default_template;
use crate::io::store::Store;

const STORE_GITIGNORE: &str = "logs/\nbackups/\n*.lock\nbatch-progress.json\n";

#[derive(Debug, Clone, Copy, Default)]
pub struct InitOptions {
    /// Overwrite store-owned scaffolding (config, prompts). Items are never touched.
    pub force: bool,
}

/// Create `.shipyard/` scaffolding under the store's repository root.
///
/// Fails if a config already exists unless `options.force` is set.
pub fn init_store(store: &Store, config: &Config, options: InitOptions) -> Result<Vec<PathBuf>> {
    let paths = store.paths();
    let store_dir = paths.store_dir();
    if store_dir.exists() && !store_dir.is_dir() {
        return Err(anyhow!(
            "init: {} exists but is not a directory",
            store_dir.display()
        ));
    }
    if paths.config().exists() && !options.force {
        return Err(anyhow!(
            "init: {} already exists (use --force to overwrite)",
            paths.config().display()
        ));
    }

    create_dir(store_dir)?;
    create_dir(&paths.items_dir())?;
    create_dir(&paths.prompts_dir())?;

    let mut written = Vec::new();
    write_config(&paths.config(), config)?;
    written.push(paths.config());
    write_atomic(&store_dir.join(".gitignore"), STORE_GITIGNORE.as_bytes())?;
    written.push(store_dir.join(".gitignore"));
    written.extend(write_default_prompts(paths, options.force)?);

    store.rebuild_index().context("init: build index")?;
    written.push(paths.index());
    info!(root = %paths.repo_root().display(), files = written.len(), "store initialized");
    Ok(written)
}

/// Write built-in templates into the override directory.
///
/// Existing files are kept unless `overwrite` is set. Returns the files written.
pub fn write_default_prompts(paths: &StorePaths, overwrite: bool) -> Result<Vec<PathBuf>> {
    let mut written = Vec::new();
    for name in PROMPT_NAMES {
        let path = paths.prompt_override(name);
        if path.exists() && !overwrite {
            continue;
        }
        let source =
            default_template(name).ok_or_else(|| anyhow!("no built-in template '{name}'"))?;
        write_atomic(&path, source.as_bytes())?;
        written.push(path);
    }
    Ok(written)
}

fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("create directory {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::config::load_config;
    use crate::io::lock::LockSettings;

    fn store(root: &Path) -> Store {
        Store::new(StorePaths::new(root), LockSettings::default())
    }

    #[test]
    fn init_writes_scaffolding() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        init_store(&store, &Config::default(), InitOptions::default()).expect("init");

        let paths = store.paths();
        assert_eq!(load_config(&paths.config()).expect("config"), Config::default());
        for name in PROMPT_NAMES {
            assert!(paths.prompt_override(name).is_file(), "{name} missing");
        }
        assert!(paths.items_dir().is_dir());
        assert!(store.read_index().expect("index").items.is_empty());
    }

    #[test]
    fn second_init_requires_force() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        init_store(&store, &Config::default(), InitOptions::default()).expect("init");
        let err = init_store(&store, &Config::default(), InitOptions::default())
            .expect_err("should refuse");
        assert!(err.to_string().contains("--force"));

        fs::write(store.paths().prompt_override("plan"), "edited").expect("edit");
        write_default_prompts(store.paths(), false).expect("keep edits");
        assert_eq!(
            fs::read_to_string(store.paths().prompt_override("plan")).expect("read"),
            "edited"
        );
        init_store(&store, &Config::default(), InitOptions { force: true }).expect("force");
        assert_ne!(
            fs::read_to_string(store.paths().prompt_override("plan")).expect("read"),
            "edited"
        );
    }
}
