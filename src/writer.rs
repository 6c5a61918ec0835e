use std::collections::BTreeMap;
use std::fs::{self};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use tempfile::NamedTempFile;

use crate::config::AnsibleConfig;
use crate::reducer::{VarFile, VarFiles};
use crate::sheet::ServerInfoSheet;

pub const GROUP_VARS_DIR: &str = "group_vars";
pub const HOST_VARS_DIR: &str = "host_vars";

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Unable to write {path}: {source}")]
    Io { path: String, source: io::Error },

    #[error("Unable to serialize role vars: {0}")]
    Serialize(String),
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> Error + '_ {
    move |source| Error::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Writes through a temporary file in the target directory so readers never
/// see a half written file.
pub fn write_atomic(path: &Path, contents: &str) -> Result<(), Error> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).map_err(io_error(dir))?;

    let mut file = NamedTempFile::new_in(dir).map_err(io_error(dir))?;
    file.write_all(contents.as_bytes()).map_err(io_error(path))?;
    file.persist(path)
        .map_err(|error| error.error)
        .map_err(io_error(path))?;

    return Ok(());
}

pub fn render_var_file(file: &VarFile) -> String {
    file.entries
        .iter()
        .fold(String::from(""), |mut acc, (key, value)| {
            let line = format!("{}: {}", key, value);
            acc.push_str(line.trim_end());
            acc.push('\n');
            return acc;
        })
}

pub fn write_var_file(dir: &Path, file: &VarFile) -> Result<PathBuf, Error> {
    let path = dir.join(format!("{}.yml", file.name));
    write_atomic(&path, &render_var_file(file))?;
    tracing::debug!("Wrote {} entries to {}", file.entries.len(), path.display());

    return Ok(path);
}

/// Global and market files go to `group_vars`, host files to `host_vars`.
pub fn write_var_files(output: &Path, files: &VarFiles) -> Result<Vec<PathBuf>, Error> {
    let group_vars = output.join(GROUP_VARS_DIR);
    let host_vars = output.join(HOST_VARS_DIR);
    fs::create_dir_all(&group_vars).map_err(io_error(&group_vars))?;
    fs::create_dir_all(&host_vars).map_err(io_error(&host_vars))?;

    let mut written = vec![write_var_file(&group_vars, &files.global)?];
    for file in &files.markets {
        written.push(write_var_file(&group_vars, file)?);
    }
    for file in &files.hosts {
        written.push(write_var_file(&host_vars, file)?);
    }

    tracing::info!("Wrote {} variable files under {}", written.len(), output.display());
    return Ok(written);
}

/// Role vars shared by every host, e.g. the packages to install.
pub fn role_vars(sheet: &ServerInfoSheet, fields: &[String]) -> BTreeMap<String, String> {
    let mut vars = BTreeMap::new();

    for field in fields {
        let row = match sheet.row(field) {
            Some(row) => row,
            None => continue,
        };
        let mut values = row.values.iter().flatten();
        let first = match values.next() {
            Some(first) => first,
            None => continue,
        };
        if values.any(|value| value != first) {
            tracing::warn!("Hosts disagree on {}, using {}", field, first);
        }
        vars.insert(field.clone(), first.clone());
    }

    return vars;
}

pub fn write_role_vars(
    dest: &Path,
    roles: &[String],
    vars: &BTreeMap<String, String>,
) -> Result<Vec<PathBuf>, Error> {
    if vars.is_empty() {
        tracing::info!("No role vars found, skipping role vars files");
        return Ok(Vec::new());
    }

    let contents =
        serde_yaml::to_string(vars).map_err(|error| Error::Serialize(error.to_string()))?;
    let mut written = Vec::new();
    for role in roles {
        let path = dest.join("roles").join(role).join("vars").join("main.yml");
        write_atomic(&path, &contents)?;
        written.push(path);
    }

    return Ok(written);
}

/// Copies the default vars file into `group_vars/all` and the `*.j2`
/// templates into the templates role.
pub fn copy_support_files(dest: &Path, config: &AnsibleConfig) -> Result<Vec<PathBuf>, Error> {
    let mut copied = Vec::new();

    if let Some(default_vars) = &config.default_vars_file {
        let all_dir = dest.join(GROUP_VARS_DIR).join("all");
        copied.push(copy_into(default_vars, &all_dir)?);
    }

    if let Some(templates_dir) = &config.templates_dir {
        let role_templates = dest
            .join("roles")
            .join(&config.templates_role)
            .join("templates");
        let entries = fs::read_dir(templates_dir).map_err(io_error(templates_dir))?;
        let mut templates: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .filter(|path| path.is_file() && path.extension().map_or(false, |ext| ext == "j2"))
            .collect();
        templates.sort();

        for template in templates {
            copied.push(copy_into(&template, &role_templates)?);
        }
    }

    return Ok(copied);
}

fn copy_into(source: &Path, dir: &Path) -> Result<PathBuf, Error> {
    fs::create_dir_all(dir).map_err(io_error(dir))?;
    let file_name = source
        .file_name()
        .ok_or_else(|| Error::Io {
            path: source.display().to_string(),
            source: io::Error::new(io::ErrorKind::InvalidInput, "not a file"),
        })?;
    let target = dir.join(file_name);
    fs::copy(source, &target).map_err(io_error(source))?;

    return Ok(target);
}

/// Moves a previous output directory aside, `<archive>/<name>_<timestamp>`.
pub fn archive_output(
    output: &Path,
    archive: &Path,
    now: DateTime<Local>,
) -> Result<Option<PathBuf>, Error> {
    if !output.exists() {
        return Ok(None);
    }

    fs::create_dir_all(archive).map_err(io_error(archive))?;
    let name = output
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| String::from("output"));
    let target = archive.join(format!("{}_{}", name, now.format("%Y%m%d_%H%M%S")));
    fs::rename(output, &target).map_err(io_error(output))?;
    tracing::info!("Archived {} to {}", output.display(), target.display());

    return Ok(Some(target));
}
