//! Xshell session files pointing at the control host of a stack.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use crate::ini::Ini;
use crate::writer::write_atomic;

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum Error {
    #[error("Session template {0} not found")]
    FileNotFound(String),

    #[error("Unable to write session {path}: {message}")]
    Write { path: String, message: String },

    #[error("Unknown error occurred: {0}")]
    Unknown(String),
}

pub fn session_path(dir: &Path, stack_name: &str) -> PathBuf {
    dir.join(format!("{}.xsh", stack_name))
}

pub fn render_session(template: &str, host: &str) -> String {
    let mut session = Ini::parse(template);
    session.section_mut("CONNECTION").set("Host", host);
    return session.render();
}

pub fn write_session(
    template: &Path,
    dir: &Path,
    stack_name: &str,
    host: &str,
) -> Result<PathBuf, Error> {
    let contents = match fs::read_to_string(template) {
        Ok(raw_contents) => Ok(raw_contents),
        Err(error) => match error.kind() {
            io::ErrorKind::NotFound => Err(Error::FileNotFound(template.display().to_string())),
            _ => Err(Error::Unknown(error.to_string())),
        },
    }?;

    let path = session_path(dir, stack_name);
    write_atomic(&path, &render_session(&contents, host)).map_err(|error| Error::Write {
        path: path.display().to_string(),
        message: error.to_string(),
    })?;
    tracing::info!("Session for {} written to {}", stack_name, path.display());

    return Ok(path);
}

/// Returns whether a session file was there to remove.
pub fn remove_session(dir: &Path, stack_name: &str) -> Result<bool, Error> {
    let path = session_path(dir, stack_name);
    match fs::remove_file(&path) {
        Ok(_) => Ok(true),
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(error) => Err(Error::Unknown(error.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::{remove_session, render_session, write_session, Error};
    use pretty_assertions::assert_eq;
    use std::fs;
    use tempfile::tempdir;

    const TEMPLATE: &str = "\
[SessionInfo]
Version=5.0

[CONNECTION]
Port=22
Host=
Protocol=SSH
";

    #[test]
    fn sets_connection_host() {
        assert_eq!(
            "[SessionInfo]\nVersion=5.0\n\n[CONNECTION]\nPort=22\nHost=13.54.1.2\nProtocol=SSH\n\n",
            render_session(TEMPLATE, "13.54.1.2")
        );
    }

    #[test]
    fn writes_and_removes_session() {
        let dir = tempdir().unwrap();
        let template = dir.path().join("template.xsh");
        fs::write(&template, TEMPLATE).unwrap();

        let path =
            write_session(&template, dir.path(), "cfn-test-20190322103005", "13.54.1.2").unwrap();

        assert_eq!(dir.path().join("cfn-test-20190322103005.xsh"), path);
        assert_eq!(true, fs::read_to_string(&path).unwrap().contains("Host=13.54.1.2\n"));
        assert_eq!(Ok(true), remove_session(dir.path(), "cfn-test-20190322103005"));
        assert_eq!(Ok(false), remove_session(dir.path(), "cfn-test-20190322103005"));
    }

    #[test]
    fn template_does_not_exist() {
        let dir = tempdir().unwrap();
        let template = dir.path().join("template.xsh");
        let result = write_session(&template, dir.path(), "stack", "1.1.1.1");

        assert_eq!(true, result.is_err());
        match result.err().unwrap() {
            Error::FileNotFound(_) => {}
            _ => panic!("Expected `FileNotFound` error"),
        }
    }
}
