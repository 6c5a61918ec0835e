//! Host and group variable templates, flat `key: value` YAML files listing
//! every variable the playbooks expect.

use indexmap::IndexMap;
use std::{fs, io, path::Path, path::PathBuf};

use crate::sheet::{FieldRow, ServerInfoSheet};

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum Error {
    #[error("Template {0} not found")]
    FileNotFound(String),

    #[error("Unknown error occurred: {0}")]
    Unknown(String),
}

#[derive(Debug, Default, PartialEq)]
pub struct TemplateVars {
    /// Every template variable, including those without a value.
    pub all: IndexMap<String, String>,
    pub with_values: IndexMap<String, String>,
}

pub fn parse_var_template(text: &str) -> IndexMap<String, String> {
    text.lines()
        .filter(|line| !line.starts_with('#'))
        .filter_map(|line| line.split_once(':'))
        .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
        .collect()
}

pub fn read_var_template(path: &Path) -> Result<IndexMap<String, String>, Error> {
    let contents = match fs::read_to_string(path) {
        Ok(raw_contents) => Ok(raw_contents),
        Err(error) => match error.kind() {
            io::ErrorKind::NotFound => Err(Error::FileNotFound(path.display().to_string())),
            _ => Err(Error::Unknown(error.to_string())),
        },
    }?;

    return Ok(parse_var_template(&contents));
}

/// Earlier templates win when several define the same key.
pub fn merge_templates(templates: &[IndexMap<String, String>]) -> TemplateVars {
    let mut all: IndexMap<String, String> = IndexMap::new();
    for template in templates {
        for (key, value) in template {
            if !all.contains_key(key) {
                all.insert(key.clone(), value.clone());
            }
        }
    }

    let with_values = all
        .iter()
        .filter(|(_, value)| !value.is_empty())
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();

    return TemplateVars { all, with_values };
}

/// Reads the host template, when present, followed by the group templates.
pub fn load_templates(
    host_template: &Path,
    group_templates: &[PathBuf],
) -> Result<TemplateVars, Error> {
    let mut templates = Vec::new();
    match read_var_template(host_template) {
        Ok(template) => templates.push(template),
        Err(Error::FileNotFound(path)) => {
            tracing::warn!("Host template {} not found, skipping it", path)
        }
        Err(error) => return Err(error),
    }
    for group_template in group_templates {
        templates.push(read_var_template(group_template)?);
    }

    let vars = merge_templates(&templates);
    tracing::debug!("Template vars: {:?}", vars.all);
    return Ok(vars);
}

/// Appends a row for every template variable the sheet does not list yet.
/// Variables with a template value become mandatory with that value as
/// default.
pub fn update_sheet(sheet: &mut ServerInfoSheet, vars: &TemplateVars) -> Vec<String> {
    let mut appended = Vec::new();

    for key in vars.all.keys() {
        if sheet.row(key).is_some() {
            continue;
        }
        let mut row = FieldRow::new(key, sheet.hosts.len());
        if let Some(value) = vars.with_values.get(key) {
            row.default = Some(value.clone());
            row.mandatory = true;
        }
        sheet.push_row(row);
        appended.push(key.clone());
    }

    tracing::info!("Appended {} fields to the server info: {:?}", appended.len(), appended);
    return appended;
}

pub fn render_vars(vars: &IndexMap<String, String>) -> String {
    let mut keys: Vec<&String> = vars.keys().collect();
    keys.sort();

    return keys
        .into_iter()
        .map(|key| format!("{}: {}\n", key, vars[key]))
        .collect();
}

#[cfg(test)]
mod tests {
    use super::{
        load_templates, merge_templates, parse_var_template, render_vars, update_sheet, Error,
    };
    use crate::sheet::tests::sample_sheet;
    use pretty_assertions::assert_eq;
    use std::fs;
    use tempfile::tempdir;

    const HOST_TEMPLATE: &str = "\
# host vars
etl_threads: 4
cyl_host:
ssl_cert_file: /etc/pki/tls/certs/{{ inventory_hostname }}.crt
";

    const GROUP_TEMPLATE: &str = "\
timezone: UTC
etl_threads: 2
lsr_out_dir: /data/lsr:out
ldap_uri:
";

    #[test]
    fn parses_key_value_lines() {
        let vars = parse_var_template(GROUP_TEMPLATE);

        assert_eq!(
            vec!["timezone", "etl_threads", "lsr_out_dir", "ldap_uri"],
            vars.keys().collect::<Vec<_>>()
        );
        assert_eq!("/data/lsr:out", vars["lsr_out_dir"]);
        assert_eq!("", vars["ldap_uri"]);
    }

    #[test]
    fn earlier_templates_win() {
        let vars = merge_templates(&[
            parse_var_template(HOST_TEMPLATE),
            parse_var_template(GROUP_TEMPLATE),
        ]);

        assert_eq!("4", vars.all["etl_threads"]);
        assert_eq!(6, vars.all.len());
        assert_eq!(false, vars.with_values.contains_key("cyl_host"));
        assert_eq!(4, vars.with_values.len());
    }

    #[test]
    fn missing_host_template_is_skipped() {
        let dir = tempdir().unwrap();
        let group = dir.path().join("TrueCall_template.yml");
        fs::write(&group, GROUP_TEMPLATE).unwrap();

        let vars = load_templates(&dir.path().join("host_template.yml"), &[group]).unwrap();
        assert_eq!(4, vars.all.len());
    }

    #[test]
    fn missing_group_template() {
        let dir = tempdir().unwrap();
        let result = load_templates(
            &dir.path().join("host_template.yml"),
            &[dir.path().join("missing.yml")],
        );

        assert_eq!(true, result.is_err());
        match result.err().unwrap() {
            Error::FileNotFound(_) => {}
            _ => panic!("Expected `FileNotFound` error"),
        }
    }

    #[test]
    fn appends_unknown_template_vars() {
        let mut sheet = sample_sheet();
        let vars = merge_templates(&[
            parse_var_template(HOST_TEMPLATE),
            parse_var_template(GROUP_TEMPLATE),
        ]);
        let rows = sheet.rows.len();

        let appended = update_sheet(&mut sheet, &vars);

        assert_eq!(vec!["cyl_host", "ssl_cert_file", "lsr_out_dir", "ldap_uri"], appended);
        assert_eq!(rows + 4, sheet.rows.len());

        let cert = sheet.row("ssl_cert_file").unwrap();
        assert_eq!(true, cert.mandatory);
        assert_eq!(
            Some(String::from("/etc/pki/tls/certs/{{ inventory_hostname }}.crt")),
            cert.default
        );
        assert_eq!(3, cert.values.len());

        let ldap = sheet.row("ldap_uri").unwrap();
        assert_eq!(false, ldap.mandatory);
        assert_eq!(None, ldap.default);
    }

    #[test]
    fn renders_sorted_vars() {
        let vars = merge_templates(&[parse_var_template(GROUP_TEMPLATE)]);
        assert_eq!(
            "etl_threads: 2\nlsr_out_dir: /data/lsr:out\ntimezone: UTC\n",
            render_vars(&vars.with_values)
        );
    }
}
