//! Reads the site backups taken from running servers and turns each of them
//! into a server info column.

use regex::Regex;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::ini::Ini;
use crate::sheet::{ServerInfoSheet, INVENTORY_HOSTNAME, SERVER_TYPE, VENDOR_TECH};

const TECHNOLOGIES: [&str; 3] = ["lte", "umts", "gsm"];

const LDAP_FIELDS: [(&str, &str); 12] = [
    ("ldap_search_base", "SearchBase"),
    ("ldap_superuser_dn", "SuperUserDn"),
    ("ldap_superuser_dn_password", "SuperUserPassword"),
    ("ldap_uri", "URI"),
    ("ldap_enabled", "Enable"),
    ("ldap_groupsearch_enabled", "EnableGroupSearch"),
    ("ldap_search_attribute_group_dn", "SearchAttributeForGroupDn"),
    ("ldap_search_attribute_group_name", "SearchAttributeForGroupName"),
    ("ldap_search_attribute_user_email", "SearchAttributeForUserEmail"),
    ("ldap_search_attribute_user_firstname", "SearchAttributeForUserFirstName"),
    ("ldap_search_attribute_user_lastname", "SearchAttributeForUserLastName"),
    ("ldap_username_filter", "UsernameFilter"),
];

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum Error {
    #[error("Backup directory {0} not found")]
    DirectoryNotFound(String),

    #[error("Unable to read {path}: {message}")]
    Read { path: String, message: String },

    #[error("Invalid pattern: {0}")]
    Pattern(String),
}

/// Values recovered from one server backup, keyed by server info field.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Backup {
    pub host: String,
    pub values: BTreeMap<String, String>,
}

impl Backup {
    fn set(&mut self, field: &str, value: &str) {
        self.values.insert(field.to_string(), value.to_string());
    }
}

#[derive(Debug, Default)]
struct Roles {
    tcs: bool,
    cyl: bool,
    etl: bool,
    lsr: bool,
}

struct Patterns {
    args_prefix: Regex,
    port: Regex,
}

impl Patterns {
    fn new() -> Result<Self, Error> {
        let compile = |pattern: &str| {
            Regex::new(pattern).map_err(|error| Error::Pattern(error.to_string()))
        };
        return Ok(Self {
            args_prefix: compile(r"^\s*\d+/args=")?,
            port: compile(r":\d+")?,
        });
    }

    /// `1/args=--port=7000|--tmp-dir="/data/tmp"` into `--port` and `--tmp-dir`.
    fn args(&self, line: &str) -> BTreeMap<String, String> {
        line.split('|')
            .filter_map(|arg| {
                let arg = self.args_prefix.replace(arg, "");
                let (key, value) = arg.split_once('=')?;
                Some((
                    key.trim().trim_matches('"').trim().to_string(),
                    value.trim().trim_matches('"').trim().to_string(),
                ))
            })
            .collect()
    }
}

/// Host name from a backup directory such as `srv_a1_20181119_backup`.
pub fn host_name(dir_name: &str) -> String {
    dir_name.split('_').take(2).collect::<Vec<_>>().join("_")
}

/// Parses every backup directory under `root`, sorted by host name.
pub fn parse_backups(root: &Path) -> Result<Vec<Backup>, Error> {
    let entries = fs::read_dir(root)
        .map_err(|_| Error::DirectoryNotFound(root.display().to_string()))?;
    let mut dirs: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .filter(|path| path.is_dir())
        .collect();
    dirs.sort();

    let patterns = Patterns::new()?;
    let mut backups = Vec::new();
    for dir in dirs {
        backups.push(parse_backup(&dir, &patterns)?);
    }
    backups.sort_by(|a, b| a.host.cmp(&b.host));

    tracing::info!("Parsed {} backups under {}", backups.len(), root.display());
    return Ok(backups);
}

fn read_optional(path: &Path) -> Result<Option<String>, Error> {
    if !path.exists() {
        return Ok(None);
    }
    match fs::read_to_string(path) {
        Ok(contents) => Ok(Some(contents)),
        Err(error) => Err(Error::Read {
            path: path.display().to_string(),
            message: error.to_string(),
        }),
    }
}

fn parse_backup(dir: &Path, patterns: &Patterns) -> Result<Backup, Error> {
    let dir_name = dir
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    let mut backup = Backup {
        host: host_name(&dir_name),
        ..Backup::default()
    };
    tracing::info!("Parsing backup {} for {}", dir.display(), backup.host);

    if let Some(info) = read_optional(&dir.join("sys_info").join("pre_upgrade_info.txt"))? {
        if let Some(line) = info.lines().find(|line| line.contains("zoneinfo")) {
            let parts: Vec<&str> = line.split('/').collect();
            let timezone = parts[parts.len().saturating_sub(2)..].join("/");
            backup.set("timezone", timezone.trim());
        }
    }

    let mut roles = Roles::default();
    let mut server_types = Vec::new();
    let mut vendor_tech = None;

    if let Some(config) = read_optional(&dir.join("etc").join("config.ini"))? {
        let lowered = config.to_lowercase();
        match TECHNOLOGIES.iter().find(|tech| lowered.contains(*tech)) {
            Some(tech) => {
                let vendor = format!("common_{}", tech);
                parse_config(
                    &config,
                    tech,
                    &vendor,
                    patterns,
                    &mut backup,
                    &mut roles,
                    &mut server_types,
                );
                vendor_tech = Some(vendor);
            }
            None => tracing::warn!("No technology found in the config of {}", backup.host),
        }
    }

    if roles.cyl {
        if let Some(cron) = read_optional(&dir.join("cron").join("daemon"))? {
            parse_cleanup_cron(&cron, &mut backup);
        }
    }

    if let Some(tcaccess) = read_optional(&dir.join("etc").join("tcaccess.ini"))? {
        parse_tcaccess(&Ini::parse(&tcaccess), &roles, &mut backup);
    }

    let host = backup.host.clone();
    backup.set(INVENTORY_HOSTNAME, &host);
    if let Some(vendor) = vendor_tech {
        backup.set(VENDOR_TECH, &vendor);
    }
    backup.set(SERVER_TYPE, &server_types.join(","));

    tracing::debug!("{} backup values: {:?}", backup.host, backup.values);
    return Ok(backup);
}

fn parse_config(
    config: &str,
    tech: &str,
    vendor: &str,
    patterns: &Patterns,
    backup: &mut Backup,
    roles: &mut Roles,
    server_types: &mut Vec<String>,
) {
    let upper = tech.to_uppercase();
    let tcs_label = format!("label=TcsTcpServer_COMMON_{}", upper);
    let cyl_label = format!("label=cylinderd_COMMON_{}", upper);
    let etl_label = format!("label=processor-common-{}", tech);
    let lsr_label = format!("label=LSR_Server_COMMON_{}", upper);
    let mut cyl_process: Option<String> = None;
    let host = backup.host.clone();

    for line in config.lines().filter(|line| !line.starts_with('#')) {
        if line.contains(&tcs_label) {
            roles.tcs = true;
            server_types.push(format!("{}_tcs", vendor));
        }
        if line.contains(&cyl_label) {
            roles.cyl = true;
            server_types.push(format!("{}_cyl", vendor));
            cyl_process = line.split('/').next().map(|number| number.trim().to_string());
        }
        if line.contains(&etl_label) {
            roles.etl = true;
            server_types.push(format!("{}_etl", vendor));
        }
        if line.contains(&lsr_label) {
            roles.lsr = true;
            server_types.push(format!("{}_lsr", vendor));
        }

        if roles.cyl {
            backup.set("cyl_host", &host);
            let is_cyl_args = cyl_process
                .as_deref()
                .map_or(false, |number| line.trim_start().starts_with(&format!("{}/", number)));
            if is_cyl_args && line.contains("args") && line.contains("--port") {
                let args = patterns.args(line);
                if let Some(port) = args.get("--port") {
                    backup.set(&format!("{}_cyl_port", vendor), port);
                }
                if let Some(tcs_host) = args.get("--ne-db-connection") {
                    backup.set("tcs_host", tcs_host);
                }
            }
            if line.contains("--tmp-dir") {
                let args = patterns.args(line);
                for (field, arg) in [("lsr_tmp_dir", "--tmp-dir"), ("lsr_out_dir", "--out-dir")] {
                    if let Some(value) = args.get(arg) {
                        backup.set(field, value);
                    }
                }
            }
        }

        if roles.tcs && line.contains("--cylinderd-address") {
            let args = patterns.args(line);
            let addresses = args.get("--cylinderd-address").cloned().unwrap_or_default();
            let cylinders = patterns.port.replace_all(&addresses, "").to_string();
            let port = args.get("--port").cloned().unwrap_or_default();
            if addresses.split(',').count() > 1 {
                backup.set("qams_cyl_list", &cylinders);
                backup.set("qams_port", &port);
                server_types.push(format!("{}_qams", vendor));
            } else {
                backup.set("cyl_list", &cylinders);
                backup.set(&format!("{}_tcs_port", vendor), &port);
            }

            for (arg, dir_field, file_field) in [
                ("--certificate-file", "ssl_cert_dir", "ssl_cert_file"),
                ("--private-key-file", "ssl_key_dir", "ssl_key_file"),
            ] {
                if let Some((dir, file)) = args.get(arg).and_then(|path| path.rsplit_once('/')) {
                    backup.set(dir_field, &format!("{}/", dir));
                    backup.set(file_field, file);
                }
            }
        }

        if roles.etl && line.contains("--input-stream-port") {
            let args = patterns.args(line);
            if let Some(port) = args.get("--input-stream-port") {
                backup.set(&format!("{}_etl_port", vendor), port);
            }
            if let Some(cyl_host) = args.get("--cyl-host") {
                backup.set("cyl_host", cyl_host);
            }
            if let Some(tcs_host) = args.get("--ne-db-connection") {
                backup.set("tcs_host", tcs_host);
            }
        }
    }
}

/// Retention of the cylinder cleanup jobs, the seventh field of the cron line.
fn parse_cleanup_cron(cron: &str, backup: &mut Backup) {
    for line in cron.lines().filter(|line| !line.starts_with('#')) {
        let field = if line.contains("cylinder-cleanup.sh") {
            "cyl_days_to_keep"
        } else if line.contains("cylinder-cleanup-fragments.sh") {
            "cyl_fragments_to_keep"
        } else {
            continue;
        };
        if let Some(token) = line.split(' ').nth(6) {
            backup.set(field, token.trim().trim_matches('-'));
        }
    }
}

fn parse_tcaccess(tcaccess: &Ini, roles: &Roles, backup: &mut Backup) {
    let db_host = tcaccess.get("Database", "DbHost");

    if roles.tcs {
        let enabled = tcaccess
            .get("LDAP", "Enable")
            .map_or(false, |enable| !enable.is_empty() && enable != "0");
        if enabled {
            for (field, key) in LDAP_FIELDS {
                if let Some(value) = tcaccess.get("LDAP", key) {
                    backup.set(field, value);
                }
            }
        }
        let host = backup.host.clone();
        backup.set("tcs_host", &host);
    } else if (roles.etl && db_host != Some("localhost")) || roles.cyl || roles.lsr {
        if let Some(db_host) = db_host {
            backup.set("tcs_host", db_host);
        }
    }
}

/// One column per backup host. Only fields the sheet already lists are
/// filled in.
pub fn merge_into_sheet(sheet: &mut ServerInfoSheet, backups: &[Backup]) {
    for backup in backups {
        let unknown: Vec<&String> = backup
            .values
            .keys()
            .filter(|field| sheet.row(field).is_none())
            .collect();
        if !unknown.is_empty() {
            tracing::warn!(
                "{} has fields the server info does not list: {:?}",
                backup.host,
                unknown
            );
        }
        sheet.set_host_column(&backup.host, |field| backup.values.get(field).cloned());
    }
}
