//! Compiles the server info sheet into group and host variable files.
//!
//! Every field is written at the most general scope that keeps each host's
//! resolved value (host > market > global) equal to the value in the sheet.

use std::collections::{BTreeMap, HashSet};

use crate::sheet::{FieldRow, Host, ServerInfoSheet, BASIC_INFO_FIELDS};

pub const HOST_TEMPLATE: &str = "{{ inventory_hostname }}";

#[derive(Debug, Clone, PartialEq)]
enum ScopeValue {
    Literal(String),
    /// A value built from the host name, e.g. `{{ inventory_hostname }}-backup`.
    HostTemplate(String),
}

impl ScopeValue {
    fn resolve(&self, host: &str) -> String {
        match self {
            ScopeValue::Literal(value) => value.clone(),
            ScopeValue::HostTemplate(template) => template.replace(HOST_TEMPLATE, host),
        }
    }

    fn render(&self) -> String {
        match self {
            ScopeValue::Literal(value) => value.clone(),
            ScopeValue::HostTemplate(template) => {
                if template.len() > 1 && template.starts_with('"') && template.ends_with('"') {
                    template.clone()
                } else {
                    format!("\"{}\"", template)
                }
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct VarFile {
    pub name: String,
    pub entries: Vec<(String, String)>,
}

impl VarFile {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: Vec::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(existing, _)| existing == key)
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VarFiles {
    pub global: VarFile,
    pub markets: Vec<VarFile>,
    pub hosts: Vec<VarFile>,
}

/// Lower-cases booleans and fills in defaults for the hosts a row applies to.
///
/// A default also applies when none of the row's server types exists in the
/// sheet (`all`, or a type without servers).
pub fn normalise(sheet: &ServerInfoSheet) -> ServerInfoSheet {
    let mut normalised = sheet.clone();
    let hosts = sheet.hosts();
    let present_types: HashSet<&str> = hosts
        .iter()
        .flat_map(|host| host.server_types.iter())
        .map(|server_type| server_type.rsplit('_').next().unwrap_or(server_type))
        .collect();

    for row in &mut normalised.rows {
        let generic = !row
            .server_types
            .iter()
            .any(|server_type| present_types.contains(server_type.as_str()));

        for host in &hosts {
            let applies = generic || row.applies_to(host);
            let value = match row.values[host.column].take() {
                Some(value) => Some(normalise_bool(value)),
                None if applies => row.default.clone(),
                None => None,
            };
            row.values[host.column] = value;
        }
    }

    return normalised;
}

fn normalise_bool(value: String) -> String {
    let lowered = value.to_lowercase();
    if lowered == "true" || lowered == "false" {
        lowered
    } else {
        value
    }
}

pub fn reduce(sheet: &ServerInfoSheet, group_name: &str, role_fields: &[String]) -> VarFiles {
    let hosts = sheet.hosts();
    let excluded: HashSet<&str> = BASIC_INFO_FIELDS
        .iter()
        .copied()
        .chain(role_fields.iter().map(String::as_str))
        .collect();

    let mut markets: BTreeMap<&str, Vec<&Host>> = BTreeMap::new();
    let mut unassigned: Vec<&Host> = Vec::new();
    for host in &hosts {
        if host.market.is_empty() {
            unassigned.push(host);
        } else {
            markets.entry(host.market.as_str()).or_default().push(host);
        }
    }

    let mut global = VarFile::new(group_name);
    let mut market_files: BTreeMap<&str, VarFile> = markets
        .keys()
        .map(|market| (*market, VarFile::new(market)))
        .collect();
    let mut host_files: Vec<VarFile> = hosts.iter().map(|host| VarFile::new(&host.name)).collect();

    let all_hosts: Vec<&Host> = hosts.iter().collect();
    for row in sheet.rows.iter().filter(|row| !excluded.contains(row.field.as_str())) {
        if row.values.iter().all(Option::is_none) {
            global.entries.push((row.field.clone(), String::new()));
            continue;
        }

        let global_value = scope_value(row, &all_hosts, None);
        if let Some(value) = &global_value {
            tracing::debug!("{}: {} at {}", row.field, value.render(), group_name);
            global.entries.push((row.field.clone(), value.render()));
        }

        let groups = markets
            .iter()
            .map(|(market, members)| (Some(*market), members))
            .chain(std::iter::once((None, &unassigned)));

        for (market, members) in groups {
            let market_value = match market {
                Some(market) => {
                    let value = scope_value(row, members, global_value.as_ref());
                    if let (Some(value), Some(file)) = (&value, market_files.get_mut(market)) {
                        tracing::debug!("{}: {} at {}", row.field, value.render(), market);
                        file.entries.push((row.field.clone(), value.render()));
                    }
                    value.or_else(|| global_value.clone())
                }
                None => global_value.clone(),
            };

            for host in members.iter() {
                let own = match &row.values[host.column] {
                    Some(value) => value,
                    None => continue,
                };
                let inherited = market_value.as_ref().map(|value| value.resolve(&host.name));
                if inherited.as_deref() != Some(own.as_str()) {
                    host_files[host.column]
                        .entries
                        .push((row.field.clone(), own.clone()));
                }
            }
        }
    }

    return VarFiles {
        global,
        markets: market_files
            .into_values()
            .filter(|file| !file.entries.is_empty())
            .collect(),
        hosts: host_files
            .into_iter()
            .filter(|file| !file.entries.is_empty())
            .collect(),
    };
}

/// Value to write for `row` at a scope made of `hosts`, given the value the
/// scope inherits. `None` when the scope needs no entry of its own.
fn scope_value(
    row: &FieldRow,
    hosts: &[&Host],
    inherited: Option<&ScopeValue>,
) -> Option<ScopeValue> {
    let present: Vec<(&Host, &str)> = hosts
        .iter()
        .filter_map(|host| {
            row.values[host.column]
                .as_deref()
                .map(|value| (*host, value))
        })
        .collect();
    if present.is_empty() {
        return None;
    }

    let resolved_already = present.iter().all(|(host, value)| {
        inherited.map(|inherited| inherited.resolve(&host.name)).as_deref() == Some(*value)
    });
    if resolved_already {
        return None;
    }

    if present.len() == hosts.len() {
        if let Some(template) = host_template(&present) {
            return Some(template);
        }
    }

    let mut counts: Vec<(&str, usize)> = Vec::new();
    for (_, value) in &present {
        match counts.iter_mut().find(|(existing, _)| existing == value) {
            Some((_, count)) => *count += 1,
            None => counts.push((*value, 1)),
        }
    }

    if counts.len() == 1 {
        return Some(ScopeValue::Literal(counts[0].0.to_string()));
    }

    let (value, count) = counts
        .iter()
        .fold(counts[0], |best, candidate| if candidate.1 > best.1 { *candidate } else { best });
    let majority = ScopeValue::Literal(value.to_string());
    if count * 2 > hosts.len() && inherited != Some(&majority) {
        return Some(majority);
    }

    return None;
}

/// Recognises values of the form `<host name>-<suffix>` shared by every host.
fn host_template(present: &[(&Host, &str)]) -> Option<ScopeValue> {
    let mut template: Option<String> = None;

    for (host, value) in present {
        let unquoted = value.trim_matches('"');
        let prefixed = unquoted == host.name || unquoted.starts_with(&format!("{}-", host.name));
        if !prefixed {
            return None;
        }

        let candidate = value.replace(&host.name, HOST_TEMPLATE);
        match &template {
            Some(existing) if *existing != candidate => return None,
            Some(_) => (),
            None => template = Some(candidate),
        }
    }

    return template.map(ScopeValue::HostTemplate);
}
