use std::collections::BTreeMap;

use crate::sheet::ServerInfoSheet;

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum Error {
    #[error("Server info file missing mandatory fields: {}", format_missing(.0))]
    MissingMandatory(BTreeMap<String, Vec<String>>),
}

/// Mandatory fields without a value or a default, per host name.
pub fn missing_mandatory(sheet: &ServerInfoSheet) -> BTreeMap<String, Vec<String>> {
    let mut missing: BTreeMap<String, Vec<String>> = BTreeMap::new();

    for host in sheet.hosts() {
        for row in &sheet.rows {
            let has_value = row.values[host.column].is_some() || row.default.is_some();
            if has_value || !row.mandatory {
                continue;
            }
            if row.applies_to_all() || row.applies_to(&host) {
                missing
                    .entry(host.name.clone())
                    .or_default()
                    .push(row.field.clone());
            }
        }
    }

    return missing;
}

pub fn validate(sheet: &ServerInfoSheet) -> Result<(), Error> {
    let missing = missing_mandatory(sheet);
    if missing.is_empty() {
        return Ok(());
    }

    tracing::error!("Server info file missing mandatory fields: {:?}", missing);
    return Err(Error::MissingMandatory(missing));
}

fn format_missing(missing: &BTreeMap<String, Vec<String>>) -> String {
    missing
        .iter()
        .map(|(host, fields)| format!("{} ({})", host, fields.join(", ")))
        .collect::<Vec<_>>()
        .join("; ")
}
