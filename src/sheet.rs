//! In-memory form of the server info sheet.
//!
//! Rows are variable fields and columns are hosts. A handful of leading
//! columns (`field`, `default value`, `mandatory`, `server type` and the
//! optional `category`) describe the field itself; every other column is a
//! host. The basic info rows (`inventory_hostname`, `market`, `submarket`,
//! `server_type`) describe the hosts.

use calamine::{open_workbook_auto, Data, Reader};
use std::path::Path;

pub const INVENTORY_HOSTNAME: &str = "inventory_hostname";
pub const MARKET: &str = "market";
pub const SUBMARKET: &str = "submarket";
pub const SERVER_TYPE: &str = "server_type";
pub const VENDOR_TECH: &str = "vdr_tech";

/// Basic info rows that describe a host rather than configure it.
pub const BASIC_INFO_FIELDS: [&str; 4] = [INVENTORY_HOSTNAME, MARKET, SUBMARKET, SERVER_TYPE];

const CATEGORY_HEADER: &str = "category";
const FIELD_HEADER: &str = "field";
const DEFAULT_HEADER: &str = "default value";
const MANDATORY_HEADER: &str = "mandatory";
const SERVER_TYPE_HEADER: &str = "server type";

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Unable to read {path}: {message}")]
    Read { path: String, message: String },

    #[error("Sheet {0} not found")]
    SheetNotFound(String),

    #[error("Unsupported server info file {0}, expected a workbook or a csv file")]
    UnsupportedFormat(String),

    #[error("Server info file {0} has no `field` column")]
    MissingFieldColumn(String),

    #[error("Server info file {0} has no host columns")]
    NoHosts(String),

    #[error("Unable to write {path}: {message}")]
    Write { path: String, message: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldRow {
    pub category: Option<String>,
    pub field: String,
    pub default: Option<String>,
    pub mandatory: bool,
    pub server_types: Vec<String>,
    /// One entry per host column, in column order.
    pub values: Vec<Option<String>>,
}

impl FieldRow {
    pub fn new(field: &str, host_count: usize) -> Self {
        Self {
            category: None,
            field: field.to_string(),
            default: None,
            mandatory: false,
            server_types: Vec::new(),
            values: vec![None; host_count],
        }
    }

    pub fn applies_to_all(&self) -> bool {
        self.server_types.iter().any(|server_type| server_type == "all")
    }

    /// Whether any of the row's server types, qualified with the host's
    /// vendor tech (`common_lte` + `tcs`), is one of the host's server types.
    pub fn applies_to(&self, host: &Host) -> bool {
        let vendor_tech = host.vendor_tech.as_deref().unwrap_or_default();
        self.server_types.iter().any(|server_type| {
            let qualified = format!("{}_{}", vendor_tech, server_type);
            host.server_types.iter().any(|host_type| *host_type == qualified)
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Host {
    /// Index of the host column.
    pub column: usize,
    pub name: String,
    pub market: String,
    pub submarket: Option<String>,
    pub server_types: Vec<String>,
    pub vendor_tech: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServerInfoSheet {
    pub hosts: Vec<String>,
    pub rows: Vec<FieldRow>,
    pub has_category: bool,
}

impl ServerInfoSheet {
    pub fn row(&self, field: &str) -> Option<&FieldRow> {
        self.rows.iter().find(|row| row.field == field)
    }

    pub fn row_mut(&mut self, field: &str) -> Option<&mut FieldRow> {
        self.rows.iter_mut().find(|row| row.field == field)
    }

    pub fn value(&self, field: &str, column: usize) -> Option<&str> {
        self.row(field)
            .and_then(|row| row.values.get(column))
            .and_then(|value| value.as_deref())
    }

    pub fn push_row(&mut self, mut row: FieldRow) {
        row.values.resize(self.hosts.len(), None);
        self.rows.push(row);
    }

    /// Replaces the column of `host`, appending it when the sheet has none.
    /// Fields the sheet does not list are ignored.
    pub fn set_host_column<F>(&mut self, host: &str, value_of: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let column = match self.hosts.iter().position(|existing| existing == host) {
            Some(column) => column,
            None => {
                self.hosts.push(host.to_string());
                for row in &mut self.rows {
                    row.values.push(None);
                }
                self.hosts.len() - 1
            }
        };

        for row in &mut self.rows {
            row.values[column] = value_of(&row.field);
        }
    }

    pub fn hosts(&self) -> Vec<Host> {
        self.hosts
            .iter()
            .enumerate()
            .map(|(column, header)| Host {
                column,
                name: self
                    .value(INVENTORY_HOSTNAME, column)
                    .unwrap_or(header)
                    .to_string(),
                market: self.value(MARKET, column).unwrap_or_default().to_string(),
                submarket: self.value(SUBMARKET, column).map(str::to_string),
                server_types: split_list(self.value(SERVER_TYPE, column).unwrap_or_default()),
                vendor_tech: self
                    .value(VENDOR_TECH, column)
                    .or_else(|| self.row(VENDOR_TECH).and_then(|row| row.default.as_deref()))
                    .map(str::to_string),
            })
            .collect()
    }

    /// Builds the sheet from a header row and data rows of normalised cells.
    pub fn from_rows(
        source: &str,
        header: Vec<Option<String>>,
        rows: Vec<Vec<Option<String>>>,
    ) -> Result<Self, Error> {
        let mut category = None;
        let mut field = None;
        let mut default = None;
        let mut mandatory = None;
        let mut server_type = None;
        let mut host_columns = Vec::new();

        for (index, name) in header.iter().enumerate() {
            let name = match name {
                Some(name) => name,
                None => continue,
            };
            match name.to_lowercase().as_str() {
                CATEGORY_HEADER => category = Some(index),
                FIELD_HEADER => field = Some(index),
                DEFAULT_HEADER => default = Some(index),
                MANDATORY_HEADER => mandatory = Some(index),
                SERVER_TYPE_HEADER => server_type = Some(index),
                _ => host_columns.push((index, name.clone())),
            }
        }

        let field = field.ok_or_else(|| Error::MissingFieldColumn(source.to_string()))?;
        if host_columns.is_empty() {
            return Err(Error::NoHosts(source.to_string()));
        }

        let cell = |row: &Vec<Option<String>>, index: Option<usize>| -> Option<String> {
            index.and_then(|index| row.get(index).cloned().flatten())
        };

        let rows = rows
            .iter()
            .filter_map(|row| {
                let name = cell(row, Some(field))?;
                Some(FieldRow {
                    category: cell(row, category),
                    field: name,
                    default: cell(row, default),
                    mandatory: cell(row, mandatory)
                        .map(|value| parse_flag(&value))
                        .unwrap_or(false),
                    server_types: split_list(&cell(row, server_type).unwrap_or_default()),
                    values: host_columns
                        .iter()
                        .map(|(index, _)| cell(row, Some(*index)))
                        .collect(),
                })
            })
            .collect();

        return Ok(Self {
            hosts: host_columns.into_iter().map(|(_, name)| name).collect(),
            rows,
            has_category: category.is_some(),
        });
    }

    pub fn write_csv(&self, path: &Path) -> Result<(), Error> {
        let write_error = |error: csv::Error| Error::Write {
            path: path.display().to_string(),
            message: error.to_string(),
        };
        let mut writer = csv::Writer::from_path(path).map_err(write_error)?;

        let mut header: Vec<&str> = Vec::new();
        if self.has_category {
            header.push(CATEGORY_HEADER);
        }
        header.extend([FIELD_HEADER, DEFAULT_HEADER, MANDATORY_HEADER, SERVER_TYPE_HEADER]);
        header.extend(self.hosts.iter().map(String::as_str));
        writer.write_record(&header).map_err(write_error)?;

        for row in &self.rows {
            let mut record: Vec<String> = Vec::new();
            if self.has_category {
                record.push(row.category.clone().unwrap_or_default());
            }
            record.push(row.field.clone());
            record.push(row.default.clone().unwrap_or_default());
            record.push(row.mandatory.to_string());
            record.push(row.server_types.join(","));
            record.extend(row.values.iter().map(|value| value.clone().unwrap_or_default()));
            writer.write_record(&record).map_err(write_error)?;
        }

        writer.flush().map_err(|error| Error::Write {
            path: path.display().to_string(),
            message: error.to_string(),
        })?;

        return Ok(());
    }
}

pub fn load(path: &Path, sheet_name: &str) -> Result<ServerInfoSheet, Error> {
    let extension = path
        .extension()
        .and_then(|extension| extension.to_str())
        .map(str::to_lowercase)
        .unwrap_or_default();

    let mut rows = match extension.as_str() {
        "csv" => read_csv(path)?,
        "xlsx" | "xlsm" | "xls" | "xlsb" | "ods" => read_workbook(path, sheet_name)?,
        _ => return Err(Error::UnsupportedFormat(path.display().to_string())),
    };
    if rows.is_empty() {
        return Err(Error::MissingFieldColumn(path.display().to_string()));
    }

    let header = rows.remove(0);
    let sheet = ServerInfoSheet::from_rows(&path.display().to_string(), header, rows)?;
    tracing::info!(
        "Loaded {} fields for {} hosts from {}",
        sheet.rows.len(),
        sheet.hosts.len(),
        path.display()
    );
    return Ok(sheet);
}

fn read_workbook(path: &Path, sheet_name: &str) -> Result<Vec<Vec<Option<String>>>, Error> {
    let read_error = |message: String| Error::Read {
        path: path.display().to_string(),
        message,
    };
    let mut workbook = open_workbook_auto(path).map_err(|error| read_error(error.to_string()))?;
    if !workbook.sheet_names().iter().any(|name| name == sheet_name) {
        return Err(Error::SheetNotFound(sheet_name.to_string()));
    }

    let range = workbook
        .worksheet_range(sheet_name)
        .map_err(|error| read_error(error.to_string()))?;

    return Ok(range
        .rows()
        .map(|row| row.iter().map(normalise_data).collect())
        .collect());
}

fn read_csv(path: &Path) -> Result<Vec<Vec<Option<String>>>, Error> {
    let read_error = |error: csv::Error| Error::Read {
        path: path.display().to_string(),
        message: error.to_string(),
    };
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)
        .map_err(read_error)?;

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(read_error)?;
        rows.push(record.iter().map(normalise_text).collect());
    }

    return Ok(rows);
}

fn normalise_data(data: &Data) -> Option<String> {
    match data {
        Data::Empty => None,
        Data::String(text) => normalise_text(text),
        Data::Bool(flag) => Some(flag.to_string()),
        Data::Int(number) => Some(number.to_string()),
        Data::Float(number) => Some(format_float(*number)),
        Data::Error(_) => None,
        other => normalise_text(&other.to_string()),
    }
}

fn normalise_text(text: &str) -> Option<String> {
    let text = text.trim();
    if text.is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}

fn format_float(number: f64) -> String {
    if number.fract() == 0.0 && number.abs() < i64::MAX as f64 {
        return (number as i64).to_string();
    }
    return number.to_string();
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "true" | "yes" | "1" | "mandatory"
    )
}

/// Splits a comma separated cell, dropping blanks.
pub fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::{load, Error, ServerInfoSheet};
    use pretty_assertions::assert_eq;
    use rust_xlsxwriter::Workbook;
    use std::fs;
    use std::path::Path;
    use tempfile::tempdir;

    pub(crate) const SAMPLE: &str = "\
category,field,default value,mandatory,server type,srv-a1,srv-a2,srv-b1
basic_info,inventory_hostname,,TRUE,all,srv-a1,srv-a2,srv-b1
basic_info,truecall_rpm,,FALSE,all,TrueCall-17.3.rpm,TrueCall-17.3.rpm,
basic_info,gsrsvcs_rpm,,FALSE,all,gsrsvcs-2.1.rpm,gsrsvcs-2.1.rpm,gsrsvcs-2.1.rpm
basic_info,market,,TRUE,all,North,North,South
basic_info,submarket,,FALSE,all,,,
basic_info,server_type,,TRUE,all,\"common_lte_tcs,common_lte_cyl\",common_lte_etl,common_lte_etl
vars,vdr_tech,common_lte,TRUE,all,,,
vars,timezone,,TRUE,all,Asia/Kolkata,Asia/Kolkata,Asia/Kolkata
vars,ssl_enabled,,FALSE,tcs,True,,
vars,etl_threads,4,TRUE,etl,,,8
vars,cyl_days_to_keep,7,TRUE,cyl,,,
vars,backup_dir,,FALSE,all,srv-a1-backup,srv-a2-backup,srv-b1-backup
vars,ntp_server,,FALSE,all,10.0.0.1,10.0.0.1,10.0.0.2
vars,notes,,FALSE,all,,,
";

    pub(crate) fn sample_sheet() -> ServerInfoSheet {
        let dir = tempdir().unwrap();
        let path = dir.path().join("server_info.csv");
        fs::write(&path, SAMPLE).unwrap();
        load(&path, "ignored").unwrap()
    }

    #[test]
    fn loads_csv_sheet() {
        let sheet = sample_sheet();

        assert_eq!(vec!["srv-a1", "srv-a2", "srv-b1"], sheet.hosts);
        assert_eq!(true, sheet.has_category);
        let row = sheet.row("etl_threads").unwrap();
        assert_eq!(Some(String::from("4")), row.default);
        assert_eq!(true, row.mandatory);
        assert_eq!(vec![String::from("etl")], row.server_types);
        assert_eq!(vec![None, None, Some(String::from("8"))], row.values);
    }

    #[test]
    fn derives_hosts_from_basic_info() {
        let sheet = sample_sheet();
        let hosts = sheet.hosts();

        assert_eq!(3, hosts.len());
        assert_eq!("srv-a1", hosts[0].name);
        assert_eq!("North", hosts[0].market);
        assert_eq!(None, hosts[0].submarket);
        assert_eq!(
            vec![String::from("common_lte_tcs"), String::from("common_lte_cyl")],
            hosts[0].server_types
        );
        assert_eq!(Some(String::from("common_lte")), hosts[0].vendor_tech);
    }

    #[test]
    fn missing_field_column() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("server_info.csv");
        fs::write(&path, "name,srv-a1\ntimezone,UTC\n").unwrap();

        match load(&path, "ignored").err().unwrap() {
            Error::MissingFieldColumn(_) => {}
            _ => panic!("Expected `MissingFieldColumn` error"),
        }
    }

    #[test]
    fn unsupported_extension() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("server_info.txt");
        fs::write(&path, "field,srv-a1\n").unwrap();

        match load(&path, "ignored").err().unwrap() {
            Error::UnsupportedFormat(_) => {}
            _ => panic!("Expected `UnsupportedFormat` error"),
        }
    }

    #[test]
    fn set_host_column_appends_and_replaces() {
        let mut sheet = sample_sheet();
        sheet.set_host_column("srv-c1", |field| match field {
            "timezone" => Some(String::from("UTC")),
            _ => None,
        });
        sheet.set_host_column("srv-a1", |_| None);

        assert_eq!(4, sheet.hosts.len());
        assert_eq!(Some("UTC"), sheet.value("timezone", 3));
        assert_eq!(None, sheet.value("timezone", 0));
        assert_eq!(Some("Asia/Kolkata"), sheet.value("timezone", 1));
    }

    #[test]
    fn writes_csv_that_loads_back() {
        let sheet = sample_sheet();
        let dir = tempdir().unwrap();
        let path = dir.path().join("copy.csv");

        sheet.write_csv(&path).unwrap();
        let reloaded = load(&path, "ignored").unwrap();

        assert_eq!(sheet, reloaded);
    }

    /// Workbook with a blank first row, numbers, booleans and empty cells.
    fn write_workbook(path: &Path, sheet_name: &str) {
        let mut workbook = Workbook::new();
        let worksheet = workbook.add_worksheet();
        worksheet.set_name(sheet_name).unwrap();

        let header = ["field", "default value", "mandatory", "server type", "srv-a1", "srv-b1"];
        for (column, name) in header.iter().enumerate() {
            worksheet.write_string(1, column as u16, *name).unwrap();
        }

        let text_rows = [
            ["inventory_hostname", "all", "srv-a1", "srv-b1"],
            ["market", "all", "North", "South"],
            ["server_type", "all", "common_lte_tcs", "common_lte_etl"],
        ];
        for (offset, [field, server_type, first, second]) in text_rows.iter().enumerate() {
            let row = 2 + offset as u32;
            worksheet.write_string(row, 0, *field).unwrap();
            worksheet.write_boolean(row, 2, true).unwrap();
            worksheet.write_string(row, 3, *server_type).unwrap();
            worksheet.write_string(row, 4, *first).unwrap();
            worksheet.write_string(row, 5, *second).unwrap();
        }

        worksheet.write_string(5, 0, "etl_threads").unwrap();
        worksheet.write_number(5, 1, 4.0).unwrap();
        worksheet.write_boolean(5, 2, true).unwrap();
        worksheet.write_string(5, 3, "etl").unwrap();
        worksheet.write_number(5, 5, 22.0).unwrap();

        worksheet.write_string(6, 0, "ssl_enabled").unwrap();
        worksheet.write_boolean(6, 2, false).unwrap();
        worksheet.write_string(6, 3, "tcs").unwrap();
        worksheet.write_boolean(6, 4, true).unwrap();

        worksheet.write_string(7, 0, "ratio").unwrap();
        worksheet.write_string(7, 3, "all").unwrap();
        worksheet.write_number(7, 4, 1.5).unwrap();

        workbook.save(path).unwrap();
    }

    #[test]
    fn loads_named_workbook_sheet() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("server_info.xlsx");
        write_workbook(&path, "Server Info");

        let sheet = load(&path, "Server Info").unwrap();

        assert_eq!(vec!["srv-a1", "srv-b1"], sheet.hosts);
        assert_eq!(false, sheet.has_category);
        assert_eq!(6, sheet.rows.len());

        let hosts = sheet.hosts();
        assert_eq!("South", hosts[1].market);
        assert_eq!(vec![String::from("common_lte_etl")], hosts[1].server_types);

        let etl_threads = sheet.row("etl_threads").unwrap();
        assert_eq!(Some(String::from("4")), etl_threads.default);
        assert_eq!(true, etl_threads.mandatory);
        assert_eq!(vec![None, Some(String::from("22"))], etl_threads.values);

        let ssl = sheet.row("ssl_enabled").unwrap();
        assert_eq!(false, ssl.mandatory);
        assert_eq!(vec![Some(String::from("true")), None], ssl.values);

        let ratio = sheet.row("ratio").unwrap();
        assert_eq!(vec![Some(String::from("1.5")), None], ratio.values);
    }

    #[test]
    fn workbook_sheet_not_found() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("server_info.xlsx");
        write_workbook(&path, "Server Info");

        let result = load(&path, "Hosts");

        assert_eq!(true, result.is_err());
        match result.err().unwrap() {
            Error::SheetNotFound(name) => assert_eq!("Hosts", name),
            _ => panic!("Expected `SheetNotFound` error"),
        }
    }
}
