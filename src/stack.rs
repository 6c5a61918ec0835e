use aws_config::meta::region::RegionProviderChain;
use aws_config::BehaviorVersion;
use aws_sdk_cloudformation::error::{DisplayErrorContext, SdkError};
use aws_sdk_cloudformation::types::{Capability, Parameter, Stack};
use aws_types::region::Region;
use chrono::{DateTime, Local};
use futures::future::join_all;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};

use crate::config::CloudFormationConfig;
use crate::session;
use crate::writer::write_atomic;

pub const STACK_INFO_FILE: &str = "cfn-StackInfo.json";
pub const PARAMETERS_FILE: &str = "cfn-parameters.json";
pub const DEFAULT_REGION: &str = "ap-southeast-2";
pub const SSH_LOCATION: &str = "SSHLocation";
pub const CONTROL_IP_OUTPUT: &str = "ControlPublicIp";

const DELETE_COMPLETE: &str = "DELETE_COMPLETE";

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum Error {
    #[error("Service error ocurred: {0}.")]
    ServiceError(String),

    #[error("Unknown error ocurred: {0}.")]
    UnknownError(String),

    #[error("Stack {0} not found")]
    NotFoundError(String),

    #[error("File {0} not found")]
    FileNotFound(String),

    #[error("Parsing error: {0}")]
    ParsingError(String),

    #[error("Unable to write {path}: {message}")]
    Write { path: String, message: String },

    #[error("Unable to look up the public ip: {0}")]
    IpLookup(String),

    #[error("{0}")]
    Aborted(String),
}

fn sdk_error<E, R>(error: SdkError<E, R>) -> Error
where
    E: std::error::Error + 'static,
    R: std::fmt::Debug,
{
    match error {
        SdkError::ServiceError(context) => {
            Error::ServiceError(DisplayErrorContext(context.into_err()).to_string())
        }
        error => Error::UnknownError(DisplayErrorContext(error).to_string()),
    }
}

/// Parameter in the CloudFormation CLI JSON layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackParameter {
    #[serde(rename = "ParameterKey")]
    pub key: String,

    #[serde(rename = "ParameterValue")]
    pub value: String,
}

impl From<&StackParameter> for Parameter {
    fn from(parameter: &StackParameter) -> Self {
        Parameter::builder()
            .parameter_key(&parameter.key)
            .parameter_value(&parameter.value)
            .build()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackInfo {
    pub stack_name: String,
    pub stack_status: String,
    #[serde(default)]
    pub stack_parameters: Vec<StackParameter>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub stack_output: BTreeMap<String, String>,
}

impl StackInfo {
    pub fn from_stack(stack_id: &str, stack: &Stack) -> Self {
        let stack_parameters = stack
            .parameters()
            .iter()
            .filter_map(|parameter| {
                Some(StackParameter {
                    key: parameter.parameter_key()?.to_string(),
                    value: parameter.parameter_value().unwrap_or_default().to_string(),
                })
            })
            .collect();
        let stack_output = stack
            .outputs()
            .iter()
            .filter_map(|output| {
                Some((
                    output.output_key()?.to_string(),
                    output.output_value().unwrap_or_default().to_string(),
                ))
            })
            .collect();

        return Self {
            stack_name: stack_name_from_id(stack.stack_id().unwrap_or(stack_id)),
            stack_status: stack
                .stack_status()
                .map(|status| status.as_str().to_string())
                .unwrap_or_default(),
            stack_parameters,
            stack_output,
        };
    }

    pub fn is_deleting(&self) -> bool {
        self.stack_status.starts_with("DELETE")
    }

    pub fn control_ip(&self) -> Option<&str> {
        self.stack_output.get(CONTROL_IP_OUTPUT).map(String::as_str)
    }
}

/// Stacks created by this tool, keyed by stack id.
pub type Ledger = BTreeMap<String, StackInfo>;

/// `arn:aws:cloudformation:<region>:<account>:stack/<name>/<uuid>` to `<name>`.
pub fn stack_name_from_id(stack_id: &str) -> String {
    stack_id.split('/').nth(1).unwrap_or(stack_id).to_string()
}

/// Alphanumeric runs of the template file name without its extension,
/// followed by a timestamp: `cfn_test.yaml` to `cfn-test-20190322103005`.
pub fn default_stack_name(template: &Path, now: DateTime<Local>) -> String {
    let file_name = template
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    let mut parts: Vec<String> = file_name
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect();
    parts.pop();
    parts.push(now.format("%Y%m%d%H%M%S").to_string());

    return parts.join("-");
}

/// First dotted quad of an ip lookup response.
pub fn extract_ip(text: &str) -> Result<String, Error> {
    let pattern = Regex::new(r"\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}")
        .map_err(|error| Error::IpLookup(error.to_string()))?;
    match pattern.find(text) {
        Some(found) => Ok(found.as_str().to_string()),
        None => Err(Error::IpLookup(format!("no address in {:?}", text.trim()))),
    }
}

/// Restricts ssh to the given address, replacing any `SSHLocation` the
/// parameter file carries.
pub fn with_ssh_location(mut parameters: Vec<StackParameter>, ip: &str) -> Vec<StackParameter> {
    let location = format!("{}/32", ip);
    match parameters.iter_mut().find(|parameter| parameter.key == SSH_LOCATION) {
        Some(parameter) => parameter.value = location,
        None => parameters.push(StackParameter {
            key: String::from(SSH_LOCATION),
            value: location,
        }),
    }

    return parameters;
}

pub fn read_parameters(path: &Path) -> Result<Vec<StackParameter>, Error> {
    let contents = read_file(path)?;
    return serde_json::from_str(&contents).map_err(|error| Error::ParsingError(error.to_string()));
}

pub fn write_parameters(dir: &Path, parameters: &[StackParameter]) -> Result<PathBuf, Error> {
    let path = dir.join(PARAMETERS_FILE);
    write_json(&path, &parameters)?;
    return Ok(path);
}

/// A missing or unreadable ledger is treated as empty.
pub fn load_ledger(dir: &Path) -> Ledger {
    let path = dir.join(STACK_INFO_FILE);
    let contents = match fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(error) => {
            tracing::debug!("No stack info at {}: {}", path.display(), error);
            return Ledger::new();
        }
    };

    return match serde_json::from_str(&contents) {
        Ok(ledger) => ledger,
        Err(error) => {
            tracing::error!("{} loading error. {}", path.display(), error);
            Ledger::new()
        }
    };
}

pub fn save_ledger(dir: &Path, ledger: &Ledger) -> Result<PathBuf, Error> {
    let path = dir.join(STACK_INFO_FILE);
    write_json(&path, ledger)?;
    return Ok(path);
}

/// Lines printed for one stack: its id, status and sorted outputs.
pub fn describe_lines(stack_id: &str, info: &StackInfo) -> Vec<String> {
    let mut lines = vec![
        stack_id.to_string(),
        format!("Stack Status: {}", info.stack_status),
    ];
    lines.extend(
        info.stack_output
            .iter()
            .map(|(key, value)| format!("{}: {}", key, value)),
    );

    return lines;
}

/// Asks a yes or no question, only `y` confirms.
pub fn confirm_with<R: BufRead>(reader: &mut R, prompt: &str) -> Result<bool, Error> {
    println!("{}", prompt);
    io::stdout()
        .flush()
        .map_err(|error| Error::UnknownError(error.to_string()))?;

    let mut answer = String::new();
    reader
        .read_line(&mut answer)
        .map_err(|error| Error::UnknownError(error.to_string()))?;

    return Ok(answer.trim() == "y");
}

fn confirm(prompt: &str, assume_yes: bool) -> Result<bool, Error> {
    if assume_yes {
        return Ok(true);
    }
    return confirm_with(&mut io::stdin().lock(), prompt);
}

fn read_file(path: &Path) -> Result<String, Error> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(contents),
        Err(error) => match error.kind() {
            io::ErrorKind::NotFound => Err(Error::FileNotFound(path.display().to_string())),
            _ => Err(Error::UnknownError(error.to_string())),
        },
    }
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), Error> {
    let contents = serde_json::to_string_pretty(value)
        .map_err(|error| Error::ParsingError(error.to_string()))?;

    return write_atomic(path, &contents).map_err(|error| Error::Write {
        path: path.display().to_string(),
        message: error.to_string(),
    });
}

pub struct StackManager {
    pub dir: PathBuf,
    ip_lookup_url: String,
    session_template: Option<PathBuf>,
    client: aws_sdk_cloudformation::Client,
}

impl StackManager {
    pub async fn new(config: &CloudFormationConfig) -> Self {
        let region_provider = RegionProviderChain::first_try(config.region.clone().map(Region::new))
            .or_default_provider()
            .or_else(Region::new(DEFAULT_REGION));

        let sdk_config = aws_config::defaults(BehaviorVersion::latest())
            .region(region_provider)
            .load()
            .await;
        let client = aws_sdk_cloudformation::Client::new(&sdk_config);

        return Self {
            dir: config.dir.clone(),
            ip_lookup_url: config.ip_lookup_url.clone(),
            session_template: config.session_template.clone(),
            client,
        };
    }

    /// Templates are looked up as given first, then inside the stack dir.
    pub fn resolve_template(&self, template: &Path) -> PathBuf {
        if template.exists() || template.is_absolute() {
            return template.to_path_buf();
        }
        return self.dir.join(template);
    }

    pub async fn validate_template(&self, template: &Path) -> Result<String, Error> {
        let body = read_file(template)?;
        self.client
            .validate_template()
            .template_body(&body)
            .send()
            .await
            .map_err(sdk_error)?;
        tracing::info!("Template {} is valid", template.display());

        return Ok(body);
    }

    pub async fn public_ip(&self) -> Result<String, Error> {
        let response = reqwest::get(&self.ip_lookup_url)
            .await
            .map_err(|error| Error::IpLookup(error.to_string()))?;
        let text = response
            .text()
            .await
            .map_err(|error| Error::IpLookup(error.to_string()))?;

        return extract_ip(&text);
    }

    pub async fn describe_stack(&self, stack_id: &str) -> Result<StackInfo, Error> {
        let output = self
            .client
            .describe_stacks()
            .stack_name(stack_id)
            .send()
            .await
            .map_err(sdk_error)?;

        let stack = match output.stacks().first() {
            Some(stack) => stack,
            None => return Err(Error::NotFoundError(stack_id.to_string())),
        };
        let info = StackInfo::from_stack(stack_id, stack);
        tracing::debug!("Stack {} details: {:?}", stack_id, info);

        return Ok(info);
    }

    /// Describes every stack at once. Deleted stacks and stacks that no
    /// longer describe are dropped, live ones get their session file.
    pub async fn refresh<I>(&self, stack_ids: I) -> Ledger
    where
        I: IntoIterator<Item = String>,
    {
        let stack_ids: Vec<String> = stack_ids.into_iter().collect();
        tracing::info!("Refreshing stacks {:?}", stack_ids);
        let results = join_all(
            stack_ids
                .iter()
                .map(|stack_id| self.describe_stack(stack_id)),
        )
        .await;

        let mut ledger = Ledger::new();
        for (stack_id, result) in stack_ids.into_iter().zip(results) {
            let info = match result {
                Ok(info) => info,
                Err(error) => {
                    tracing::warn!("Dropping {}: {}", stack_id, error);
                    continue;
                }
            };
            if info.stack_status == DELETE_COMPLETE {
                tracing::info!("{} {}", info.stack_name, info.stack_status);
                continue;
            }
            self.write_session(&info);
            ledger.insert(stack_id, info);
        }

        return ledger;
    }

    fn write_session(&self, info: &StackInfo) {
        let (template, ip) = match (&self.session_template, info.control_ip()) {
            (Some(template), Some(ip)) if !info.is_deleting() => (template, ip),
            _ => return,
        };
        if let Err(error) = session::write_session(template, &self.dir, &info.stack_name, ip) {
            tracing::warn!("No session for {}: {}", info.stack_name, error);
        }
    }

    pub async fn create(
        &self,
        template: &Path,
        stack_name: Option<String>,
        parameter_file: Option<&Path>,
        assume_yes: bool,
    ) -> Result<String, Error> {
        let template = self.resolve_template(template);
        let body = self.validate_template(&template).await?;
        let stack_name = stack_name.unwrap_or_else(|| default_stack_name(&template, Local::now()));

        let parameters = match parameter_file {
            Some(path) => read_parameters(path)?,
            None => Vec::new(),
        };
        let parameters = with_ssh_location(parameters, &self.public_ip().await?);
        write_parameters(&self.dir, &parameters)?;

        let ledger = self.refresh(load_ledger(&self.dir).into_keys()).await;
        if !ledger.is_empty() {
            let prompt = format!(
                "Stacks {:?} in system.\nAre you sure you want to create another stack from template {} (y or n)?",
                ledger.keys().collect::<Vec<_>>(),
                template.display()
            );
            if !confirm(&prompt, assume_yes)? {
                return Err(Error::Aborted(String::from("Stack creation aborted")));
            }
        }

        let output = self
            .client
            .create_stack()
            .stack_name(&stack_name)
            .template_body(body)
            .set_parameters(Some(parameters.iter().map(Parameter::from).collect()))
            .capabilities(Capability::CapabilityIam)
            .send()
            .await
            .map_err(sdk_error)?;
        let stack_id = match output.stack_id() {
            Some(stack_id) => stack_id.to_string(),
            None => {
                return Err(Error::UnknownError(format!(
                    "no stack id returned for {}",
                    stack_name
                )))
            }
        };
        tracing::info!("Stack {} creation initiated: {}", stack_name, stack_id);

        let stack_ids = ledger.into_keys().chain(std::iter::once(stack_id.clone()));
        let ledger = self.refresh(stack_ids).await;
        save_ledger(&self.dir, &ledger)?;

        return Ok(stack_id);
    }

    /// Describes one stack, or every stack of the ledger which is then saved
    /// without the stacks that are gone.
    pub async fn describe(&self, stack_id: Option<&str>) -> Result<Ledger, Error> {
        match stack_id {
            Some(stack_id) => Ok(self.refresh([stack_id.to_string()]).await),
            None => {
                let ledger = self.refresh(load_ledger(&self.dir).into_keys()).await;
                save_ledger(&self.dir, &ledger)?;
                return Ok(ledger);
            }
        }
    }

    /// Returns the ids of the stacks whose deletion was initiated.
    pub async fn delete(
        &self,
        stack_id: Option<&str>,
        assume_yes: bool,
    ) -> Result<Vec<String>, Error> {
        let ledger = match stack_id {
            Some(stack_id) => self.refresh([stack_id.to_string()]).await,
            None => self.refresh(load_ledger(&self.dir).into_keys()).await,
        };
        if ledger.is_empty() {
            return Err(Error::NotFoundError(String::from("no stack left to delete")));
        }

        let mut deleted = Vec::new();
        for (stack_id, info) in &ledger {
            println!("{} {}", stack_id, info.stack_status);
            if info.is_deleting() {
                println!("Already initiated DELETE action.");
                continue;
            }
            if !confirm("Are you sure you want to delete this stack (y or n)?", assume_yes)? {
                continue;
            }

            self.client
                .delete_stack()
                .stack_name(stack_id)
                .send()
                .await
                .map_err(sdk_error)?;
            tracing::info!("Stack {} deletion initiated", info.stack_name);
            if let Err(error) = session::remove_session(&self.dir, &info.stack_name) {
                tracing::warn!("Unable to remove the session of {}: {}", info.stack_name, error);
            }
            deleted.push(stack_id.clone());
        }

        if stack_id.is_none() {
            save_ledger(&self.dir, &ledger)?;
        }
        return Ok(deleted);
    }
}

#[cfg(test)]
mod tests {
    use super::{
        confirm_with, default_stack_name, describe_lines, extract_ip, load_ledger, read_parameters,
        save_ledger, stack_name_from_id, with_ssh_location, write_parameters, Error, Ledger,
        StackInfo, StackParameter,
    };
    use chrono::{Local, TimeZone};
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;
    use std::fs;
    use std::io::Cursor;
    use std::path::Path;
    use tempfile::tempdir;

    const STACK_ID: &str = concat!(
        "arn:aws:cloudformation:ap-southeast-2:813556749890:stack/",
        "AnsibleTest-20190302115934/73f8a4f0-3c86-11e9-9b63-02181cf5d610"
    );

    fn parameter(key: &str, value: &str) -> StackParameter {
        StackParameter {
            key: key.to_string(),
            value: value.to_string(),
        }
    }

    fn stack_info(status: &str) -> StackInfo {
        StackInfo {
            stack_name: String::from("AnsibleTest-20190302115934"),
            stack_status: status.to_string(),
            stack_parameters: vec![parameter("SSHLocation", "1.2.3.4/32")],
            stack_output: BTreeMap::from([
                (String::from("ControlPublicIp"), String::from("13.54.1.2")),
                (String::from("AZ"), String::from("ap-southeast-2a")),
            ]),
        }
    }

    #[test]
    fn stack_name_is_second_arn_segment() {
        assert_eq!("AnsibleTest-20190302115934", stack_name_from_id(STACK_ID));
        assert_eq!("plain-name", stack_name_from_id("plain-name"));
    }

    #[test]
    fn default_name_from_template() {
        let now = Local.with_ymd_and_hms(2019, 3, 22, 10, 30, 5).unwrap();
        assert_eq!(
            "cfn-ansible-test-20190322103005",
            default_stack_name(Path::new("cfn_template/cfn_ansible_test.yaml"), now)
        );
    }

    #[test]
    fn extracts_first_address() {
        assert_eq!(Ok(String::from("203.0.113.7")), extract_ip("var ip = '203.0.113.7'; 10.0.0.1"));

        match extract_ip("<html>busy</html>").err().unwrap() {
            Error::IpLookup(_) => {}
            _ => panic!("Expected `IpLookup` error"),
        }
    }

    #[test]
    fn ssh_location_is_added_or_replaced() {
        assert_eq!(
            vec![parameter("KeyName", "ansible"), parameter("SSHLocation", "203.0.113.7/32")],
            with_ssh_location(vec![parameter("KeyName", "ansible")], "203.0.113.7")
        );
        assert_eq!(
            vec![parameter("SSHLocation", "203.0.113.7/32")],
            with_ssh_location(vec![parameter("SSHLocation", "0.0.0.0/0")], "203.0.113.7")
        );
    }

    #[test]
    fn parameters_use_cli_layout() {
        let dir = tempdir().unwrap();
        let parameters = vec![parameter("SSHLocation", "203.0.113.7/32")];
        let path = write_parameters(dir.path(), &parameters).unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(true, contents.contains("\"ParameterKey\": \"SSHLocation\""));
        assert_eq!(parameters, read_parameters(&path).unwrap());
    }

    #[test]
    fn parameter_file_does_not_exist() {
        let dir = tempdir().unwrap();
        let result = read_parameters(&dir.path().join("cfn-parameter.json"));

        assert_eq!(true, result.is_err());
        match result.err().unwrap() {
            Error::FileNotFound(_) => {}
            _ => panic!("Expected `FileNotFound` error"),
        }
    }

    #[test]
    fn ledger_round_trips_and_tolerates_garbage() {
        let dir = tempdir().unwrap();
        assert_eq!(Ledger::new(), load_ledger(dir.path()));

        let ledger = Ledger::from([(String::from(STACK_ID), stack_info("CREATE_COMPLETE"))]);
        save_ledger(dir.path(), &ledger).unwrap();
        assert_eq!(ledger, load_ledger(dir.path()));

        fs::write(dir.path().join("cfn-StackInfo.json"), "{not json").unwrap();
        assert_eq!(Ledger::new(), load_ledger(dir.path()));
    }

    #[test]
    fn describes_status_and_sorted_outputs() {
        assert_eq!(
            vec![
                String::from(STACK_ID),
                String::from("Stack Status: CREATE_COMPLETE"),
                String::from("AZ: ap-southeast-2a"),
                String::from("ControlPublicIp: 13.54.1.2"),
            ],
            describe_lines(STACK_ID, &stack_info("CREATE_COMPLETE"))
        );
    }

    #[test]
    fn deleting_stacks_have_no_session() {
        assert_eq!(false, stack_info("CREATE_COMPLETE").is_deleting());
        assert_eq!(true, stack_info("DELETE_IN_PROGRESS").is_deleting());
        assert_eq!(Some("13.54.1.2"), stack_info("CREATE_COMPLETE").control_ip());
    }

    #[test]
    fn only_y_confirms() {
        assert_eq!(Ok(true), confirm_with(&mut Cursor::new("y\n"), "Sure?"));
        assert_eq!(Ok(false), confirm_with(&mut Cursor::new("yes\n"), "Sure?"));
        assert_eq!(Ok(false), confirm_with(&mut Cursor::new(""), "Sure?"));
    }
}
