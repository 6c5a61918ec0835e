use serde::{Deserialize, Serialize};
use std::{
    fs, io,
    path::{Path, PathBuf},
};
use validator::{Validate, ValidationError};

pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum Error {
    #[error("File {0} not found")]
    FileNotFound(String),

    #[error("Parsing error: {0}")]
    ParsingError(String),

    #[error("Validation errors: {0}")]
    ValidationError(String),

    #[error("Unknown error occurred: {0}")]
    Unknown(String),
}

#[derive(Debug, Default, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct Config {
    #[validate]
    pub ansible: AnsibleConfig,

    #[validate]
    pub cloudformation: CloudFormationConfig,
}

/// Settings of the server info to Ansible compilation.
#[derive(Debug, Serialize, Deserialize, Validate)]
#[serde(default)]
#[validate(schema(function = "validate_templates_role"))]
pub struct AnsibleConfig {
    /// Name of the top level group vars file, `group_vars/<group_name>.yml`.
    #[validate(length(min = 1))]
    pub group_name: String,

    #[validate(length(min = 1))]
    pub sheet_name: String,

    /// Roles that receive `roles/<role>/vars/main.yml`.
    pub roles: Vec<String>,

    /// Basic info fields written to the role vars instead of group or host vars.
    pub role_fields: Vec<String>,

    /// Role whose `templates` directory receives the `*.j2` files.
    pub templates_role: String,

    pub default_vars_file: Option<PathBuf>,

    pub templates_dir: Option<PathBuf>,
}

impl Default for AnsibleConfig {
    fn default() -> Self {
        Self {
            group_name: String::from("TrueCall"),
            sheet_name: String::from("truecall_server_info"),
            roles: vec![String::from("tc_install"), String::from("tc_upgrade")],
            role_fields: vec![String::from("truecall_rpm"), String::from("gsrsvcs_rpm")],
            templates_role: String::from("tc_install"),
            default_vars_file: None,
            templates_dir: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct CloudFormationConfig {
    pub region: Option<String>,

    /// Directory holding templates, parameters and the stack info ledger.
    pub dir: PathBuf,

    #[validate(url)]
    pub ip_lookup_url: String,

    #[validate(custom = "validate_session_template")]
    pub session_template: Option<PathBuf>,
}

impl Default for CloudFormationConfig {
    fn default() -> Self {
        Self {
            region: None,
            dir: PathBuf::from("cfn_template"),
            ip_lookup_url: String::from("https://checkip.amazonaws.com"),
            session_template: None,
        }
    }
}

pub fn parse(path: &Path) -> Result<Config, Error> {
    let contents = match fs::read_to_string(path) {
        Ok(raw_contents) => Ok(raw_contents),
        Err(error) => match error.kind() {
            io::ErrorKind::NotFound => Err(Error::FileNotFound(path.display().to_string())),
            _ => Err(Error::Unknown(error.to_string())),
        },
    }?;

    let config: Config = match serde_yaml::from_str(&contents) {
        Ok(data) => Ok(data),
        Err(error) => Err(Error::ParsingError(error.to_string())),
    }?;

    match config.validate() {
        Ok(_) => (),
        Err(error) => return Err(Error::ValidationError(error.to_string())),
    }

    return Ok(config);
}

/// Loads an explicitly requested config file, or the default one when present.
pub fn load(path: Option<&Path>) -> Result<Config, Error> {
    match path {
        Some(path) => parse(path),
        None => match parse(Path::new(DEFAULT_CONFIG_FILE)) {
            Err(Error::FileNotFound(_)) => Ok(Config::default()),
            result => result,
        },
    }
}

fn validate_templates_role(config: &AnsibleConfig) -> Result<(), ValidationError> {
    if config.roles.is_empty() || config.roles.contains(&config.templates_role) {
        return Ok(());
    }

    return Err(ValidationError::new(
        "The templates role has to be one of the configured roles",
    ));
}

fn validate_session_template(template: &PathBuf) -> Result<(), ValidationError> {
    let file_extension = match template.extension() {
        Some(extension) => extension,
        None => {
            return Err(ValidationError::new(
                "Unable to parse the extension of the session template location",
            ))
        }
    };
    if file_extension != "xsh" {
        return Err(ValidationError::new(
            "The session template location has to end with `.xsh`",
        ));
    }

    return Ok(());
}

#[cfg(test)]
mod tests {
    use std::fs::File;
    use std::io::Write;
    use std::path::PathBuf;

    use super::parse;
    use super::Config;
    use super::Error;
    use tempfile::tempdir;

    #[test]
    fn file_does_not_exist() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("config.yaml");

        let result = parse(&file_path);
        assert_eq!(true, result.is_err());
        match result.err().unwrap() {
            Error::FileNotFound(_) => {}
            _ => panic!("Expected `FileNotFound` error"),
        }
    }

    #[test]
    fn file_wrong_format() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("config.yaml");

        let mut file = File::create(&file_path).unwrap();
        writeln!(file, "ansible: [not, a, mapping]").unwrap();

        let result = parse(&file_path);
        assert_eq!(true, result.is_err());
        match result.err().unwrap() {
            Error::ParsingError(_) => {}
            _ => panic!("Expected `ParsingError` error"),
        }
    }

    #[test]
    fn empty_group_name() {
        let mut config = Config::default();
        config.ansible.group_name = String::new();

        let dir = tempdir().unwrap();
        let file_path = dir.path().join("config.yaml");
        let mut file = File::create(&file_path).unwrap();
        writeln!(file, "{}", serde_yaml::to_string(&config).unwrap()).unwrap();

        let result = parse(&file_path);
        match result.err().unwrap() {
            Error::ValidationError(_) => {}
            _ => panic!("Expected `ValidationError` error"),
        }
    }

    #[test]
    fn templates_role_outside_roles() {
        let mut config = Config::default();
        config.ansible.templates_role = String::from("tc_missing");

        let dir = tempdir().unwrap();
        let file_path = dir.path().join("config.yaml");
        let mut file = File::create(&file_path).unwrap();
        writeln!(file, "{}", serde_yaml::to_string(&config).unwrap()).unwrap();

        match parse(&file_path).err().unwrap() {
            Error::ValidationError(_) => {}
            _ => panic!("Expected `ValidationError` error"),
        }
    }

    #[test]
    fn session_template_wrong_extension() {
        let mut config = Config::default();
        config.cloudformation.session_template = Some(PathBuf::from("template.ini"));

        let dir = tempdir().unwrap();
        let file_path = dir.path().join("config.yaml");
        let mut file = File::create(&file_path).unwrap();
        writeln!(file, "{}", serde_yaml::to_string(&config).unwrap()).unwrap();

        match parse(&file_path).err().unwrap() {
            Error::ValidationError(_) => {}
            _ => panic!("Expected `ValidationError` error"),
        }
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("config.yaml");

        let mut file = File::create(&file_path).unwrap();
        writeln!(
            file,
            "ansible:\n  group_name: Fleet\ncloudformation:\n  region: eu-west-1"
        )
        .unwrap();

        let config = parse(&file_path).unwrap();
        assert_eq!("Fleet", config.ansible.group_name);
        assert_eq!("truecall_server_info", config.ansible.sheet_name);
        assert_eq!(Some(String::from("eu-west-1")), config.cloudformation.region);
        assert_eq!(PathBuf::from("cfn_template"), config.cloudformation.dir);
    }
}
