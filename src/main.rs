use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::Local;
use clap::{Parser, Subcommand};

pub mod backup;
pub mod config;
pub mod ini;
pub mod inventory;
pub mod logging;
pub mod reducer;
pub mod session;
pub mod sheet;
pub mod stack;
pub mod templates;
pub mod validation;
pub mod writer;

use config::Config;
use inventory::HostsTemplate;

#[derive(Parser)]
#[command(name = "cfn-ansible-config")]
#[command(
    about = "Provision CloudFormation stacks and generate Ansible configuration",
    long_about = None
)]
struct Cli {
    /// YAML config file, built-in defaults when the default file is missing
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level or filter directives, `RUST_LOG` takes precedence
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[arg(long, global = true, default_value = "logs")]
    log_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate group_vars, host_vars and inventories from the server info
    Generate {
        #[arg(long, default_value = "config_ansible_input/truecall_server_info.xlsx")]
        server_info: PathBuf,

        #[arg(long, default_value = "config_ansible_input/production_template")]
        hosts_template: PathBuf,

        #[arg(long, default_value = "config_ansible_output")]
        output_dir: PathBuf,

        /// Previous outputs are moved here before generating
        #[arg(long, default_value = "config_ansible_archive")]
        archive_dir: PathBuf,

        /// Ansible directory written in place with `--overwrite`
        #[arg(long)]
        ansible_dir: Option<PathBuf>,

        #[arg(long, requires = "ansible_dir")]
        overwrite: bool,
    },
    /// Append the variables of the host and group templates to the server info
    UpdateSheet {
        #[arg(long, default_value = "config_ansible_input/truecall_server_info.xlsx")]
        server_info: PathBuf,

        #[arg(long, default_value = "config_ansible_input/host_template.yml")]
        host_template: PathBuf,

        #[arg(long, default_value = "config_ansible_input/TrueCall_template.yml")]
        group_template: Vec<PathBuf>,

        /// Updated sheet, written as csv
        #[arg(long)]
        output: Option<PathBuf>,

        /// Print the template variables that have a value
        #[arg(long)]
        print: bool,
    },
    /// Fill the server info with the data of server backups
    ProvisionFromBackup {
        #[arg(long, default_value = "config_ansible_input/truecall_server_info.xlsx")]
        server_info: PathBuf,

        #[arg(long)]
        backup_dir: PathBuf,

        /// Updated sheet, written as csv
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Create, describe and delete CloudFormation stacks
    Stack {
        #[command(subcommand)]
        command: StackCommands,

        #[arg(long, global = true)]
        region: Option<String>,

        /// Directory of templates, parameters and stack info
        #[arg(long, global = true)]
        dir: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum StackCommands {
    Create {
        #[arg(long, default_value = "cfn_test.yaml")]
        template: PathBuf,

        /// Defaults to the template name and a timestamp
        #[arg(long)]
        name: Option<String>,

        #[arg(long)]
        parameter_file: Option<PathBuf>,

        /// Skip confirmation prompt
        #[arg(long)]
        yes: bool,
    },
    Describe {
        #[arg(long)]
        stack_id: Option<String>,
    },
    Delete {
        #[arg(long)]
        stack_id: Option<String>,

        /// Skip confirmation prompt
        #[arg(long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let _guard = match logging::init(&cli.log_level, &cli.log_dir) {
        Ok(guard) => guard,
        Err(error) => {
            eprintln!("Error: {}", error);
            std::process::exit(1);
        }
    };

    if let Err(error) = run(cli).await {
        tracing::error!("{:#}", error);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = config::load(cli.config.as_deref())
        .context("Unable to load the config")?;
    tracing::debug!("Config: {:?}", config);

    match cli.command {
        Commands::Generate {
            server_info,
            hosts_template,
            output_dir,
            archive_dir,
            ansible_dir,
            overwrite,
        } => {
            let dest = match ansible_dir.filter(|_| overwrite) {
                Some(ansible_dir) => ansible_dir,
                None => {
                    writer::archive_output(&output_dir, &archive_dir, Local::now())
                        .context("Unable to archive the previous output")?;
                    output_dir
                }
            };
            run_generate(&config, &server_info, &hosts_template, &dest)
        }
        Commands::UpdateSheet {
            server_info,
            host_template,
            group_template,
            output,
            print,
        } => run_update_sheet(
            &config,
            &server_info,
            &host_template,
            &group_template,
            output,
            print,
        ),
        Commands::ProvisionFromBackup {
            server_info,
            backup_dir,
            output,
        } => run_provision_from_backup(&config, &server_info, &backup_dir, output),
        Commands::Stack { command, region, dir } => {
            if region.is_some() {
                config.cloudformation.region = region;
            }
            if let Some(dir) = dir {
                config.cloudformation.dir = dir;
            }
            run_stack(&config, command).await
        }
    }
}

fn run_generate(
    config: &Config,
    server_info: &Path,
    hosts_template: &Path,
    dest: &Path,
) -> anyhow::Result<()> {
    let sheet = load_sheet(config, server_info)?;
    validation::validate(&sheet)?;

    let sheet = reducer::normalise(&sheet);
    let var_files = reducer::reduce(
        &sheet,
        &config.ansible.group_name,
        &config.ansible.role_fields,
    );
    writer::write_var_files(dest, &var_files)?;

    let role_vars = writer::role_vars(&sheet, &config.ansible.role_fields);
    writer::write_role_vars(dest, &config.ansible.roles, &role_vars)?;
    writer::copy_support_files(dest, &config.ansible)?;

    let template = fs::read_to_string(hosts_template).with_context(|| {
        format!(
            "Unable to read the hosts template {}",
            hosts_template.display()
        )
    })?;
    let inventories = inventory::build(&HostsTemplate::parse(&template), &sheet.hosts());
    inventory::write_inventories(dest, &inventories)?;

    tracing::info!("Ansible configuration generated under {}", dest.display());
    return Ok(());
}

fn load_sheet(config: &Config, server_info: &Path) -> anyhow::Result<sheet::ServerInfoSheet> {
    let sheet = sheet::load(server_info, &config.ansible.sheet_name)
        .context("Unable to load the server info")?;

    return Ok(sheet);
}

fn updated_sheet_path(server_info: &Path, output: Option<PathBuf>, suffix: &str) -> PathBuf {
    if let Some(output) = output {
        return output;
    }
    let stem = server_info
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_else(|| String::from("server_info"));
    let timestamp = Local::now().format("%Y%m%d_%H%M%S");

    return server_info.with_file_name(format!("{}_{}_{}.csv", stem, suffix, timestamp));
}

fn run_update_sheet(
    config: &Config,
    server_info: &Path,
    host_template: &Path,
    group_templates: &[PathBuf],
    output: Option<PathBuf>,
    print: bool,
) -> anyhow::Result<()> {
    let vars = templates::load_templates(host_template, group_templates)?;
    if print {
        print!("{}", templates::render_vars(&vars.with_values));
    }

    let mut sheet = load_sheet(config, server_info)?;
    let appended = templates::update_sheet(&mut sheet, &vars);
    if appended.is_empty() {
        tracing::info!(
            "{} already lists every template variable",
            server_info.display()
        );
        return Ok(());
    }

    let output = updated_sheet_path(server_info, output, "updated");
    sheet.write_csv(&output)?;
    tracing::info!(
        "Appended {} rows, written to {}",
        appended.len(),
        output.display()
    );
    return Ok(());
}

fn run_provision_from_backup(
    config: &Config,
    server_info: &Path,
    backup_dir: &Path,
    output: Option<PathBuf>,
) -> anyhow::Result<()> {
    let mut sheet = load_sheet(config, server_info)?;
    let backups = backup::parse_backups(backup_dir)?;
    backup::merge_into_sheet(&mut sheet, &backups);

    let output = updated_sheet_path(server_info, output, "backup");
    sheet.write_csv(&output)?;
    tracing::info!(
        "Updated the server info with backup data of {} servers, written to {}",
        backups.len(),
        output.display()
    );
    return Ok(());
}

async fn run_stack(config: &Config, command: StackCommands) -> anyhow::Result<()> {
    let manager = stack::StackManager::new(&config.cloudformation).await;

    match command {
        StackCommands::Create {
            template,
            name,
            parameter_file,
            yes,
        } => {
            let stack_id = manager
                .create(&template, name, parameter_file.as_deref(), yes)
                .await
                .context("Stack creation failed")?;
            println!("Stack creation initiated: {}", stack_id);
        }
        StackCommands::Describe { stack_id } => {
            let ledger = manager.describe(stack_id.as_deref()).await?;
            if ledger.is_empty() {
                println!("No cloudformation stack can be found.");
            }
            for (stack_id, info) in &ledger {
                for line in stack::describe_lines(stack_id, info) {
                    println!("{}", line);
                }
            }
        }
        StackCommands::Delete { stack_id, yes } => {
            let deleted = manager.delete(stack_id.as_deref(), yes).await?;
            if deleted.is_empty() {
                println!("Stack deleting aborted.");
            } else {
                println!("Stack deleting initiated: {:?}", deleted);
            }
        }
    }

    return Ok(());
}
