use std::path::PathBuf;

#[derive(Debug, clap::Parser)]
#[command(
    name = "coxswain",
    version,
    about = "Cron scheduler daemon for Docker container jobs"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, clap::Subcommand)]
pub enum Command {
    /// Run the scheduler daemon
    Daemon(DaemonArgs),
    /// Parse and validate a config file, then exit
    Validate(ValidateArgs),
}

#[derive(Debug, Clone, clap::Parser)]
pub struct DaemonArgs {
    /// TOML config file with [global] settings and job tables
    #[arg(long, env = "COXSWAIN_CONFIG")]
    pub config: Option<PathBuf>,
    #[arg(long, env = "LABEL_PREFIXES", default_values = ["coxswain", "ofelia", "chadburn"], value_delimiter = ',')]
    pub label_prefixes: Vec<String>,
    /// key=value label a container must carry before its job labels count
    #[arg(long, env = "CONTAINER_LABEL_SELECTOR")]
    pub container_label_selector: Option<String>,
    #[arg(
        long,
        env = "DOCKER_HOST",
        default_value = "unix:///var/run/docker.sock"
    )]
    pub docker_host: String,
    /// Run without a Docker connection; only file-defined local and
    /// compose jobs can be scheduled
    #[arg(long, env = "COXSWAIN_NO_DOCKER")]
    pub no_docker: bool,
}

#[derive(Debug, Clone, clap::Parser)]
pub struct ValidateArgs {
    #[arg(long, env = "COXSWAIN_CONFIG")]
    pub config: PathBuf,
}

impl Cli {
    /// Parse CLI from std::env and return the parsed structure.
    pub fn parse() -> Self {
        <Self as clap::Parser>::parse()
    }
}
