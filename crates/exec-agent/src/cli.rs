use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "exec-agent",
    version,
    about = "Host execution agent: runs controller-issued commands under supervision"
)]
pub(crate) struct Args {
    #[arg(long, default_value = "127.0.0.1:19411")]
    pub(crate) listen_addr: String,
    #[arg(long, default_value = "config.toml")]
    pub(crate) config: PathBuf,
    #[arg(long, default_value = "logs")]
    pub(crate) audit_dir: PathBuf,
    #[arg(long, default_value_t = false)]
    pub(crate) log_to_stderr: bool,
}
