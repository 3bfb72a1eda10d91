use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "mssh",
    version,
    about = "Multiplexing SSH fleet controller - pre-establishes SSH connections to large target sets and shares them through ControlMaster sockets",
    long_about = None
)]
pub struct Cli {
    #[arg(short = 'a', long, help = "Use ssh-agent auth. Limits concurrency to 128")]
    pub agent: bool,

    #[arg(
        short = 'b',
        long,
        default_value_t = 2,
        help = "Number of connections to maintain to each bastion"
    )]
    pub bastion_conns: usize,

    #[arg(
        short = 'c',
        long,
        default_value_t = 65536,
        help = "Maximum number of concurrent SSH connections"
    )]
    pub concurrency: usize,

    #[arg(long, help = "Where to create the control master UNIX domain sockets [default: ~/.ssh/control]")]
    pub control_path: Option<PathBuf>,

    #[arg(short = 'd', long, help = "Turn on debugging output")]
    pub debug: bool,

    #[arg(long, help = "Run in the background; implies --server")]
    pub daemonize: bool,

    #[arg(short = 'e', long, help = "Execute a test command on each host after connecting")]
    pub execute: bool,

    #[arg(short = 'f', long, help = "JSON file describing the SSH targets")]
    pub file: Option<PathBuf>,

    #[arg(long, help = "Path of the SSH server's private host key [default: ~/.ssh/id_host]")]
    pub host_key: Option<PathBuf>,

    #[arg(
        long,
        default_value_t = 0,
        help = "Send server keep alive messages every 'n' seconds (0 disables)"
    )]
    pub keep_alive: u64,

    #[arg(short = 'k', long, help = "Private SSH key to use for client authentication [default: ~/.ssh/id_rsa]")]
    pub key: Option<PathBuf>,

    #[arg(short = 'p', long, help = "Prompt for a password for password auth fallback")]
    pub password: bool,

    #[arg(short = 's', long, help = "Run in server mode (create ControlMaster sockets)")]
    pub server: bool,

    #[arg(long, help = "Save remote execution output to the spool directory")]
    pub spool: bool,

    #[arg(long, help = "Where to save program execution output [default: ~/.ssh/spool]")]
    pub spool_dir: Option<PathBuf>,

    #[arg(long, help = "External program implementing target selection [default: ~/bin/target]")]
    pub target_cmd: Option<PathBuf>,

    #[arg(long, help = "Tee spooled output to stdout/stderr")]
    pub tee: bool,

    #[arg(long, default_value = "exit 0", help = "Test command to execute after connecting")]
    pub test_cmd: String,

    #[arg(
        short = 't',
        long,
        default_value_t = 60,
        help = "Number of seconds to wait for SSH connections to finish"
    )]
    pub timeout: u64,

    #[arg(short = 'u', long, help = "User to SSH in as [default: $USER]")]
    pub user: Option<String>,

    #[arg(short = 'v', long, help = "Enable verbose reporting")]
    pub verbose: bool,
}
