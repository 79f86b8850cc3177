//! Command-line front-end: one volume request per invocation, JSON out.

use std::path::PathBuf;

use anyhow::{Context as _, anyhow};
use clap::{ArgAction, Args, Parser, Subcommand};
use voldrive::config::EnvSnapshot;
use voldrive::driver::{
    VolumeAttachOpts, VolumeCreateOpts, VolumeDetachOpts, VolumeInspectOpts, VolumeMountOpts,
    VolumeRemoveOpts, VolumeUnmountOpts, VolumesOpts,
};
use voldrive::executor::Isolation;
use voldrive::router::{VolumeOp, VolumeRequest};
use voldrive::runtime::{VoldriveOptions, VoldriveRuntime};

#[derive(Parser, Debug)]
#[command(name = "voldrive", version, about = "Volume orchestration", disable_help_flag = true)]
struct Cli {
    /// Config file (default: <home>/etc/voldrive/config.yml, ~/.voldrive/config.yml)
    #[arg(short = 'c', long = "config", value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level: error, warn, info, debug, trace
    #[arg(short = 'l', long = "logLevel", value_name = "LEVEL", global = true)]
    log_level: Option<String>,

    /// Host address
    #[arg(short = 'h', long, value_name = "ADDR", global = true)]
    host: Option<String>,

    /// Service to address (default: voldrive.service)
    #[arg(short = 's', long, value_name = "NAME", global = true)]
    service: Option<String>,

    /// Executor isolation: process or inprocess
    #[arg(long, value_name = "MODE", global = true)]
    isolation: Option<Isolation>,

    #[arg(long, action = ArgAction::Help, global = true)]
    help: Option<bool>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Volume operations
    #[command(subcommand)]
    Volume(VolumeCommand),
}

#[derive(Subcommand, Debug)]
enum VolumeCommand {
    /// List volumes
    #[command(alias = "list")]
    Ls {
        /// Include attachment records
        #[arg(short = 'a', long)]
        attachments: bool,
        /// Only volumes attached to this host
        #[arg(short = 'm', long)]
        mine: bool,
    },
    /// Show one volume by id or name
    Inspect {
        volume: String,
        #[arg(short = 'a', long)]
        attachments: bool,
    },
    /// Create a volume
    Create(CreateArgs),
    /// Remove a volume
    #[command(alias = "remove")]
    Rm {
        volume: String,
        #[arg(short = 'f', long)]
        force: bool,
    },
    /// Attach a volume to this host
    Attach {
        volume: String,
        #[arg(short = 'f', long)]
        force: bool,
    },
    /// Detach a volume from this host
    Detach {
        volume: String,
        #[arg(short = 'f', long)]
        force: bool,
    },
    /// Attach if needed and mount a volume
    Mount {
        volume: String,
        /// Mount point (default: chosen by the driver)
        #[arg(short = 't', long, value_name = "PATH")]
        target: Option<PathBuf>,
        #[arg(long)]
        read_only: bool,
    },
    /// Unmount a volume
    Unmount {
        volume: String,
        #[arg(short = 'f', long)]
        force: bool,
    },
    /// Print a volume's mount point
    Path { volume: String },
}

#[derive(Args, Debug)]
struct CreateArgs {
    name: String,
    #[arg(long, value_name = "GB")]
    size: Option<u64>,
    #[arg(long = "type", value_name = "TYPE")]
    volume_type: Option<String>,
    #[arg(long)]
    iops: Option<u64>,
    #[arg(long = "availabilityZone", value_name = "ZONE")]
    availability_zone: Option<String>,
    #[arg(long)]
    encrypted: bool,
}

impl VolumeCommand {
    fn into_op(self) -> VolumeOp {
        match self {
            VolumeCommand::Ls { attachments, mine } => VolumeOp::Volumes {
                opts: VolumesOpts { attachments, mine },
            },
            VolumeCommand::Inspect {
                volume,
                attachments,
            } => VolumeOp::Inspect {
                volume,
                opts: VolumeInspectOpts { attachments },
            },
            VolumeCommand::Create(args) => VolumeOp::Create {
                name: args.name,
                opts: VolumeCreateOpts {
                    size_gb: args.size,
                    volume_type: args.volume_type,
                    iops: args.iops,
                    availability_zone: args.availability_zone,
                    encrypted: args.encrypted,
                    ..Default::default()
                },
            },
            VolumeCommand::Rm { volume, force } => VolumeOp::Remove {
                volume,
                opts: VolumeRemoveOpts { force },
            },
            VolumeCommand::Attach { volume, force } => VolumeOp::Attach {
                volume,
                opts: VolumeAttachOpts {
                    force,
                    ..Default::default()
                },
            },
            VolumeCommand::Detach { volume, force } => VolumeOp::Detach {
                volume,
                opts: VolumeDetachOpts { force },
            },
            VolumeCommand::Mount {
                volume,
                target,
                read_only,
            } => VolumeOp::Mount {
                volume,
                opts: VolumeMountOpts { target, read_only },
            },
            VolumeCommand::Unmount { volume, force } => VolumeOp::Unmount {
                volume,
                opts: VolumeUnmountOpts { force },
            },
            VolumeCommand::Path { volume } => VolumeOp::Path { volume },
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let options = VoldriveOptions {
        config_file: cli.config,
        log_level: cli.log_level,
        host: cli.host,
        service: cli.service,
        isolation: cli.isolation,
        ..Default::default()
    };
    let runtime = VoldriveRuntime::new(options, EnvSnapshot::from_process())
        .context("failed to start voldrive")?;

    let service = runtime
        .default_service()
        .ok_or_else(|| anyhow!("no service given; pass -s or set voldrive.service"))?;

    let Command::Volume(command) = cli.command;
    let op = command.into_op();
    let operation = op.name();

    let reply = runtime
        .router()
        .handle(&runtime.request_context(), VolumeRequest::new(service, op))
        .await
        .with_context(|| format!("volume {} failed", operation))?;

    println!("{}", serde_json::to_string_pretty(&reply)?);
    Ok(())
}
