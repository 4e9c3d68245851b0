use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use buildah::settings::Settings;
use buildah::{
    import_builder, list_builders, new_builder, open_builder, open_builder_any, BuilderOptions,
    ConfigUpdate, DirStore, ImportOptions,
};
use clap::{Args, Parser, Subcommand};
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "buildah", version, about = "Work with build containers")]
struct Cli {
    /// Store root directory (overrides the settings file)
    #[arg(long, global = true, value_name = "DIR")]
    storage_root: Option<PathBuf>,

    /// Settings file to read instead of the per-user storage.toml
    #[arg(long, global = true, env = "BUILDAH_CONFIG", value_name = "FILE")]
    config_file: Option<PathBuf>,

    /// Log debug output to stderr
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a build container from an image, or from `scratch`
    From(FromArgs),
    /// Turn an existing container into a build container
    Import {
        /// Name or ID of the container
        container: String,
    },
    /// Update a build container's image configuration
    Config(ConfigArgs),
    /// Mount a build container's root filesystem
    Mount(MountArgs),
    /// Print a build container's record as JSON
    Inspect(TargetArgs),
    /// List build containers
    Containers,
    /// Manage images in the store
    Images {
        #[command(subcommand)]
        command: ImagesCommand,
    },
}

#[derive(Args, Debug)]
struct FromArgs {
    /// Image to start from
    image: String,
    /// Name for the new container
    #[arg(long)]
    name: Option<String>,
    /// Pull the image if it is not present
    #[arg(long)]
    pull: bool,
    /// Pull the image even if it is present
    #[arg(long)]
    pull_always: bool,
    /// Registry prefix to try when pulling
    #[arg(long)]
    registry: Option<String>,
    /// Mount the container right away
    #[arg(long)]
    mount: bool,
    /// Create a symlink to the mount point
    #[arg(long, requires = "mount")]
    link: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct TargetArgs {
    /// Name or ID of the build container
    #[arg(long)]
    name: Option<String>,
    /// Mount point of the build container
    #[arg(long)]
    root: Option<PathBuf>,
    /// Symlink to the build container's mount point
    #[arg(long)]
    link: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct ConfigArgs {
    #[command(flatten)]
    target: TargetArgs,
    /// Image author
    #[arg(long)]
    author: Option<String>,
    /// Description of how the image was created (default "manual edits")
    #[arg(long)]
    created_by: Option<String>,
    /// Target architecture
    #[arg(long)]
    arch: Option<String>,
    /// Target operating system
    #[arg(long)]
    os: Option<String>,
    /// Default user
    #[arg(long, short = 'u')]
    user: Option<String>,
    /// Port to expose (repeatable)
    #[arg(long, short = 'p')]
    port: Vec<String>,
    /// Environment variable NAME=VALUE (repeatable)
    #[arg(long, short = 'e')]
    env: Vec<String>,
    /// Entrypoint, tokenized with shell quoting rules
    #[arg(long, allow_hyphen_values = true)]
    entrypoint: Option<String>,
    /// Default command, tokenized with shell quoting rules
    #[arg(long, allow_hyphen_values = true)]
    cmd: Option<String>,
    /// Volume to create (repeatable)
    #[arg(long, short = 'v')]
    volume: Vec<String>,
    /// Label KEY=VALUE, or KEY to remove it (repeatable)
    #[arg(long, short = 'l')]
    label: Vec<String>,
    /// Default working directory
    #[arg(long)]
    workingdir: Option<String>,
    /// Annotation KEY=VALUE, or KEY to remove it (repeatable)
    #[arg(long, short = 'a')]
    annotation: Vec<String>,
}

#[derive(Args, Debug)]
struct MountArgs {
    /// Name or ID of the build container
    #[arg(long)]
    name: String,
    /// Create a symlink to the mount point
    #[arg(long)]
    link: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum ImagesCommand {
    /// Add a root filesystem directory to the store as an image
    Add {
        name: String,
        rootfs: PathBuf,
        /// Image configuration file
        #[arg(long)]
        config: Option<PathBuf>,
        /// Image manifest file
        #[arg(long)]
        manifest: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    let settings = Settings::load(cli.config_file.as_deref())?;
    let store = settings.open_store(cli.storage_root.as_deref())?;

    match cli.command {
        Command::From(args) => cmd_from(&store, &settings, args),
        Command::Import { container } => {
            let builder = import_builder(&store, &ImportOptions { container: container.clone() })
                .with_context(|| format!("importing container '{container}'"))?;
            println!("{}", builder.container);
            Ok(())
        }
        Command::Config(args) => cmd_config(&store, args),
        Command::Mount(args) => {
            let mut builder = open_builder(&store, &args.name)
                .with_context(|| format!("reading build container '{}'", args.name))?;
            let mount_point = builder
                .mount(&store, args.link.as_deref())
                .with_context(|| format!("mounting build container '{}'", args.name))?;
            println!("{}", mount_point.display());
            Ok(())
        }
        Command::Inspect(target) => {
            let builder = open_target(&store, &target)?;
            println!("{}", serde_json::to_string_pretty(&builder)?);
            Ok(())
        }
        Command::Containers => {
            println!("{:<12}  {:<30}  IMAGE", "CONTAINER ID", "CONTAINER NAME");
            for builder in list_builders(&store)? {
                let short_id: String = builder.container_id.chars().take(12).collect();
                println!(
                    "{:<12}  {:<30}  {}",
                    short_id,
                    builder.container,
                    builder.from_image.as_deref().unwrap_or("scratch")
                );
            }
            Ok(())
        }
        Command::Images {
            command:
                ImagesCommand::Add {
                    name,
                    rootfs,
                    config,
                    manifest,
                },
        } => {
            let config = read_optional(config.as_deref())?;
            let manifest = read_optional(manifest.as_deref())?;
            let image = store
                .add_image(&name, &rootfs, &config, &manifest)
                .with_context(|| format!("adding image '{name}' from '{}'", rootfs.display()))?;
            println!("{}", image.id);
            Ok(())
        }
    }
}

fn init_tracing(debug: bool) {
    let level = if debug { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("buildah={level}")));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn cmd_from(store: &DirStore, settings: &Settings, args: FromArgs) -> Result<()> {
    let options = BuilderOptions {
        from_image: args.image.clone(),
        container: args.name.unwrap_or_default(),
        pull_if_missing: args.pull,
        pull_always: args.pull_always,
        registry: args.registry.or_else(|| settings.registry.clone()),
        mount: args.mount,
        link: args.link,
    };
    let builder = new_builder(store, &options)
        .with_context(|| format!("creating build container from '{}'", args.image))?;
    println!("{}", builder.container);
    Ok(())
}

fn cmd_config(store: &DirStore, args: ConfigArgs) -> Result<()> {
    let mut builder = open_target(store, &args.target)?;

    let update = ConfigUpdate {
        author: args.author,
        created_by: args.created_by,
        arch: args.arch,
        os: args.os,
        user: args.user,
        workingdir: args.workingdir,
        ports: non_empty(args.port),
        env: non_empty(args.env),
        entrypoint: args.entrypoint,
        cmd: args.cmd,
        volumes: non_empty(args.volume),
        labels: non_empty(args.label),
        annotations: non_empty(args.annotation),
    };
    if update.is_empty() {
        debug!(container = %builder.container, "no configuration changes given");
    }
    // Tokenize failures are logged by apply and are not fatal.
    update.apply(&mut builder);

    builder
        .save(store)
        .with_context(|| format!("saving build container '{}'", builder.container))
}

fn open_target(store: &DirStore, target: &TargetArgs) -> Result<buildah::Builder> {
    open_builder_any(
        store,
        target.name.as_deref(),
        target.root.as_deref(),
        target.link.as_deref(),
    )
    .context("reading build container")
}

fn non_empty(values: Vec<String>) -> Option<Vec<String>> {
    if values.is_empty() {
        None
    } else {
        Some(values)
    }
}

fn read_optional(path: Option<&Path>) -> Result<Vec<u8>> {
    match path {
        Some(path) => fs::read(path).with_context(|| format!("reading '{}'", path.display())),
        None => Ok(Vec::new()),
    }
}
