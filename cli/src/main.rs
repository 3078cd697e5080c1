use anyhow::Context;
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::{Path, PathBuf};
use x360_core::{BlockDevice, DeviceOptions, FileDevice};
use x360_filesystems::profile::{decrypt_account_with, AccountKey, SettingValue};
use x360_filesystems::{detect_device, StfsTree, Xdbf, XtafOptions, XtafTree};

mod report;

#[derive(Parser)]
#[command(name = "x360")]
#[command(about = "Read Xbox 360 drive images, STFS containers and profile data", long_about = None)]
struct Cli {
    /// Raise log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Print JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    /// Serialize image reads behind a lock
    #[arg(long, global = true)]
    threadsafe: bool,

    /// XTAF partition offset (decimal or 0x-prefixed hex), skipping detection
    #[arg(long, global = true, value_parser = parse_offset)]
    offset: Option<u64>,

    /// Expand the whole XTAF directory tree up front
    #[arg(long, global = true)]
    precache: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Identify the format of each file
    Identify {
        files: Vec<PathBuf>,
    },
    /// Recursively list an XTAF image
    Ls {
        image: PathBuf,
        #[arg(default_value = "/")]
        path: String,
    },
    /// Write a file from an XTAF image to stdout
    Cat {
        image: PathBuf,
        path: String,
    },
    /// Work with an STFS container
    Stfs {
        /// A standalone container, or an XTAF image when --inner is given
        image: PathBuf,
        /// Path of the container inside the XTAF image
        #[arg(long)]
        inner: Option<String>,
        #[command(subcommand)]
        action: StfsAction,
    },
    /// Summarise a GPD file
    Gpd {
        file: PathBuf,
    },
    /// Decode an account record
    Account {
        file: PathBuf,
        /// Decrypt with the development kit key
        #[arg(long)]
        devkit: bool,
    },
    /// Walk an image and describe every container, account and GPD on it
    Report {
        image: PathBuf,
    },
}

#[derive(Subcommand)]
enum StfsAction {
    /// List the header summary and every path
    Ls,
    /// Write one file to stdout
    Cat {
        path: String,
    },
    /// Copy every file into a directory
    Extract {
        dest: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let device_options = DeviceOptions {
        threadsafe: cli.threadsafe,
    };
    let xtaf_options = XtafOptions {
        partition_offset: cli.offset,
        precache: cli.precache,
    };

    match &cli.command {
        Commands::Identify { files } => {
            let mut results = Vec::new();
            for file in files {
                let kind = FileDevice::open(file, device_options)
                    .and_then(|device| detect_device(&device))
                    .with_context(|| format!("identifying {}", file.display()))?;
                results.push((file.display().to_string(), kind));
            }
            if cli.json {
                print_json(&results)?;
            } else {
                for (file, kind) in results {
                    println!("{}: {}", file, kind);
                }
            }
        }
        Commands::Ls { image, path } => {
            let tree = open_xtaf(image, device_options, xtaf_options)?;
            let mut entries = Vec::new();
            for entry_path in tree.walk(path)? {
                entries.push(tree.stat(&entry_path)?);
            }

            if cli.json {
                print_json(&entries)?;
            } else {
                for entry in &entries {
                    let modified = entry
                        .record
                        .as_ref()
                        .and_then(|r| r.modified())
                        .map(|t| t.to_string())
                        .unwrap_or_else(|| "-".to_string());
                    let suffix = if entry.is_directory && entry.path != "/" { "/" } else { "" };
                    println!("{:>12}  {:19}  {}{}", entry.size(), modified, entry.path, suffix);
                }
            }
            print_anomalies(&tree.anomalies());
        }
        Commands::Cat { image, path } => {
            let tree = open_xtaf(image, device_options, xtaf_options)?;
            let data = tree.read_file(path)?;
            std::io::stdout().write_all(&data)?;
        }
        Commands::Stfs { image, inner, action } => match inner {
            Some(inner) => {
                let tree = open_xtaf(image, device_options, xtaf_options)?;
                let device = tree.open_file(inner)?;
                let stfs = StfsTree::open(device).with_context(|| format!("opening container {}", inner))?;
                run_stfs(&stfs, action, cli.json)?;
            }
            None => {
                let device = FileDevice::open(image, device_options)
                    .with_context(|| format!("opening {}", image.display()))?;
                let stfs = StfsTree::open(device).with_context(|| format!("opening container {}", image.display()))?;
                run_stfs(&stfs, action, cli.json)?;
            }
        },
        Commands::Gpd { file } => {
            let data = std::fs::read(file).with_context(|| format!("reading {}", file.display()))?;
            let gpd = Xdbf::parse(&data)?;
            if cli.json {
                print_json(&gpd)?;
            } else {
                print_gpd(&gpd);
            }
        }
        Commands::Account { file, devkit } => {
            let data = std::fs::read(file).with_context(|| format!("reading {}", file.display()))?;
            let key = if *devkit { AccountKey::Devkit } else { AccountKey::Retail };
            let info = decrypt_account_with(&data, key)?;
            if cli.json {
                print_json(&info)?;
            } else {
                println!("Gamertag:     {}", info.gamertag);
                println!("Live account: {}", if info.live_account { "Yes" } else { "No" });
                if let Some(xuid) = &info.xuid {
                    println!("XUID:         {}", xuid);
                }
                println!("Membership:   {:?}", info.membership);
                println!("Console type: {}", info.console_type);
                match &info.passcode {
                    Some(buttons) => println!("Passcode:     {}", buttons.join(", ")),
                    None => println!("Passcode:     (unrecognised)"),
                }
            }
        }
        Commands::Report { image } => {
            let tree = open_xtaf(image, device_options, xtaf_options)?;
            let report = report::build(&tree)?;
            if cli.json {
                print_json(&report)?;
            } else {
                report::print(&report);
            }
        }
    }

    Ok(())
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

fn parse_offset(value: &str) -> Result<u64, String> {
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => value.parse(),
    };
    parsed.map_err(|e| format!("invalid offset '{}': {}", value, e))
}

fn open_xtaf(image: &Path, device_options: DeviceOptions, options: XtafOptions) -> anyhow::Result<XtafTree<FileDevice>> {
    let device = FileDevice::open(image, device_options).with_context(|| format!("opening {}", image.display()))?;
    XtafTree::open_with(device, options).with_context(|| format!("no XTAF partition in {}", image.display()))
}

fn run_stfs<D: BlockDevice>(stfs: &StfsTree<D>, action: &StfsAction, json: bool) -> anyhow::Result<()> {
    match action {
        StfsAction::Ls => {
            if json {
                let entries: Vec<_> = stfs.paths().iter().filter_map(|p| stfs.get(p)).collect();
                print_json(&serde_json::json!({
                    "header": stfs.header(),
                    "entries": entries,
                    "anomalies": stfs.anomalies(),
                }))?;
                return Ok(());
            }

            let header = stfs.header();
            println!("Magic:        {}", header.magic.as_str());
            println!("Display name: {}", header.display_name());
            println!("Title:        {} ({:08X})", header.title_name(), header.title_id);
            println!("Content type: {:?}", header.content_kind());
            println!();
            for path in stfs.paths() {
                if let Some(entry) = stfs.get(&path) {
                    let suffix = if entry.is_directory() { "/" } else { "" };
                    println!("{:>12}  {}{}", entry.size(), path, suffix);
                }
            }
            print_anomalies(&stfs.anomalies());
        }
        StfsAction::Cat { path } => {
            let data = stfs.read_file(path)?;
            std::io::stdout().write_all(&data)?;
        }
        StfsAction::Extract { dest } => {
            let mut written = 0;
            for path in stfs.paths() {
                let Some(target) = extract_target(dest, &path) else {
                    log::warn!("Skipping unsafe path {}", path);
                    continue;
                };
                let entry = stfs.stat(&path)?;
                if entry.is_directory() {
                    std::fs::create_dir_all(&target)?;
                    continue;
                }
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                match stfs.read_file(&path) {
                    Ok(data) => {
                        std::fs::write(&target, data).with_context(|| format!("writing {}", target.display()))?;
                        written += 1;
                    }
                    Err(e) => eprintln!("Skipping {}: {}", path, e),
                }
            }
            println!("Extracted {} files to {}", written, dest.display());
            print_anomalies(&stfs.anomalies());
        }
    }
    Ok(())
}

/// Host path for a container path, `None` when a component would escape `dest`
fn extract_target(dest: &Path, path: &str) -> Option<PathBuf> {
    let mut target = dest.to_path_buf();
    for component in path.split('/').filter(|c| !c.is_empty()) {
        if component == "." || component == ".." || component.contains('\\') {
            return None;
        }
        target.push(component);
    }
    Some(target)
}

fn print_gpd(gpd: &Xdbf) {
    println!(
        "{} GPD, version {:#x}, {} entries",
        if gpd.big_endian { "Big-endian" } else { "Little-endian" },
        gpd.version,
        gpd.entries.len()
    );

    if !gpd.titles.is_empty() {
        println!("\nTitles ({} gamerscore):", gpd.gamerscore());
        for title in gpd.titles.values() {
            println!(
                "  {:08X} {} - {}/{} achievements, {}/{} gamerscore",
                title.title_id,
                title.name,
                title.achievements_unlocked,
                title.achievement_count,
                title.gamerscore_unlocked,
                title.gamerscore_total
            );
        }
    }

    if !gpd.achievements.is_empty() {
        println!("\nAchievements:");
        for achievement in gpd.achievements.values() {
            let unlocked = achievement
                .unlocked_at()
                .map(|t| t.to_string())
                .unwrap_or_else(|| "locked".to_string());
            println!("  [{:>3}] {} ({})", achievement.gamerscore, achievement.name, unlocked);
        }
    }

    if !gpd.settings.is_empty() {
        println!("\nSettings:");
        for setting in gpd.settings.values() {
            let value = match &setting.value {
                SettingValue::Binary(bytes) | SettingValue::Null(bytes) => format!("{} bytes", bytes.len()),
                other => format!("{:?}", other),
            };
            println!("  {:08X} {}", setting.setting_id, value);
        }
    }

    print_anomalies(&gpd.anomalies);
}

fn print_anomalies(anomalies: &[x360_core::Anomaly]) {
    if anomalies.is_empty() {
        return;
    }
    eprintln!("\n{} anomalies:", anomalies.len());
    for anomaly in anomalies {
        eprintln!("  {}", anomaly);
    }
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
