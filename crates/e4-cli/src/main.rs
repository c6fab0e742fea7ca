#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use e4_core::{ChildView, DirEntryView, Ext4Fs, FileByteDevice, MountOptions, VolumeSummary};
use std::env;
use std::io::{self, Write};
use tracing::debug;
use tracing_subscriber::EnvFilter;

const READ_CHUNK: usize = 64 * 1024;

/// Where the volume lives on the given device.
#[derive(Debug, Clone, Copy, Default)]
enum Placement {
    /// Search the MBR for the first Linux partition.
    #[default]
    FirstLinux,
    Partition(u8),
    StartLba(u64),
}

#[derive(Debug, Default)]
struct GlobalArgs {
    json: bool,
    placement: Placement,
    options: MountOptions,
}

fn main() {
    init_tracing();
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

/// Log to stderr, filtered by `E4_LOG` (or `RUST_LOG`), `warn` by default.
fn init_tracing() {
    let filter = EnvFilter::try_from_env("E4_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn run() -> Result<()> {
    let mut args = env::args().skip(1);
    let Some(command) = args.next() else {
        print_usage();
        return Ok(());
    };
    if matches!(command.as_str(), "--help" | "-h" | "help") {
        print_usage();
        return Ok(());
    }

    let (global, positional) = parse_flags(args)?;
    let mut positional = positional.into_iter();
    let Some(image) = positional.next() else {
        bail!("{command} requires an image path");
    };

    match command.as_str() {
        "inspect" => inspect(&image, &global),
        "ls" => {
            let path = positional.next().unwrap_or_else(|| "/".to_owned());
            ls(&image, &path, &global)
        }
        "lookup" => {
            let Some(path) = positional.next() else {
                bail!("lookup requires <image> <path>");
            };
            lookup(&image, &path, &global)
        }
        "cat" => {
            let Some(path) = positional.next() else {
                bail!("cat requires <image> <path>");
            };
            cat(&image, &path, &global)
        }
        _ => {
            print_usage();
            bail!("unknown command: {command}")
        }
    }
}

fn parse_flags(mut args: impl Iterator<Item = String>) -> Result<(GlobalArgs, Vec<String>)> {
    let mut global = GlobalArgs::default();
    let mut positional = Vec::new();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--json" => global.json = true,
            "--verify-checksum" => global.options.verify_superblock_checksum = true,
            "--partition" => {
                let value = flag_value(&mut args, "--partition")?;
                let slot: u8 = value
                    .parse()
                    .with_context(|| format!("invalid partition number: {value}"))?;
                if !(1..=4).contains(&slot) {
                    bail!("partition must be 1-4, got {slot}");
                }
                global.placement = Placement::Partition(slot);
            }
            "--start-lba" => {
                let value = flag_value(&mut args, "--start-lba")?;
                let lba = value
                    .parse()
                    .with_context(|| format!("invalid LBA: {value}"))?;
                global.placement = Placement::StartLba(lba);
            }
            "--cache-blocks" => {
                let value = flag_value(&mut args, "--cache-blocks")?;
                global.options.cache_capacity_blocks = value
                    .parse()
                    .with_context(|| format!("invalid cache size: {value}"))?;
            }
            "--hash" => {
                let value = flag_value(&mut args, "--hash")?;
                global.options.unsigned_hash_override = match value.as_str() {
                    "signed" => Some(false),
                    "unsigned" => Some(true),
                    "auto" => None,
                    other => bail!("--hash expects signed, unsigned or auto, got {other}"),
                };
            }
            flag if flag.starts_with("--") => bail!("unknown flag: {flag}"),
            _ => positional.push(arg),
        }
    }
    Ok((global, positional))
}

fn flag_value(args: &mut impl Iterator<Item = String>, flag: &str) -> Result<String> {
    args.next()
        .with_context(|| format!("{flag} requires a value"))
}

fn print_usage() {
    println!("e4 - read-only ext4 image inspector\n");
    println!("USAGE:");
    println!("  e4 inspect <image> [FLAGS]");
    println!("  e4 ls <image> [path] [FLAGS]");
    println!("  e4 lookup <image> <path> [FLAGS]");
    println!("  e4 cat <image> <path> [FLAGS]");
    println!();
    println!("FLAGS:");
    println!("  --json                 machine-readable output");
    println!("  --partition <1-4>      use this MBR partition");
    println!("  --start-lba <lba>      volume starts at this 512-byte sector; skip MBR probing");
    println!("  --cache-blocks <n>     buffer cache capacity in blocks (default 256)");
    println!("  --hash <mode>          directory hash signedness: signed, unsigned, auto");
    println!("  --verify-checksum      check the superblock CRC32C");
    println!();
    println!("Logging goes to stderr; set E4_LOG (e.g. E4_LOG=debug) to raise it.");
}

fn open(image: &str, global: &GlobalArgs) -> Result<Ext4Fs> {
    debug!(image, placement = ?global.placement, "opening volume");
    let fs = match global.placement {
        Placement::FirstLinux => Ext4Fs::open(image, None, &global.options),
        Placement::Partition(slot) => Ext4Fs::open(image, Some(slot), &global.options),
        Placement::StartLba(lba) => {
            let dev = FileByteDevice::open(image)
                .with_context(|| format!("failed to open {image}"))?;
            Ext4Fs::mount_at(Box::new(dev), image, lba, &global.options)
        }
    };
    fs.with_context(|| format!("failed to mount ext4 volume in {image}"))
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("serialize output")?
    );
    Ok(())
}

fn inspect(image: &str, global: &GlobalArgs) -> Result<()> {
    let fs = open(image, global)?;
    let summary = fs.summary();
    if global.json {
        return print_json(&summary);
    }
    print_summary(&summary);
    Ok(())
}

fn print_summary(s: &VolumeSummary) {
    println!(
        "device: {} (start_lba {}, sector {} bytes)",
        s.device.device_id, s.device.start_lba, s.device.sector_size
    );
    println!("volume_name: {}", s.volume_name);
    println!("uuid: {}", s.uuid);
    println!("revision: {}", s.rev_level);
    println!("block_size: {}", s.block_size);
    println!("blocks: {} ({} free)", s.blocks_count, s.free_blocks_count);
    println!("inodes: {} ({} free)", s.inodes_count, s.free_inodes_count);
    println!("blocks_per_group: {}", s.blocks_per_group);
    println!("inodes_per_group: {}", s.inodes_per_group);
    println!("inode_size: {}", s.inode_size);
    println!("group_desc_size: {}", s.group_desc_size);
    println!("first_data_block: {}", s.first_data_block);
    println!("first_ino: {}", s.first_ino);
    println!("features: {}", s.features.join(" "));
    println!(
        "hash: version {} seed {:08x}-{:08x}-{:08x}-{:08x} {}",
        s.default_hash_version,
        s.hash_seed[0],
        s.hash_seed[1],
        s.hash_seed[2],
        s.hash_seed[3],
        if s.unsigned_hash { "unsigned" } else { "signed" }
    );
    println!("groups: {}", s.groups.len());
    for g in &s.groups {
        println!(
            "  group {:>5}: inode_table {:>10}  free_blocks {:>6}  free_inodes {:>6}  dirs {:>5}",
            g.group, g.inode_table, g.free_blocks, g.free_inodes, g.used_dirs
        );
    }
}

fn ls(image: &str, path: &str, global: &GlobalArgs) -> Result<()> {
    let fs = open(image, global)?;
    let dir = fs
        .resolve_path(path)
        .with_context(|| format!("cannot resolve {path}"))?;
    let entries: Vec<DirEntryView> = fs
        .read_dir(dir.ino)
        .with_context(|| format!("cannot list {path}"))?;
    if global.json {
        return print_json(&entries);
    }
    for entry in &entries {
        let kind = format!("{:?}", entry.file_type);
        println!("{:>10}  {kind:<8}  {}", entry.ino, entry.name);
    }
    Ok(())
}

fn lookup(image: &str, path: &str, global: &GlobalArgs) -> Result<()> {
    let fs = open(image, global)?;
    let child: ChildView = fs
        .resolve_path(path)
        .with_context(|| format!("cannot resolve {path}"))?;
    if global.json {
        return print_json(&child);
    }
    println!("ino: {}", child.ino);
    println!("kind: {:?}", child.kind);
    println!("mode: {:o}", child.mode);
    println!("size: {}", child.size);
    println!("blocks_512: {}", child.blocks_512);
    println!("links: {}", child.links);
    Ok(())
}

fn cat(image: &str, path: &str, global: &GlobalArgs) -> Result<()> {
    let fs = open(image, global)?;
    let file = fs
        .resolve_path(path)
        .with_context(|| format!("cannot resolve {path}"))?;
    let stdout = io::stdout();
    let mut out = stdout.lock();
    let mut buf = vec![0_u8; READ_CHUNK];
    let mut offset = 0_u64;
    loop {
        let n = fs
            .read_data(file.ino, offset, &mut buf)
            .with_context(|| format!("read failed at offset {offset}"))?;
        if n == 0 {
            break;
        }
        out.write_all(&buf[..n]).context("write to stdout")?;
        offset += n as u64;
    }
    out.flush().context("flush stdout")?;
    Ok(())
}
