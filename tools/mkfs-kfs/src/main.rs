//! mkfs-kfs -- Create and populate CobaltOS kfs disk images
//!
//! This is a host-side tool that packs a directory of files into a raw
//! disk image in the layout the kernel's kfs driver expects:
//!
//! ```text
//! Block 0:            boot block: dentry/inode/data counts, 52 reserved
//!                     bytes, 63 directory entries of
//!                     {32-byte name, u32 inode, 28 reserved}
//! Blocks 1..=N:       one inode per file: {u32 byte length,
//!                     1023 u32 data-block indices (data-region relative)}
//! Blocks N+1..:       data blocks
//! ```
//!
//! Usage:
//!   mkfs-kfs --output <path> --populate <dir> [--size <MB>]

use std::env;
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

const BLOCK_SIZE: usize = 4096;
const NAME_LEN: usize = 32;
const DIR_ENTRY_SIZE: usize = 64;
const DIR_ENTRY_COUNT: usize = 63;
const BOOT_HEADER_SIZE: usize = 64;
const DATA_BLOCKS_PER_INODE: usize = 1023;

struct Options {
    output: PathBuf,
    populate: PathBuf,
    size_mb: Option<usize>,
}

fn parse_args() -> Result<Options, String> {
    let mut output = None;
    let mut populate = None;
    let mut size_mb = None;

    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--output" | "-o" => {
                output = Some(PathBuf::from(
                    args.next().ok_or("--output needs a path")?,
                ));
            }
            "--populate" | "-p" => {
                populate = Some(PathBuf::from(
                    args.next().ok_or("--populate needs a directory")?,
                ));
            }
            "--size" | "-s" => {
                let mb = args.next().ok_or("--size needs a value in MB")?;
                size_mb = Some(mb.parse().map_err(|_| format!("bad size: {mb}"))?);
            }
            other => return Err(format!("unknown argument: {other}")),
        }
    }

    Ok(Options {
        output: output.ok_or("--output is required")?,
        populate: populate.ok_or("--populate is required")?,
        size_mb,
    })
}

fn collect_files(dir: &PathBuf) -> Result<Vec<(String, Vec<u8>)>, String> {
    let mut files = Vec::new();
    let entries = fs::read_dir(dir).map_err(|e| format!("{}: {e}", dir.display()))?;
    for entry in entries {
        let entry = entry.map_err(|e| e.to_string())?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let name = entry.file_name().into_string().map_err(|_| {
            format!("{}: file name is not valid UTF-8", path.display())
        })?;
        if name.len() > NAME_LEN {
            return Err(format!("{name}: name longer than {NAME_LEN} bytes"));
        }
        let data = fs::read(&path).map_err(|e| format!("{}: {e}", path.display()))?;
        let blocks = data.len().div_ceil(BLOCK_SIZE);
        if blocks > DATA_BLOCKS_PER_INODE {
            return Err(format!("{name}: file exceeds {DATA_BLOCKS_PER_INODE} blocks"));
        }
        files.push((name, data));
    }
    files.sort_by(|a, b| a.0.cmp(&b.0));
    if files.len() > DIR_ENTRY_COUNT {
        return Err(format!(
            "{} files, but the directory holds at most {DIR_ENTRY_COUNT}",
            files.len()
        ));
    }
    Ok(files)
}

fn build_image(files: &[(String, Vec<u8>)]) -> Vec<u8> {
    let num_inodes = files.len();
    let total_data: usize = files
        .iter()
        .map(|(_, data)| data.len().div_ceil(BLOCK_SIZE))
        .sum();
    let blocks = 1 + num_inodes + total_data;
    let mut image = vec![0u8; blocks * BLOCK_SIZE];

    // Boot block: counts, reserved, directory entries.
    image[0..4].copy_from_slice(&(files.len() as u32).to_le_bytes());
    image[4..8].copy_from_slice(&(num_inodes as u32).to_le_bytes());
    image[8..12].copy_from_slice(&(total_data as u32).to_le_bytes());
    for (i, (name, _)) in files.iter().enumerate() {
        let base = BOOT_HEADER_SIZE + i * DIR_ENTRY_SIZE;
        image[base..base + name.len()].copy_from_slice(name.as_bytes());
        image[base + NAME_LEN..base + NAME_LEN + 4].copy_from_slice(&(i as u32).to_le_bytes());
    }

    // Inode blocks, then data blocks; indices are data-region relative.
    let mut next_data = 0u32;
    for (i, (_, data)) in files.iter().enumerate() {
        let inode_base = (1 + i) * BLOCK_SIZE;
        image[inode_base..inode_base + 4].copy_from_slice(&(data.len() as u32).to_le_bytes());
        for (j, chunk) in data.chunks(BLOCK_SIZE).enumerate() {
            let slot = inode_base + 4 + 4 * j;
            image[slot..slot + 4].copy_from_slice(&next_data.to_le_bytes());
            let abs = (1 + num_inodes + next_data as usize) * BLOCK_SIZE;
            image[abs..abs + chunk.len()].copy_from_slice(chunk);
            next_data += 1;
        }
    }
    image
}

fn run() -> Result<(), String> {
    let opts = parse_args()?;
    let files = collect_files(&opts.populate)?;
    let mut image = build_image(&files);

    // Pad to the requested device size so QEMU sees a fixed-capacity disk.
    if let Some(mb) = opts.size_mb {
        let target = mb * 1024 * 1024;
        if image.len() > target {
            return Err(format!(
                "image needs {} bytes but --size caps it at {target}",
                image.len()
            ));
        }
        image.resize(target, 0);
    }

    fs::write(&opts.output, &image).map_err(|e| format!("{}: {e}", opts.output.display()))?;
    println!(
        "{}: {} files, {} bytes",
        opts.output.display(),
        files.len(),
        image.len()
    );
    Ok(())
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("mkfs-kfs: {err}");
            ExitCode::FAILURE
        }
    }
}
