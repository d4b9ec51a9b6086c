use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use skfs_core::{
	hash_stream, AllocFilter, FileSystemType, HashAlgorithm, ImageFormat, ImageHandle,
	OpenOptions, Projection, StreamIdentifier, Target, WalkOptions, Whence,
};

#[derive(Parser, Debug)]
#[command(name = "skfs", version, about = "Read-only navigation of filesystems in forensic images")]
struct Cli {
	/// Path to the image file
	image: PathBuf,
	/// Image container format
	#[arg(long, default_value = "raw")]
	image_type: ImageFormat,
	/// Filesystem type (detected when omitted)
	#[arg(long, value_parser = ["xfs", "btrfs", "exfat"])]
	fs_type: Option<String>,
	#[command(subcommand)]
	command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
	/// Show image and filesystem information
	Info,
	/// List a directory
	Ls {
		#[arg(default_value = "/")]
		path: String,
		/// Include unallocated (deleted) entries
		#[arg(long)]
		unalloc: bool,
		/// Leave out allocated entries
		#[arg(long)]
		no_alloc: bool,
		/// Show identifiers, types and allocation state
		#[arg(short, long)]
		long: bool,
	},
	/// Recursively list a directory tree
	Walk {
		path: Option<String>,
		/// Start from an identifier instead of a path
		#[arg(long)]
		inode: Option<String>,
		/// Include unallocated (deleted) entries
		#[arg(long)]
		unalloc: bool,
		/// Print identifiers next to names
		#[arg(long)]
		inodes: bool,
		/// Report the `.` and `..` streams on multi-stream filesystems
		#[arg(long)]
		dots: bool,
		/// One JSON object per directory
		#[arg(long)]
		json: bool,
	},
	/// Write a stream's content to stdout
	Cat {
		path: Option<String>,
		#[arg(long)]
		inode: Option<String>,
		/// Start offset in bytes
		#[arg(long, default_value = "0")]
		offset: u64,
		/// Number of bytes (to the end when omitted)
		#[arg(long)]
		length: Option<u64>,
	},
	/// Show metadata
	Stat {
		path: Option<String>,
		#[arg(long)]
		inode: Option<String>,
		#[arg(long)]
		json: bool,
	},
	/// Show the block runs backing a stream
	Extents {
		path: Option<String>,
		#[arg(long)]
		inode: Option<String>,
	},
	/// Resolve a path to its identifier
	Resolve { path: String },
	/// Find a path naming an inode
	Reverse { id: String },
	/// List inodes that no directory entry references
	Unlinked {
		#[arg(long)]
		json: bool,
	},
	/// Hash a stream's content
	Hash {
		path: Option<String>,
		#[arg(long)]
		inode: Option<String>,
		#[arg(long, value_parser = ["md5", "sha1", "sha256", "sha512"], default_value = "sha256")]
		algo: String,
	},
}

fn target(path: Option<String>, inode: Option<String>) -> Result<Target> {
	let id = inode
		.map(|text| text.parse::<StreamIdentifier>())
		.transpose()?;
	Ok(Target::from_options(path.as_deref(), id)?)
}

fn main() -> Result<()> {
	// Initialize tracing
	tracing_subscriber::fmt().with_writer(io::stderr).init();

	let cli = Cli::parse();
	let fs_type = cli
		.fs_type
		.as_deref()
		.map(str::parse::<FileSystemType>)
		.transpose()?;
	let options = OpenOptions {
		image_format: cli.image_type,
		fs_type,
	};
	let image = ImageHandle::open(&cli.image, options)
		.with_context(|| format!("opening {}", cli.image.display()))?;

	let stdout = io::stdout();
	let mut out = stdout.lock();

	match cli.command {
		Commands::Info => {
			writeln!(out, "📋 {}", image.describe())?;
		}
		Commands::Ls { path, unalloc, no_alloc, long } => {
			let filter = AllocFilter::new(!no_alloc, unalloc);
			if long {
				for entry in image.list_entries(&path, filter)? {
					writeln!(
						out,
						"{:<16} {} {} {}",
						entry.id.to_string(),
						if entry.is_dir() { "d" } else { "-" },
						if entry.alloc.is_allocated() { " " } else { "*" },
						entry.name
					)?;
				}
			} else {
				for name in image.list(&path, filter)? {
					writeln!(out, "{}", name)?;
				}
			}
		}
		Commands::Walk { path, inode, unalloc, inodes, dots, json } => {
			let start = match (path, inode) {
				(None, None) => Target::Path("/".to_string()),
				(path, inode) => target(path, inode)?,
			};
			let walk_options = WalkOptions {
				filter: AllocFilter::new(true, unalloc),
				projection: Projection::from_flags(true, inodes || json),
				include_dots: dots,
			};

			let mut walker = image.walk(start, walk_options)?;
			for step in &mut walker {
				let step = match step {
					Ok(step) => step,
					Err(e) => {
						eprintln!("⚠️  {}", e);
						continue;
					}
				};
				if json {
					writeln!(out, "{}", serde_json::to_string(&step)?)?;
					continue;
				}

				writeln!(out, "{}", step.dir.name.as_deref().unwrap_or(""))?;
				let children = step
					.subdirs
					.iter()
					.map(|item| ("d", item))
					.chain(step.files.iter().map(|item| ("-", item)));
				for (kind, item) in children {
					let name = item.name.as_deref().unwrap_or("");
					let deleted = if item.allocated { "" } else { " (deleted)" };
					match item.id {
						Some(id) => writeln!(out, "  {} {:<16} {}{}", kind, id.to_string(), name, deleted)?,
						None => writeln!(out, "  {} {}{}", kind, name, deleted)?,
					}
				}
			}

			if !walker.skipped().is_empty() {
				eprintln!("⚠️  {} directories could not be listed:", walker.skipped().len());
				for path in walker.skipped() {
					eprintln!("   {}", path);
				}
			}
		}
		Commands::Cat { path, inode, offset, length } => {
			let mut file = image.open_file(target(path, inode)?)?;
			file.seek(offset as i64, Whence::Start)?;
			match length {
				Some(length) => io::copy(&mut file.take(length), &mut out)?,
				None => io::copy(&mut file, &mut out)?,
			};
		}
		Commands::Stat { path, inode, json } => {
			let stat = image.stat(target(path, inode)?)?;
			if json {
				writeln!(out, "{}", serde_json::to_string_pretty(&stat)?)?;
			} else {
				writeln!(out, "Inode: {}", stat.inode)?;
				writeln!(out, "Type:  {:?}", stat.file_type())?;
				writeln!(out, "Mode:  {} ({:o})", stat.mode_string(), stat.mode)?;
				writeln!(out, "Links: {}", stat.nlink)?;
				writeln!(out, "Owner: {}:{}", stat.uid, stat.gid)?;
				writeln!(out, "Size:  {}", stat.size)?;
				writeln!(out, "Atime: {}", stat.atime)?;
				writeln!(out, "Mtime: {}", stat.mtime)?;
				writeln!(out, "Ctime: {}", stat.ctime)?;
			}
		}
		Commands::Extents { path, inode } => {
			let file = image.open_file(target(path, inode)?)?;
			if file.is_resident() {
				writeln!(out, "{}: {} resident bytes", file.id(), file.size())?;
			} else {
				writeln!(out, "{}: {} bytes in {} runs", file.id(), file.size(), file.list_extents().len())?;
				for extent in file.list_extents() {
					writeln!(out, "  {:>12} +{}", extent.addr, extent.length)?;
				}
			}
		}
		Commands::Resolve { path } => {
			let id = image.resolve_stream(&path)?;
			writeln!(out, "{:#}", id)?;
		}
		Commands::Reverse { id } => {
			let id: StreamIdentifier = id.parse()?;
			writeln!(out, "{}", image.reverse_resolve(id.inode)?)?;
		}
		Commands::Unlinked { json } => {
			let spinner = ProgressBar::new_spinner();
			spinner.set_style(ProgressStyle::with_template("{spinner} {msg}")?);
			spinner.set_message(format!(
				"Scanning inodes {}-{}",
				image.first_inum(),
				image.last_inum()
			));
			spinner.enable_steady_tick(Duration::from_millis(100));
			let found = image.scan_unlinked();
			spinner.finish_and_clear();

			let found = found?;
			if json {
				writeln!(out, "{}", serde_json::to_string_pretty(&found)?)?;
			} else {
				for unlinked in &found {
					let state = if unlinked.allocated { "allocated" } else { "unallocated" };
					writeln!(out, "{:<16} {}", unlinked.id.to_string(), state)?;
				}
				eprintln!("✅ {} unlinked entries", found.len());
			}
		}
		Commands::Hash { path, inode, algo } => {
			let algorithm: HashAlgorithm = algo.parse()?;
			let mut file = image.open_file(target(path, inode)?)?;
			let digest = hash_stream(&mut file, algorithm)?;
			writeln!(out, "{}  {} ({} bytes, {})", digest.hash, digest.id, digest.size, digest.algorithm)?;
		}
	}
	Ok(())
}
