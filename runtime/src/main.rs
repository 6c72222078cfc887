//! Wintermute game runtime executable.
//!
//! Mounts the project's packages and game directory, boots the engine,
//! and drives the frame loop until a script (or the player) asks to quit.
//! The renderer, audio, and input collaborators are attached here when a
//! platform backend is linked in; without one the loop still runs game
//! logic at full fidelity.

use std::{
	path::{Path, PathBuf},
	process::ExitCode,
	time::{Duration, Instant},
};

use clap::Parser;
use indoc::printdoc;
use log::{error, info, warn};
use wintermute::Engine;

/// Frame budget for the logic loop.
const FRAME_MS: u64 = 16;

#[must_use]
fn version_string() -> String {
	format!("Wintermute Runtime {}", env!("CARGO_PKG_VERSION"))
}

#[derive(Parser, Debug)]
#[command(version, about = "Runtime for Wintermute adventure games")]
struct Clap {
	/// Path to the project definition file; its directory becomes the
	/// game directory.
	project: PathBuf,

	/// Print licensing information and exit.
	#[arg(short = 'A', long = "about")]
	about: bool,

	#[arg(long, conflicts_with = "fullscreen")]
	windowed: bool,

	#[arg(long)]
	fullscreen: bool,

	#[arg(long, default_value_t = 800)]
	width: u32,

	#[arg(long, default_value_t = 600)]
	height: u32,

	/// One of: error, warn, info, debug, trace.
	#[arg(long, default_value = "info")]
	log: String,

	/// A save file to restore immediately after boot.
	#[arg(long)]
	save: Option<PathBuf>,
}

fn main() -> ExitCode {
	let args = Clap::parse();

	if args.about {
		printdoc! {"
			Wintermute - a runtime for 2D/3D point-and-click adventure games.

			This program comes with ABSOLUTELY NO WARRANTY.

			This is free software, and you are welcome to redistribute it under
			certain conditions. See the license document that comes with your
			installation."
		};

		return ExitCode::SUCCESS;
	}

	env_logger::Builder::new()
		.parse_filters(&args.log)
		.format_timestamp_millis()
		.init();

	info!("{}", version_string());
	info!("{}", wintermute::version_string());

	let mut engine = match startup(&args) {
		Ok(engine) => engine,
		Err(err) => {
			error!("Startup failed: {err}");
			return ExitCode::from(1);
		}
	};

	match run_loop(&mut engine) {
		Ok(()) => ExitCode::SUCCESS,
		Err(err) => {
			error!("Fatal runtime error: {err}");
			ExitCode::from(2)
		}
	}
}

fn startup(args: &Clap) -> Result<Engine, Box<dyn std::error::Error>> {
	let project = args
		.project
		.file_name()
		.ok_or("project path has no file name")?
		.to_string_lossy()
		.into_owned();

	let game_dir = args
		.project
		.parent()
		.filter(|p| !p.as_os_str().is_empty())
		.unwrap_or(Path::new("."))
		.to_path_buf();

	let mut engine = Engine::new();

	// Packages shadow loose files; among themselves, header priority
	// decides.
	for package in packages_in(&game_dir)? {
		match engine.mount_package(&package, None) {
			Ok(_) => {}
			Err(err) => warn!("Skipping package `{}`: {err}", package.display()),
		}
	}

	engine.mount_dir(&game_dir)?;

	// Display settings belong to the renderer collaborator; record them
	// for whichever backend attaches.
	let mode = if args.fullscreen {
		"fullscreen"
	} else {
		"windowed"
	};

	info!("Display: {}x{} {mode}.", args.width, args.height);
	info!("Save directory: {}", save_dir(&game_dir).display());

	engine.boot(&project)?;

	if let Some(save) = &args.save {
		let bytes = std::fs::read(save)?;
		let header = engine.load_game(&bytes)?;
		info!("Restored save `{}`.", header.name);
	}

	Ok(engine)
}

/// `WME_SAVEDIR` overrides the platform default next to the game data.
#[must_use]
fn save_dir(game_dir: &Path) -> PathBuf {
	match std::env::var_os("WME_SAVEDIR") {
		Some(dir) => PathBuf::from(dir),
		None => game_dir.join("saves"),
	}
}

fn packages_in(game_dir: &Path) -> Result<Vec<PathBuf>, std::io::Error> {
	let mut packages = vec![];

	for entry in std::fs::read_dir(game_dir)? {
		let entry = entry?;
		let path = entry.path();

		let is_package = path
			.extension()
			.map_or(false, |ext| ext.eq_ignore_ascii_case("dcp"));

		if is_package {
			packages.push(path);
		}
	}

	// Deterministic mount order regardless of directory enumeration.
	packages.sort();
	Ok(packages)
}

fn run_loop(engine: &mut Engine) -> Result<(), Box<dyn std::error::Error>> {
	let mut last = Instant::now();

	while !engine.quit_requested() {
		// Input capture goes here once a platform backend is attached.

		let now = Instant::now();
		let dt = now.duration_since(last).as_millis() as u64;
		last = now;

		engine.frame(dt.clamp(1, 250));

		// Render + present go here; logic paces itself regardless.
		let elapsed = last.elapsed();

		if let Some(rest) = Duration::from_millis(FRAME_MS).checked_sub(elapsed) {
			std::thread::sleep(rest);
		}
	}

	info!("Quit requested; shutting down after {} ms.", engine.clock_ms());
	Ok(())
}
