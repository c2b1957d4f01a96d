// ============================================================================
// layercache CLI – edit and inspect level packs from the command line
// ============================================================================
//
// Usage examples:
//   layercache --pack level.pack import backdrop.png --x 0 --y 0
//   layercache --pack level.pack import "tiles/*.png" --x 512 --y 256
//   layercache --pack level.pack render --rect 0 0 2048 1024 --zoom normal -o preview.png
//   layercache --pack level.pack fill --rect 0 0 512 256 --color "#3366ccff"
//   layercache --pack level.pack shift --dx 128 --dy -64
//   layercache --pack level.pack compile -o level.compiled.pack
//   layercache --pack level.pack info
//
// Every editing command loads the layer, applies the change and saves the
// pack again. `render` and `info` leave the pack untouched.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Instant;

use clap::{Parser, Subcommand, ValueEnum};
use image::Rgba;

use layercache::io::{prune_unreferenced, read_manifest, write_manifest};
use layercache::{BlobStore, CacheConfig, Layer, LayerManifest, PackBlobStore, TileIdGen, WorldRect, ZoomLevel};

// ============================================================================
// CLI argument definition (clap Derive)
// ============================================================================

/// Tile cache tool for level layers.
#[derive(Parser, Debug)]
#[command(
    name = "layercache",
    about = "Edit, render and inspect tiled level-layer packs",
    long_about = "Operate on a level pack: a single file holding the PNG tile images of\n\
                  one layer and the manifest that places them on the Full, Normal and\n\
                  Tiny zoom grids.\n\n\
                  Example:\n  \
                  layercache --pack level.pack import backdrop.png --x 0 --y 0\n  \
                  layercache --pack level.pack render --rect 0 0 2048 1024 --zoom tiny -o map.png"
)]
pub struct CliArgs {
    /// Level pack file. Created on the first editing command.
    #[arg(short, long, value_name = "FILE")]
    pub pack: PathBuf,

    /// Decoded-tile memory budget in megabytes (overrides the settings file).
    #[arg(long, value_name = "MB")]
    pub memory_mb: Option<usize>,

    /// Log debug output and print per-step timing.
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Paste PNG images into the layer. Several inputs are laid out left to right.
    Import {
        /// Input file(s). Glob patterns accepted (e.g. "tiles/*.png").
        #[arg(required = true, num_args = 1..)]
        input: Vec<String>,
        /// World x of the first image's left edge.
        #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
        x: i64,
        /// World y of every image's top edge.
        #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
        y: i64,
    },
    /// Render a world rectangle to a PNG file.
    Render {
        #[arg(long, num_args = 4, value_names = ["X", "Y", "W", "H"], allow_negative_numbers = true)]
        rect: Vec<i64>,
        #[arg(long, value_enum, default_value_t = ZoomArg::Full)]
        zoom: ZoomArg,
        #[arg(short, long, value_name = "FILE")]
        output: PathBuf,
    },
    /// Flood the blocks overlapping a rectangle with one color.
    Fill {
        #[arg(long, num_args = 4, value_names = ["X", "Y", "W", "H"], allow_negative_numbers = true)]
        rect: Vec<i64>,
        /// Hex color, `RRGGBB` or `RRGGBBAA`, optionally prefixed with `#`.
        #[arg(long)]
        color: String,
    },
    /// Empty every tile overlapping a rectangle.
    Clear {
        #[arg(long, num_args = 4, value_names = ["X", "Y", "W", "H"], allow_negative_numbers = true)]
        rect: Vec<i64>,
    },
    /// Move the whole layer by a whole number of blocks (128 × 64 world pixels).
    Shift {
        #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
        dx: i64,
        #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
        dy: i64,
    },
    /// Write a Normal-level-only copy of the pack.
    Compile {
        #[arg(short, long, value_name = "FILE")]
        output: PathBuf,
    },
    /// Print the pack's manifest.
    Info,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum ZoomArg {
    Full,
    Normal,
    Tiny,
}

impl From<ZoomArg> for ZoomLevel {
    fn from(z: ZoomArg) -> Self {
        match z {
            ZoomArg::Full => ZoomLevel::Full,
            ZoomArg::Normal => ZoomLevel::Normal,
            ZoomArg::Tiny => ZoomLevel::Tiny,
        }
    }
}

// ============================================================================
// Public entry point
// ============================================================================

/// Run one command and return an OS exit code.
pub fn run(args: &CliArgs, config: &CacheConfig) -> ExitCode {
    let start = Instant::now();
    match run_command(args, config) {
        Ok(()) => {
            if args.verbose {
                println!("done ({:.0}ms)", start.elapsed().as_secs_f64() * 1000.0);
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            log::error!("{}", e);
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run_command(args: &CliArgs, config: &CacheConfig) -> Result<(), String> {
    match &args.command {
        Command::Import { input, x, y } => {
            let inputs = resolve_inputs(input);
            if inputs.is_empty() {
                return Err("no input files matched the given pattern(s).".into());
            }
            let mut layer = open_layer(&args.pack, config)?;
            let mut at_x = *x;
            for (idx, path) in inputs.iter().enumerate() {
                let file_start = Instant::now();
                let img = image::open(path)
                    .map_err(|e| format!("load failed for '{}': {}", path.display(), e))?
                    .into_rgba8();
                layer
                    .insert_image(&img, at_x, *y)
                    .map_err(|e| format!("insert failed for '{}': {}", path.display(), e))?;
                if args.verbose || inputs.len() > 1 {
                    println!(
                        "[{}/{}] {} → ({}, {}) ({:.0}ms)",
                        idx + 1,
                        inputs.len(),
                        path.display(),
                        at_x,
                        y,
                        file_start.elapsed().as_secs_f64() * 1000.0
                    );
                }
                at_x += img.width() as i64;
            }
            commit(&mut layer)
        }
        Command::Render { rect, zoom, output } => {
            let rect = parse_rect(rect)?;
            let mut layer = open_layer(&args.pack, config)?;
            let img = layer
                .render_to_image(&rect, (*zoom).into())
                .map_err(|e| format!("render failed: {}", e))?;
            img.save_with_format(output, image::ImageFormat::Png)
                .map_err(|e| format!("could not write '{}': {}", output.display(), e))?;
            println!("{} ({}x{})", output.display(), img.width(), img.height());
            Ok(())
        }
        Command::Fill { rect, color } => {
            let rect = parse_rect(rect)?;
            let color = parse_color(color)?;
            let mut layer = open_layer(&args.pack, config)?;
            layer
                .fill_rect(&rect, color)
                .map_err(|e| format!("fill failed: {}", e))?;
            commit(&mut layer)
        }
        Command::Clear { rect } => {
            let rect = parse_rect(rect)?;
            let mut layer = open_layer(&args.pack, config)?;
            layer
                .clear_region(&rect)
                .map_err(|e| format!("clear failed: {}", e))?;
            commit(&mut layer)
        }
        Command::Shift { dx, dy } => {
            let mut layer = open_layer(&args.pack, config)?;
            layer.shift(*dx, *dy).map_err(|e| format!("shift failed: {}", e))?;
            commit(&mut layer)
        }
        Command::Compile { output } => {
            if !args.pack.exists() {
                return Err(format!("pack '{}' does not exist", args.pack.display()));
            }
            if output == &args.pack {
                return Err("compile output must differ from the source pack".into());
            }
            std::fs::copy(&args.pack, output)
                .map_err(|e| format!("could not copy pack to '{}': {}", output.display(), e))?;
            let mut layer = open_layer(output, config)?;
            let manifest = layer
                .save_compiled()
                .map_err(|e| format!("compile failed: {}", e))?;
            let archive = layer.archive_mut();
            prune_unreferenced(archive, &manifest).map_err(|e| format!("prune failed: {}", e))?;
            write_manifest(archive, &manifest).map_err(|e| format!("manifest write failed: {}", e))?;
            archive.flush().map_err(|e| format!("pack write failed: {}", e))?;
            println!("{}: {} Normal-level tiles", output.display(), manifest.tiles.len());
            Ok(())
        }
        Command::Info => {
            let pack = PackBlobStore::open(&args.pack)
                .map_err(|e| format!("cannot open pack '{}': {}", args.pack.display(), e))?;
            match read_manifest(&pack).map_err(|e| format!("bad manifest: {}", e))? {
                Some(manifest) => print_info(&args.pack, &manifest),
                None => println!("{}: empty pack", args.pack.display()),
            }
            Ok(())
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Load the layer stored in a pack, or start an empty one.
fn open_layer(path: &Path, config: &CacheConfig) -> Result<Layer, String> {
    let pack = PackBlobStore::open(path)
        .map_err(|e| format!("cannot open pack '{}': {}", path.display(), e))?;
    let manifest = read_manifest(&pack).map_err(|e| format!("bad manifest: {}", e))?;
    let ids = TileIdGen::new();
    let layer = match manifest {
        Some(m) => Layer::load(config, Box::new(pack), ids, &m),
        None => Layer::new(config, Box::new(pack), ids),
    };
    layer.map_err(|e| format!("cannot load layer: {}", e))
}

/// Save the layer and its manifest back into its pack.
fn commit(layer: &mut Layer) -> Result<(), String> {
    let manifest = layer.save().map_err(|e| format!("save failed: {}", e))?;
    let archive = layer.archive_mut();
    write_manifest(archive, &manifest).map_err(|e| format!("manifest write failed: {}", e))?;
    archive.flush().map_err(|e| format!("pack write failed: {}", e))?;
    log::info!("Committed {} tile records", manifest.tiles.len());
    Ok(())
}

fn print_info(path: &Path, manifest: &LayerManifest) {
    println!("{}", path.display());
    for zoom in ZoomLevel::ALL {
        let (mut named, mut solid) = (0, 0);
        for rec in manifest.records_at(zoom) {
            if rec.name.is_some() {
                named += 1;
            } else {
                solid += 1;
            }
        }
        println!("  {:<6} {} image tiles, {} solid tiles", zoom, named, solid);
    }
    println!("  {} objects", manifest.objects.len());
    println!("{}", manifest);
}

fn parse_rect(values: &[i64]) -> Result<WorldRect, String> {
    match values {
        [x, y, w, h] if *w > 0 && *h > 0 => Ok(WorldRect::new(*x, *y, *w, *h)),
        [_, _, _, _] => Err("rectangle width and height must be positive".into()),
        _ => Err("a rectangle needs exactly four values: X Y W H".into()),
    }
}

/// Parse `RRGGBB` / `RRGGBBAA` hex, with or without a leading `#`.
fn parse_color(s: &str) -> Result<Rgba<u8>, String> {
    let hex = s.trim().trim_start_matches('#');
    if !(hex.len() == 6 || hex.len() == 8) || !hex.is_ascii() {
        return Err(format!("bad color '{}': expected RRGGBB or RRGGBBAA", s));
    }
    let byte = |i: usize| {
        u8::from_str_radix(&hex[i..i + 2], 16).map_err(|_| format!("bad color '{}'", s))
    };
    let a = if hex.len() == 8 { byte(6)? } else { 255 };
    Ok(Rgba([byte(0)?, byte(2)?, byte(4)?, a]))
}

/// Expand glob patterns and literal paths into the PNG files to import, in
/// order and without duplicates. Tiles are stored as PNG, so anything else a
/// pattern picks up is skipped with a warning.
fn resolve_inputs(patterns: &[String]) -> Vec<PathBuf> {
    let mut result: Vec<PathBuf> = Vec::new();

    for pattern in patterns {
        let literal = Path::new(pattern);
        if literal.is_file() {
            push_png(literal.to_path_buf(), &mut result);
            continue;
        }

        let entries = match glob::glob(pattern) {
            Ok(entries) => entries,
            Err(e) => {
                eprintln!("warning: invalid glob '{}': {}", pattern, e);
                continue;
            }
        };
        let matches: Vec<PathBuf> = entries.flatten().filter(|p| p.is_file()).collect();
        if matches.is_empty() {
            log::warn!("Pattern '{}' matched no files", pattern);
            eprintln!("warning: pattern '{}' matched no files.", pattern);
        }
        for path in matches {
            push_png(path, &mut result);
        }
    }

    result
}

fn push_png(path: PathBuf, result: &mut Vec<PathBuf>) {
    if !is_png(&path) {
        log::warn!("Skipping non-PNG input {}", path.display());
        eprintln!("warning: skipping '{}': only PNG images can be imported.", path.display());
    } else if !result.contains(&path) {
        result.push(path);
    }
}

fn is_png(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("png"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn colors_parse_with_and_without_alpha() {
        assert_eq!(parse_color("#ff8000").unwrap(), Rgba([255, 128, 0, 255]));
        assert_eq!(parse_color("00000080").unwrap(), Rgba([0, 0, 0, 128]));
        assert!(parse_color("#fff").is_err());
        assert!(parse_color("zzzzzz").is_err());
    }

    #[test]
    fn rects_need_four_positive_extents() {
        assert_eq!(parse_rect(&[-5, 0, 10, 20]).unwrap(), WorldRect::new(-5, 0, 10, 20));
        assert!(parse_rect(&[0, 0, 0, 20]).is_err());
        assert!(parse_rect(&[0, 0, 10]).is_err());
    }

    #[test]
    fn inputs_keep_only_png_files() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.png", "a.PNG", "notes.txt"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        let pattern = dir.path().join("*").display().to_string();
        let literal = dir.path().join("b.png").display().to_string();
        let found = resolve_inputs(&[literal, pattern, dir.path().join("notes.txt").display().to_string()]);
        assert_eq!(found, vec![dir.path().join("b.png"), dir.path().join("a.PNG")]);
    }

    #[test]
    fn args_parse_subcommands() {
        let args = CliArgs::try_parse_from([
            "layercache", "--pack", "l.pack", "render", "--rect", "-128", "0", "256", "64", "--zoom", "tiny", "-o",
            "out.png",
        ])
        .unwrap();
        match args.command {
            Command::Render { rect, zoom, .. } => {
                assert_eq!(rect, vec![-128, 0, 256, 64]);
                assert_eq!(zoom, ZoomArg::Tiny);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}
