use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use log::{error, info};
use simplelog::{Config, LevelFilter, WriteLogger};

use imagemaps::host::{HeadlessHost, TickQueue};
use imagemaps::panic_handler;
use imagemaps::settings::{self, Settings};
use imagemaps::{
    ImageMap, ImageSource, MapRequest, MapService, OwnerId, ScalingPolicy, SurfaceId,
    TransformHandle,
};

/// Upper bound for one render or update, main thread hand-offs included
const TRANSFORM_TIMEOUT: Duration = Duration::from_secs(300);

/// Maintain the image map catalogue without a running server
#[derive(Parser)]
#[command(name = "imagemaps", version, about)]
struct CliArgs {
    /// Data directory holding config.yaml, maps/ and images/
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Log level written to imagemaps.log
    #[arg(long, global = true, default_value = "info")]
    log_level: LevelFilter,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List maps of one owner, or of every owner
    List {
        #[arg(long)]
        owner: Option<OwnerId>,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Render an image into a new map
    Render {
        owner: OwnerId,

        /// URL or file path of the image
        source: String,

        /// Wanted map name, made unique when taken
        #[arg(long)]
        name: Option<String>,

        #[command(flatten)]
        layout: LayoutArgs,
    },

    /// Render an image onto the surfaces of an existing map
    Update {
        owner: OwnerId,
        name: String,
        source: String,

        #[command(flatten)]
        layout: LayoutArgs,
    },

    /// Delete a map and its tile files
    Delete { owner: OwnerId, name: String },

    /// Rename a map
    Rename {
        owner: OwnerId,
        old: String,
        new: String,
    },

    /// Show the map owning a surface
    Info { surface: SurfaceId },

    /// Load every saved tile and paint it, reporting unreadable ones
    Check,
}

#[derive(clap::Args)]
struct LayoutArgs {
    /// Tile columns, 0 to derive from the image
    #[arg(long, default_value_t = 0)]
    columns: u32,

    /// Tile rows, 0 to derive from the image
    #[arg(long, default_value_t = 0)]
    rows: u32,

    /// none, contained, stretched or covered
    #[arg(long, default_value = "none")]
    scaling: ScalingPolicy,
}

impl LayoutArgs {
    fn apply(&self, request: MapRequest) -> MapRequest {
        let request = request.with_policy(self.scaling);
        if self.columns == 0 && self.rows == 0 {
            request
        } else {
            request.with_grid(self.columns, self.rows)
        }
    }
}

/// Service over a headless host whose main thread is the CLI thread
struct Session {
    queue: TickQueue,
    service: MapService,
}

impl Session {
    fn open(data_dir: PathBuf) -> Result<Self> {
        let settings = Settings::load_or_create(&settings::settings_path(&data_dir));
        let queue = TickQueue::new();
        let host = Arc::new(HeadlessHost::new());
        let service = MapService::new(
            data_dir.clone(),
            settings,
            host.clone(),
            Arc::new(queue.handle()),
        )
        .with_context(|| format!("Failed to open map catalogue in {}", data_dir.display()))?;

        // Surfaces of earlier sessions stay taken.
        let registry = service.registry();
        let known = registry
            .loaded_stores()
            .iter()
            .flat_map(|store| store.maps())
            .flat_map(|map| map.surfaces().to_vec())
            .collect::<Vec<_>>();
        host.adopt_surfaces(known);

        Ok(Self { queue, service })
    }

    fn wait<T: Send + 'static>(&self, handle: TransformHandle<T>) -> Result<T> {
        if !self
            .queue
            .pump_until(TRANSFORM_TIMEOUT, || handle.is_finished())
        {
            bail!("Gave up after {}s", TRANSFORM_TIMEOUT.as_secs());
        }
        self.queue.run_pending();
        Ok(handle.wait()?)
    }

    fn map(&self, owner: OwnerId, name: &str) -> Result<ImageMap> {
        self.service
            .get_map(owner, name)
            .with_context(|| format!("{owner} has no map named '{name}'"))
    }
}

fn print_maps(maps: &[ImageMap], json: bool) -> Result<()> {
    if json {
        let entries: Vec<_> = maps
            .iter()
            .map(|map| {
                serde_json::json!({
                    "owner": map.owner,
                    "id": map.id,
                    "name": map.display_name,
                    "surfaces": map.surfaces(),
                    "grid": map.grid().map(|g| g.to_string()),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    for map in maps {
        let surfaces: Vec<String> = map.surfaces().iter().map(ToString::to_string).collect();
        println!(
            "{}  {:<24} {:<20} [{}]",
            map.owner,
            map.id,
            map.describe(),
            surfaces.join(", ")
        );
    }
    Ok(())
}

fn run(args: CliArgs, data_dir: PathBuf) -> Result<()> {
    let mut session = Session::open(data_dir)?;

    match args.command {
        Command::List { owner, json } => {
            let owners = match owner {
                Some(owner) => vec![owner],
                None => session.service.registry().owners(),
            };
            let maps: Vec<ImageMap> = owners
                .into_iter()
                .flat_map(|owner| session.service.get_maps(owner))
                .collect();
            print_maps(&maps, json)?;
        }
        Command::Render {
            owner,
            source,
            name,
            layout,
        } => {
            let source = ImageSource::parse(&source)?;
            let mut request = layout.apply(MapRequest::new(source));
            if let Some(name) = name {
                request = request.named(name);
            }
            let map = session.wait(session.service.create_map(owner, request))?;
            println!("Created '{}' ({})", map.id, map.describe());
        }
        Command::Update {
            owner,
            name,
            source,
            layout,
        } => {
            let map = session.map(owner, &name)?;
            let request = layout.apply(MapRequest::new(ImageSource::parse(&source)?));
            let map = session.wait(session.service.update_map(&map, request))?;
            println!("Updated '{}' ({})", map.id, map.describe());
        }
        Command::Delete { owner, name } => {
            let map = session.map(owner, &name)?;
            session.service.delete_map(&map)?;
            session.queue.run_pending();
            println!("Deleted '{}'", map.id);
        }
        Command::Rename { owner, old, new } => {
            let map = session.service.rename_map(owner, &old, &new)?;
            println!("Renamed '{old}' to '{}'", map.id);
        }
        Command::Info { surface } => match session.service.find_by_surface_id(surface) {
            Some(map) => {
                let tile = session.service.tiles().path_for(surface);
                println!("Surface {surface} belongs to '{}' of {}", map.id, map.owner);
                println!("  {}", map.describe());
                if let Some((column, row)) = map.position_of(surface) {
                    println!("  column {}, row {}", column + 1, row + 1);
                }
                println!("  tile: {}", tile.display());
            }
            None => println!("Surface {surface} is not managed"),
        },
        Command::Check => {
            let surfaces: Vec<SurfaceId> = session
                .service
                .registry()
                .loaded_stores()
                .iter()
                .flat_map(|store| store.maps())
                .flat_map(|map| map.surfaces().to_vec())
                .collect();
            let total = surfaces.len();
            let painted = session.wait(session.service.init_surfaces(surfaces))?;
            println!("{painted} of {total} surfaces restored from their tiles");
            if painted < total {
                println!("See imagemaps.log for the missing ones");
            }
        }
    }

    session.service.shutdown();
    Ok(())
}

fn main() -> Result<()> {
    let args = CliArgs::parse();
    let data_dir = args.data_dir.clone().unwrap_or_else(settings::default_data_dir);
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("Failed to create {}", data_dir.display()))?;

    WriteLogger::init(
        args.log_level,
        Config::default(),
        File::create(data_dir.join("imagemaps.log"))?,
    )?;
    panic_handler::initialize_panic_handler();

    info!("Starting imagemaps in {}", data_dir.display());
    let result = run(args, data_dir);
    if let Err(e) = &result {
        error!("Command failed: {e:?}");
    }
    info!("Shutting down imagemaps");
    result
}
