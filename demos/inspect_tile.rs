use std::env;
use std::process;

use rf_coverage::terrain::{HGT_VOID, HgtDirectory, TileId, TileSource};

fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() < 4 {
        eprintln!("usage: {} <tile dir> <lat> <lon>", args[0]);
        process::exit(2);
    }
    let (Ok(lat), Ok(lon)) = (args[2].parse::<f64>(), args[3].parse::<f64>()) else {
        eprintln!("lat and lon must be numbers");
        process::exit(2);
    };

    let dir = HgtDirectory::new(&args[1]);
    let id = TileId::containing(lat, lon);
    println!("Loading tile {id}...");
    match dir.load_tile(id) {
        Ok(tile) => {
            println!("Tile loaded! Size: {} ({:?})", tile.size, tile.resolution());
            match tile.elevation_at(lat, lon) {
                Some(h) => println!("Elevation at {lat}, {lon}: {h:.2} m"),
                None => println!("No data at {lat}, {lon}"),
            }

            let voids = tile.data.iter().filter(|&&h| h == HGT_VOID).count();
            let nonzero = tile.data.iter().filter(|&&h| h != 0 && h != HGT_VOID).count();
            println!("Void samples: {} / {}", voids, tile.data.len());
            println!("Non-zero samples: {} / {}", nonzero, tile.data.len());
            if nonzero == 0 {
                println!("WARNING: Tile contains only zeros!");
            }
        }
        Err(e) => {
            eprintln!("Error loading tile: {e}");
            process::exit(1);
        }
    }
}
